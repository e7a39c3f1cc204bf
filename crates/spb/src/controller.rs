use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::waitqueue::MultiWakerRegistration;
use portable_atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::adapter::{
    DeviceServices, DeviceToken, HostAdapter, InterfaceDescriptor,
    ResourceType, SPB_INTERFACE_UUID,
};
use crate::configuration::{BusType, Configuration};
use crate::error::SpbError;
use crate::handle::{Handle, HandleId, HandleShared};
use crate::transfer::{Completion, Transfer, TransferFlags, TransferSet};

/// Oldest registration layout the core understands.
pub const SPB_CONTROLLER_INFORMATION_VERSION: u32 = 1;
/// Newest registration layout the core understands.
pub const SPB_CONTROLLER_INFORMATION_MAX_VERSION: u32 = 0x1000;

/// Lock waiters tracked at once. More waiters are woken early and poll again.
const LOCK_WAITERS: usize = 8;

/// Registration supplied by a host controller driver.
pub struct ControllerInformation<A> {
    pub version: u32,
    /// Raw [`BusType`] value; zero and unknown values are rejected.
    pub bus_type: u32,
    /// Maximum bus frequency in Hertz, informational.
    pub max_frequency: u32,
    pub device: Option<DeviceToken>,
    pub adapter: A,
}

struct HandleEntry<M: RawMutex> {
    shared: Arc<HandleShared<M>>,
    configuration: Option<Arc<Configuration>>,
}

/// A submitted transfer set as stored in the controller queue.
///
/// Transfers are kept in slots so the one in flight can be lent to the
/// adapter and put back when it completes.
struct QueuedSet<M: RawMutex> {
    id: u32,
    owner: Arc<HandleShared<M>>,
    slots: Vec<Option<Transfer>>,
    processed: usize,
    completion: Completion,
}

impl<M: RawMutex> QueuedSet<M> {
    fn new(id: u32, owner: Arc<HandleShared<M>>, set: TransferSet) -> Self {
        let TransferSet { transfers, completion, .. } = set;
        Self {
            id,
            owner,
            slots: transfers.into_iter().map(Some).collect(),
            processed: 0,
            completion,
        }
    }

    fn finish(
        self,
        status: Result<(), SpbError>,
    ) -> (Arc<HandleShared<M>>, TransferSet, Completion) {
        let transfers = self.slots.into_iter().flatten().collect();
        let mut set = TransferSet::new(transfers);
        set.status = Some(status);
        set.processed = self.processed;
        (self.owner, set, self.completion)
    }
}

/// State of the bus-ownership lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bus {
    Free,
    /// Ownership is being taken or given up and the adapter is being told.
    /// Nobody can acquire or join the bus in this state.
    Changing,
    Owned(HandleId),
}

enum Step {
    Next(Transfer),
    Complete,
    Stray,
}

struct State<M: RawMutex> {
    handles: Vec<HandleEntry<M>>,
    queue: VecDeque<QueuedSet<M>>,
    /// Id of the executing set. When set it is always the queue head.
    current: Option<u32>,
    /// Configuration the hardware was last programmed with, compared by
    /// identity.
    configured: Option<Arc<Configuration>>,
    bus: Bus,
    /// Tasks waiting in `lock_bus`.
    waiters: MultiWakerRegistration<LOCK_WAITERS>,
}

impl<M: RawMutex> State<M> {
    fn configuration_of(&self, id: HandleId) -> Option<Arc<Configuration>> {
        self.handles
            .iter()
            .find(|entry| entry.shared.id == id)
            .and_then(|entry| entry.configuration.clone())
    }

    fn current_set_mut(&mut self) -> Option<&mut QueuedSet<M>> {
        let id = self.current?;
        self.queue.front_mut().filter(|set| set.id == id)
    }

    fn current_owner(&self) -> Option<&Arc<HandleShared<M>>> {
        let id = self.current?;
        self.queue.front().filter(|set| set.id == id).map(|set| &set.owner)
    }
}

/// A simple peripheral bus controller shared by any number of handles.
///
/// Two locks guard it. The structural lock (a blocking mutex over `M`)
/// protects the handle list, the queue, the current set, the configuration
/// cache and the bus owner; it is only held for bookkeeping and never across
/// an adapter call. The bus-ownership lock is the owner recorded in that
/// state: one handle at a time holds it across hardware operations, and on
/// hand-off it passes to the next queued set without ever being free.
///
/// A handle's bus reference count only grows once the handle owns the bus,
/// so a task still waiting in `lock_bus` never counts as an owner.
pub struct Controller<M: RawMutex, A: HostAdapter> {
    bus_type: BusType,
    max_frequency: u32,
    device: DeviceToken,
    adapter: A,
    state: BlockingMutex<M, RefCell<State<M>>>,
    // Mirror of `queue.len()`, only written under the structural lock.
    pending: AtomicUsize,
    next_id: AtomicU32,
}

impl<M: RawMutex, A: HostAdapter> Controller<M, A> {
    /// Validate a host controller registration and create its controller.
    pub fn new(
        information: ControllerInformation<A>,
    ) -> Result<Self, SpbError> {
        if information.version < SPB_CONTROLLER_INFORMATION_VERSION
            || information.version > SPB_CONTROLLER_INFORMATION_MAX_VERSION
        {
            return Err(SpbError::InvalidParameter);
        }

        let bus_type = BusType::try_from(information.bus_type)
            .map_err(|_| SpbError::InvalidParameter)?;

        let device = information.device.ok_or(SpbError::InvalidParameter)?;
        Ok(Self {
            bus_type,
            max_frequency: information.max_frequency,
            device,
            adapter: information.adapter,
            state: BlockingMutex::new(RefCell::new(State {
                handles: Vec::new(),
                queue: VecDeque::new(),
                current: None,
                configured: None,
                bus: Bus::Free,
                waiters: MultiWakerRegistration::new(),
            })),
            pending: AtomicUsize::new(0),
            next_id: AtomicU32::new(1),
        })
    }

    /// Make the controller visible to client drivers.
    ///
    /// Creates the bus-number arbiter on first start; an arbiter that already
    /// exists is not an error.
    pub fn start<S: DeviceServices>(
        &self,
        services: &S,
    ) -> Result<(), SpbError> {
        let arbiter = services
            .create_resource_arbiter(self.device, ResourceType::SimpleBus);
        match arbiter {
            Ok(()) | Err(SpbError::AlreadyInitialized) => {}
            Err(error) => {
                #[cfg(feature = "defmt")]
                defmt::error!("SPB: failed to create bus arbiter: {}", error);
                return Err(error);
            }
        }

        services.publish_interface(&self.interface())
    }

    /// Withdraw the controller's interface. All handles must be closed.
    pub fn stop<S: DeviceServices>(&self, services: &S) {
        assert_eq!(
            self.handle_count(),
            0,
            "stopping a controller with open handles"
        );
        services.retract_interface(&self.interface());
    }

    pub fn interface(&self) -> InterfaceDescriptor {
        InterfaceDescriptor {
            uuid: SPB_INTERFACE_UUID,
            device: self.device,
            bus_type: self.bus_type,
        }
    }

    pub fn bus_type(&self) -> BusType {
        self.bus_type
    }

    pub fn max_frequency(&self) -> u32 {
        self.max_frequency
    }

    pub fn device(&self) -> DeviceToken {
        self.device
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn handle_count(&self) -> usize {
        self.state.lock(|state| state.borrow().handles.len())
    }

    /// Number of submitted sets not yet completed, including the executing one.
    pub fn pending_sets(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Open a handle with an initial configuration.
    pub fn open(
        &self,
        configuration: &Configuration,
    ) -> Result<Handle<'_, M, A>, SpbError> {
        let configuration = self.copy_configuration(configuration)?;
        self.insert_handle(Some(configuration))
    }

    /// Open a handle without a configuration. Transfer sets submitted on it
    /// fail with [`SpbError::NotConfigured`] until one is set.
    pub fn open_unconfigured(&self) -> Result<Handle<'_, M, A>, SpbError> {
        self.insert_handle(None)
    }

    fn insert_handle(
        &self,
        configuration: Option<Arc<Configuration>>,
    ) -> Result<Handle<'_, M, A>, SpbError> {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(HandleShared::new(id));
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state
                .handles
                .try_reserve(1)
                .map_err(|_| SpbError::InsufficientResources)?;

            state
                .handles
                .push(HandleEntry { shared: shared.clone(), configuration });
            Ok(())
        })?;

        Ok(Handle::new(self, shared))
    }

    fn copy_configuration(
        &self,
        configuration: &Configuration,
    ) -> Result<Arc<Configuration>, SpbError> {
        if configuration.validate()? != self.bus_type {
            return Err(SpbError::InvalidParameter);
        }

        Ok(Arc::new(configuration.clone()))
    }

    pub(crate) fn configuration_of(
        &self,
        id: HandleId,
    ) -> Option<Arc<Configuration>> {
        self.state.lock(|state| state.borrow().configuration_of(id))
    }

    pub(crate) fn set_configuration(
        &self,
        shared: &HandleShared<M>,
        configuration: &Configuration,
    ) -> Result<(), SpbError> {
        let configuration = self.copy_configuration(configuration)?;
        let previous = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let State { handles, configured, .. } = &mut *state;
            let entry =
                handles.iter_mut().find(|entry| entry.shared.id == shared.id)?;
            let previous = entry.configuration.replace(configuration)?;
            let cached = configured
                .as_ref()
                .is_some_and(|cached| Arc::ptr_eq(cached, &previous));
            if cached {
                *configured = None;
            }

            Some(previous)
        });

        drop(previous);
        Ok(())
    }

    pub(crate) fn close_handle(&self, shared: &HandleShared<M>) {
        debug_assert_eq!(
            shared.references.load(Ordering::Acquire),
            0,
            "closing a handle that still holds the bus"
        );

        let removed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let position = state
                .handles
                .iter()
                .position(|entry| entry.shared.id == shared.id)?;

            let entry = state.handles.remove(position);
            let cached = state
                .configured
                .as_ref()
                .zip(entry.configuration.as_ref())
                .is_some_and(|(cached, own)| Arc::ptr_eq(cached, own));

            if cached {
                state.configured = None;
            }

            Some(entry)
        });

        drop(removed);
    }

    /// Take the bus for `shared`, or join its ownership if the handle
    /// already holds it. Cancelling the wait leaves nothing behind.
    pub(crate) async fn lock_bus(&self, shared: &HandleShared<M>) {
        let acquired = poll_fn(|cx| {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                let bus = state.bus;
                match bus {
                    Bus::Owned(owner) if owner == shared.id => {
                        shared.references.fetch_add(1, Ordering::AcqRel);
                        Poll::Ready(false)
                    }
                    Bus::Free => {
                        state.bus = Bus::Changing;
                        shared.references.store(1, Ordering::Release);
                        Poll::Ready(true)
                    }
                    _ => {
                        state.waiters.register(cx.waker());
                        Poll::Pending
                    }
                }
            })
        })
        .await;

        if acquired {
            let configuration = self.configuration_of(shared.id);
            self.adapter.lock_bus(configuration.as_deref());
            self.grant(shared.id);
        }
    }

    /// Finish a change of ownership and let waiters look again.
    fn grant(&self, id: HandleId) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.bus = Bus::Owned(id);
            state.waiters.wake();
        });
    }

    pub(crate) fn unlock_bus(&self, shared: &HandleShared<M>) {
        let released = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            debug_assert_eq!(
                state.bus,
                Bus::Owned(shared.id),
                "unlocking a bus the handle does not own"
            );

            let previous = shared.references.fetch_sub(1, Ordering::AcqRel);
            debug_assert_ne!(previous, 0, "unbalanced bus unlock");
            if previous != 1 {
                return false;
            }

            state.bus = Bus::Changing;
            true
        });

        if !released {
            return;
        }

        self.adapter.unlock_bus();

        // Something is queued and nothing runs: promote the queue head
        // without freeing the bus, so no other handle can slip in.
        let next = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let head =
                state.queue.front().map(|set| (set.id, set.owner.clone()));
            if let (None, Some((id, owner))) = (state.current, head) {
                owner.references.store(1, Ordering::Release);
                let configuration = state.configuration_of(owner.id);
                state.current = Some(id);
                return Some((owner, configuration));
            }

            state.bus = Bus::Free;
            state.waiters.wake();
            None
        });

        let Some((owner, configuration)) = next else {
            return;
        };

        #[cfg(feature = "defmt")]
        defmt::trace!("SPB: handing bus to handle {}", owner.id);
        self.adapter.lock_bus(configuration.as_deref());
        self.grant(owner.id);
        self.execute_current_set();
    }

    pub(crate) async fn submit_transfer_set(
        &self,
        shared: &Arc<HandleShared<M>>,
        mut set: TransferSet,
    ) -> Result<(), (SpbError, TransferSet)> {
        if !set.transfers.iter().all(Transfer::is_well_formed) {
            return Err((SpbError::InvalidParameter, set));
        }

        set.status = None;
        set.processed = 0;
        let claimed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.configuration_of(shared.id).is_none() {
                return Err((SpbError::NotConfigured, set));
            }

            if state.queue.try_reserve(1).is_err() {
                return Err((SpbError::InsufficientResources, set));
            }

            // Only claim an idle bus when nothing is waiting ahead, otherwise
            // the pending hand-off would be overtaken.
            let claim = state.current.is_none() && state.queue.is_empty();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            state.queue.push_back(QueuedSet::new(id, shared.clone(), set));
            self.pending.store(state.queue.len(), Ordering::Release);
            if claim {
                state.current = Some(id);
            }

            Ok(claim)
        })?;

        if claimed {
            self.lock_bus(shared).await;
            self.execute_current_set();
        }

        Ok(())
    }

    /// Start the executing set. The set's owner holds the bus.
    fn execute_current_set(&self) {
        let prepared = self.state.lock(|state| {
            let state = state.borrow();
            let owner = state.current_owner()?;
            let configuration = state.configuration_of(owner.id);
            let reconfigure = match (&configuration, &state.configured) {
                (Some(configuration), Some(cached)) => {
                    !Arc::ptr_eq(configuration, cached)
                }
                _ => true,
            };

            Some((configuration, reconfigure))
        });

        let Some((configuration, reconfigure)) = prepared else {
            debug_assert!(false, "executing without a current transfer set");
            return;
        };

        let Some(configuration) = configuration else {
            self.complete_transfer_set(Err(SpbError::NotConfigured));
            return;
        };

        if reconfigure {
            if let Err(error) = self.adapter.configure(&configuration) {
                #[cfg(feature = "defmt")]
                defmt::warn!("SPB: configure failed: {}", error);
                self.complete_transfer_set(Err(error));
                return;
            }

            self.state.lock(|state| {
                state.borrow_mut().configured = Some(configuration);
            });
        }

        let first = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let set = state.current_set_mut()?;
            let count = set.slots.len();
            let mut transfer = set.slots.first_mut()?.take()?;
            transfer.flags.remove(TransferFlags::AUTO_MASK);
            transfer.flags.insert(TransferFlags::FIRST);
            if count == 1 {
                transfer.flags.insert(TransferFlags::LAST);
            }

            Some(transfer)
        });

        // No transfers: a configuration-only transaction.
        let Some(transfer) = first else {
            self.complete_transfer_set(Ok(()));
            return;
        };

        if let Err((error, transfer)) = self.adapter.submit_transfer(transfer) {
            #[cfg(feature = "defmt")]
            defmt::warn!("SPB: submit failed: {}", error);
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                let slot = state
                    .current_set_mut()
                    .and_then(|set| set.slots.first_mut());
                if let Some(slot) = slot {
                    *slot = Some(transfer);
                }
            });

            self.complete_transfer_set(Err(error));
        }
    }

    /// Report the outcome of the transfer the adapter was working on.
    ///
    /// Safe to call from interrupt context: it never blocks on the bus.
    /// Returns the next transfer of the set, which the adapter must start
    /// and report the same way, or `None` once the set is finished (on the
    /// last transfer or on the first failure). Finishing a set may start the
    /// next queued one, which reaches the adapter through
    /// [`HostAdapter::submit_transfer`].
    pub fn transfer_completion(
        &self,
        transfer: Transfer,
        status: Result<(), SpbError>,
    ) -> Option<Transfer> {
        let step = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let Some(set) = state.current_set_mut() else {
                return Step::Stray;
            };

            if let Some(slot) = set.slots.get_mut(set.processed) {
                *slot = Some(transfer);
            }

            set.processed += 1;
            if status.is_err() || set.processed >= set.slots.len() {
                return Step::Complete;
            }

            let last = set.processed + 1 == set.slots.len();
            match set.slots[set.processed].take() {
                Some(mut next) => {
                    next.flags.remove(TransferFlags::AUTO_MASK);
                    if last {
                        next.flags.insert(TransferFlags::LAST);
                    }

                    Step::Next(next)
                }
                None => Step::Complete,
            }
        });

        match step {
            Step::Next(next) => Some(next),
            Step::Complete => {
                self.complete_transfer_set(status);
                None
            }
            Step::Stray => {
                debug_assert!(
                    false,
                    "transfer completed with no set executing"
                );
                None
            }
        }
    }

    /// Finish the executing set: dequeue it, release or hand off the bus,
    /// then notify the owner. The bus goes first because the owner may reuse
    /// or drop the set as soon as it is notified.
    fn complete_transfer_set(&self, status: Result<(), SpbError>) {
        let finished = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let id = state.current.take()?;
            let position = state.queue.iter().position(|set| set.id == id)?;
            let set = state.queue.remove(position);
            self.pending.store(state.queue.len(), Ordering::Release);
            set
        });

        let Some(queued) = finished else {
            return;
        };

        #[cfg(feature = "defmt")]
        if let Err(error) = status {
            defmt::debug!("SPB: transfer set failed: {}", error);
        }

        let (owner, set, completion) = queued.finish(status);
        self.unlock_bus(&owner);
        match completion {
            Completion::None => {}
            Completion::Callback(callback) => callback(set),
            Completion::Event => owner.event.signal(set),
        }
    }
}

impl<M: RawMutex, A: HostAdapter> Drop for Controller<M, A> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.handle_count(),
            0,
            "destroying a controller with open handles"
        );
    }
}
