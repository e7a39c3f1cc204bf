use alloc::sync::Arc;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use portable_atomic::{AtomicUsize, Ordering};

use crate::adapter::HostAdapter;
use crate::configuration::Configuration;
use crate::controller::Controller;
use crate::error::SpbError;
use crate::transfer::{Completion, TransferSet};

/// Identifies an open handle within its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HandleId(pub(crate) u32);

/// Per-handle state the controller needs to reach without going through the
/// client's [`Handle`]: the bus reference count, for hand-off, and the event
/// synchronous execution waits on.
pub(crate) struct HandleShared<M: RawMutex> {
    pub(crate) id: HandleId,
    pub(crate) references: AtomicUsize,
    pub(crate) event: Signal<M, TransferSet>,
}

impl<M: RawMutex> HandleShared<M> {
    pub(crate) fn new(id: HandleId) -> Self {
        Self { id, references: AtomicUsize::new(0), event: Signal::new() }
    }
}

/// A client driver's open connection to a controller.
///
/// Dropping the handle closes it. The handle must not hold the bus when it
/// is closed, and at most one synchronous
/// [`execute_transfer_set`](Self::execute_transfer_set) may be outstanding
/// per handle.
pub struct Handle<'c, M: RawMutex, A: HostAdapter> {
    controller: &'c Controller<M, A>,
    shared: Arc<HandleShared<M>>,
}

impl<'c, M: RawMutex, A: HostAdapter> Handle<'c, M, A> {
    /// Create a new handle. Only called by `Controller`.
    pub(crate) fn new(
        controller: &'c Controller<M, A>,
        shared: Arc<HandleShared<M>>,
    ) -> Self {
        Self { controller, shared }
    }

    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    pub fn controller(&self) -> &'c Controller<M, A> {
        self.controller
    }

    /// Current bus reference count of this handle.
    pub fn bus_references(&self) -> usize {
        self.shared.references.load(Ordering::Acquire)
    }

    /// The configuration currently stored for this handle.
    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.controller.configuration_of(self.shared.id)
    }

    /// Validate and store a new configuration. On failure the previous
    /// configuration stays in place.
    pub fn set_configuration(
        &self,
        configuration: &Configuration,
    ) -> Result<(), SpbError> {
        self.controller.set_configuration(&self.shared, configuration)
    }

    /// Acquire the bus for this handle, waiting for the current owner.
    ///
    /// Reentrant: once the handle owns the bus, nested calls only bump the
    /// reference count, and the bus is released when the matching number of
    /// [`unlock_bus`](Self::unlock_bus) calls has been made. A nested call
    /// made while the outermost one is still acquiring waits for it.
    ///
    /// Dropping the future before it completes takes no reference.
    pub async fn lock_bus(&self) {
        self.controller.lock_bus(&self.shared).await
    }

    /// Drop one bus reference. The last one releases the bus or hands it to
    /// the next queued transfer set.
    pub fn unlock_bus(&self) {
        self.controller.unlock_bus(&self.shared)
    }

    /// Queue a transfer set, starting it right away if the bus is idle.
    ///
    /// Success only means the set was accepted; its outcome is delivered to
    /// the callback installed with [`TransferSet::on_complete`]. On failure
    /// the set is handed back untouched.
    pub async fn submit_transfer_set(
        &self,
        set: TransferSet,
    ) -> Result<(), (SpbError, TransferSet)> {
        self.controller.submit_transfer_set(&self.shared, set).await
    }

    /// Run a transfer set and wait for it to complete.
    ///
    /// Any callback installed on the set is replaced. The completed set is
    /// returned with its data; the error carries the set's final status.
    pub async fn execute_transfer_set(
        &self,
        mut set: TransferSet,
    ) -> Result<TransferSet, (SpbError, TransferSet)> {
        self.shared.event.reset();
        set.completion = Completion::Event;
        if let Err((error, mut set)) =
            self.controller.submit_transfer_set(&self.shared, set).await
        {
            set.completion = Completion::None;
            return Err((error, set));
        }

        let set = self.shared.event.wait().await;
        match set.status {
            Some(Err(error)) => Err((error, set)),
            _ => Ok(set),
        }
    }

    /// Close the handle. Equivalent to dropping it.
    pub fn close(self) {
        drop(self);
    }
}

impl<M: RawMutex, A: HostAdapter> Drop for Handle<'_, M, A> {
    fn drop(&mut self) {
        self.controller.close_handle(&self.shared);
    }
}
