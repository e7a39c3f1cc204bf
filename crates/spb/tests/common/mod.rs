#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use spb::{
    BusConfiguration, BusType, Configuration, Controller,
    ControllerInformation, DeviceToken, HostAdapter, I2cConfiguration,
    SpbError, Transfer, TransferFlags, SPB_CONTROLLER_INFORMATION_VERSION,
};

// ---------------------------------------------------------------------------
// Mock host adapter
// ---------------------------------------------------------------------------

/// What the adapter saw, in order. Addresses identify the handle's
/// configuration, tags identify transfers (first data byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Configure(u16),
    Lock(Option<u16>),
    Unlock,
    Submit(u8),
}

/// Shared view of the mock's state so tests can inspect it and drive
/// completions.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    flags: Arc<Mutex<Vec<(u8, TransferFlags)>>>,
    in_flight: Arc<Mutex<VecDeque<Transfer>>>,
    /// Fail the next `configure` call.
    pub fail_configure: Arc<AtomicBool>,
    /// Fail the next `submit_transfer` call.
    pub fail_submit: Arc<AtomicBool>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
        self.flags.lock().unwrap().clear();
    }

    /// Flags each transfer carried when it reached the hardware.
    pub fn flags(&self) -> Vec<(u8, TransferFlags)> {
        self.flags.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn start(&self, transfer: Transfer) {
        let tag = tag(&transfer);
        self.record(Event::Submit(tag));
        self.flags.lock().unwrap().push((tag, transfer.flags));
        self.in_flight.lock().unwrap().push_back(transfer);
    }

    fn take_in_flight(&self) -> Option<Transfer> {
        self.in_flight.lock().unwrap().pop_front()
    }
}

pub struct MockAdapter {
    recorder: Recorder,
}

impl HostAdapter for MockAdapter {
    fn configure(&self, configuration: &Configuration) -> Result<(), SpbError> {
        self.recorder.record(Event::Configure(address(configuration)));
        if self.recorder.fail_configure.swap(false, Ordering::SeqCst) {
            return Err(SpbError::DeviceIo);
        }

        Ok(())
    }

    fn lock_bus(&self, configuration: Option<&Configuration>) {
        self.recorder.record(Event::Lock(configuration.map(address)));
    }

    fn unlock_bus(&self) {
        self.recorder.record(Event::Unlock);
    }

    fn submit_transfer(
        &self,
        transfer: Transfer,
    ) -> Result<(), (SpbError, Transfer)> {
        if self.recorder.fail_submit.swap(false, Ordering::SeqCst) {
            return Err((SpbError::Busy, transfer));
        }

        self.recorder.start(transfer);
        Ok(())
    }
}

pub type TestController = Controller<NoopRawMutex, MockAdapter>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn mock_adapter() -> (MockAdapter, Recorder) {
    let recorder = Recorder::default();
    (MockAdapter { recorder: recorder.clone() }, recorder)
}

pub fn make_controller() -> (TestController, Recorder) {
    let (adapter, recorder) = mock_adapter();
    let information = ControllerInformation {
        version: SPB_CONTROLLER_INFORMATION_VERSION,
        bus_type: BusType::I2c.into(),
        max_frequency: 400_000,
        device: Some(DeviceToken(7)),
        adapter,
    };

    (Controller::new(information).unwrap(), recorder)
}

pub fn i2c(slave_address: u16) -> Configuration {
    Configuration::i2c(I2cConfiguration {
        speed: 100_000,
        slave_address,
        ..Default::default()
    })
}

fn address(configuration: &Configuration) -> u16 {
    match configuration.bus {
        BusConfiguration::I2c(i2c) => i2c.slave_address,
        _ => 0,
    }
}

fn tag(transfer: &Transfer) -> u8 {
    transfer.data().first().copied().unwrap_or(0xff)
}

/// A write transfer identified by `tag` in the adapter trace.
pub fn tagged(tag: u8) -> Transfer {
    Transfer::write(vec![tag, 0x00])
}

/// Act as the adapter's interrupt worker: finish the oldest in-flight
/// transfer and start whatever the core hands back.
pub fn complete(
    controller: &TestController,
    recorder: &Recorder,
    status: Result<(), SpbError>,
) -> bool {
    let Some(transfer) = recorder.take_in_flight() else {
        return false;
    };

    if let Some(next) = controller.transfer_completion(transfer, status) {
        recorder.start(next);
    }

    true
}

/// Collects completed sets delivered to callbacks.
/// Name, final status and processed count of a completed set.
pub type Completed = (&'static str, Option<Result<(), SpbError>>, usize);

#[derive(Clone, Default)]
pub struct Completions {
    sets: Arc<Mutex<Vec<Completed>>>,
}

impl Completions {
    pub fn callback(
        &self,
        name: &'static str,
    ) -> impl FnOnce(spb::TransferSet) + Send + 'static {
        let sets = self.sets.clone();
        move |set| {
            let entry = (name, set.status(), set.processed());
            sets.lock().unwrap().push(entry);
        }
    }

    pub fn all(&self) -> Vec<Completed> {
        self.sets.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.all().into_iter().map(|(name, _, _)| name).collect()
    }
}
