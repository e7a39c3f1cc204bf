#![no_std]
//! Memory-backed [`HostAdapter`] for the SPB core.
//!
//! Each target on the bus (an I2C slave address or an SPI device-select
//! line) is a small register file. The first byte written in a transfer set
//! selects the register, later bytes are written from there on and reads
//! continue from the same pointer, the way most sensor register maps behave.
//!
//! Transfers are not executed when they are submitted. They wait until
//! [`LoopbackAdapter::service`] runs, which plays the part of the adapter's
//! interrupt worker and drives [`Controller::transfer_completion`].

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use spb::{
    BusConfiguration, Configuration, Controller, HostAdapter, I2cFlags,
    SpbError, Transfer, TransferDirection,
};

const MAX_SEVEN_BIT_ADDRESS: u16 = 0x7f;
const MAX_TEN_BIT_ADDRESS: u16 = 0x3ff;

/// Largest register file a target can have; the register pointer is one byte.
pub const MAX_REGISTERS: usize = 256;

/// Counters kept by the adapter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Statistics {
    pub configurations: u32,
    pub locks: u32,
    pub unlocks: u32,
    /// Transfers completed, successfully or not.
    pub transfers: u32,
    pub failures: u32,
    pub bytes_written: usize,
    pub bytes_read: usize,
}

struct Device {
    registers: Vec<u8>,
    pointer: usize,
}

impl Device {
    fn seek(&mut self, register: u8) -> Result<(), SpbError> {
        let register = usize::from(register);
        if register >= self.registers.len() {
            return Err(SpbError::NoAcknowledge);
        }

        self.pointer = register;
        Ok(())
    }

    fn advance(&mut self) {
        self.pointer = (self.pointer + 1) % self.registers.len();
    }

    fn write(&mut self, value: u8) {
        self.registers[self.pointer] = value;
        self.advance();
    }

    fn read(&mut self) -> u8 {
        let value = self.registers[self.pointer];
        self.advance();
        value
    }

    fn exchange(&mut self, value: u8) -> u8 {
        let slot = &mut self.registers[self.pointer];
        let previous = core::mem::replace(slot, value);
        self.advance();
        previous
    }
}

struct State {
    devices: BTreeMap<u32, Device>,
    /// Target selected by the last successful `configure`.
    target: Option<u32>,
    pending: VecDeque<Transfer>,
    fault: Option<SpbError>,
    statistics: Statistics,
}

impl State {
    fn execute(&mut self, transfer: &mut Transfer) -> Result<(), SpbError> {
        self.statistics.transfers += 1;
        let result = self.move_data(transfer);
        if result.is_err() {
            self.statistics.failures += 1;
        }

        result
    }

    fn move_data(&mut self, transfer: &mut Transfer) -> Result<(), SpbError> {
        if let Some(error) = self.fault.take() {
            return Err(error);
        }

        let target = self.target.ok_or(SpbError::NotConfigured)?;
        let device =
            self.devices.get_mut(&target).ok_or(SpbError::NoAcknowledge)?;
        let first = transfer.is_first();
        let direction = transfer.direction;
        let data = transfer.data_mut();
        let size = data.len();
        match direction {
            TransferDirection::Out => {
                let mut bytes = data.iter();
                if first {
                    if let Some(&register) = bytes.next() {
                        device.seek(register)?;
                    }
                }

                for &byte in bytes {
                    device.write(byte);
                }

                transfer.transmit_size_completed = size;
                self.statistics.bytes_written += size;
            }
            TransferDirection::In => {
                for byte in data.iter_mut() {
                    *byte = device.read();
                }

                transfer.receive_size_completed = size;
                self.statistics.bytes_read += size;
            }
            TransferDirection::Both => {
                for byte in data.iter_mut() {
                    *byte = device.exchange(*byte);
                }

                transfer.transmit_size_completed = size;
                transfer.receive_size_completed = size;
                self.statistics.bytes_written += size;
                self.statistics.bytes_read += size;
            }
        }

        Ok(())
    }
}

/// A host adapter whose bus is a set of in-memory register files.
pub struct LoopbackAdapter<M: RawMutex> {
    state: BlockingMutex<M, RefCell<State>>,
}

impl<M: RawMutex> LoopbackAdapter<M> {
    pub fn new() -> Self {
        Self {
            state: BlockingMutex::new(RefCell::new(State {
                devices: BTreeMap::new(),
                target: None,
                pending: VecDeque::new(),
                fault: None,
                statistics: Statistics::default(),
            })),
        }
    }

    /// Attach a zeroed register file at `target`, replacing any device
    /// already there.
    pub fn add_device(
        &self,
        target: u32,
        registers: usize,
    ) -> Result<(), SpbError> {
        if registers == 0 || registers > MAX_REGISTERS {
            return Err(SpbError::InvalidParameter);
        }

        self.state.lock(|state| {
            state.borrow_mut().devices.insert(
                target,
                Device { registers: vec![0; registers], pointer: 0 },
            );
        });

        Ok(())
    }

    pub fn remove_device(&self, target: u32) -> bool {
        self.state
            .lock(|state| state.borrow_mut().devices.remove(&target).is_some())
    }

    pub fn register(&self, target: u32, register: u8) -> Option<u8> {
        self.state.lock(|state| {
            let state = state.borrow();
            state
                .devices
                .get(&target)
                .and_then(|device| device.registers.get(usize::from(register)))
                .copied()
        })
    }

    pub fn set_register(
        &self,
        target: u32,
        register: u8,
        value: u8,
    ) -> Result<(), SpbError> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let register = usize::from(register);
            let slot = state
                .devices
                .get_mut(&target)
                .and_then(|device| device.registers.get_mut(register))
                .ok_or(SpbError::InvalidParameter)?;

            *slot = value;
            Ok(())
        })
    }

    /// Target selected by the last configuration.
    pub fn target(&self) -> Option<u32> {
        self.state.lock(|state| state.borrow().target)
    }

    pub fn statistics(&self) -> Statistics {
        self.state.lock(|state| state.borrow().statistics)
    }

    /// Transfers waiting for [`service`](Self::service).
    pub fn pending(&self) -> usize {
        self.state.lock(|state| state.borrow().pending.len())
    }

    /// Fail the next transfer with `error` instead of executing it.
    pub fn inject_fault(&self, error: SpbError) {
        self.state.lock(|state| state.borrow_mut().fault = Some(error));
    }

    /// Execute pending transfers and report them to `controller`, starting
    /// whatever it hands back, until nothing is left to do.
    ///
    /// `controller` must be the controller this adapter is registered with.
    /// Returns the number of transfers completed.
    pub fn service(&self, controller: &Controller<M, Self>) -> usize {
        let mut completed = 0;
        while let Some((transfer, status)) = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let mut transfer = state.pending.pop_front()?;
            let status = state.execute(&mut transfer);
            Some((transfer, status))
        }) {
            #[cfg(feature = "defmt")]
            if let Err(error) = status {
                defmt::debug!("loopback: transfer failed: {}", error);
            }

            completed += 1;
            let next = controller.transfer_completion(transfer, status);
            if let Some(next) = next {
                self.state
                    .lock(|state| state.borrow_mut().pending.push_back(next));
            }
        }

        completed
    }
}

impl<M: RawMutex> Default for LoopbackAdapter<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> HostAdapter for LoopbackAdapter<M> {
    fn configure(&self, configuration: &Configuration) -> Result<(), SpbError> {
        let target = match &configuration.bus {
            BusConfiguration::I2c(i2c) => {
                let max = if i2c.flags.contains(I2cFlags::TEN_BIT_ADDRESSING) {
                    MAX_TEN_BIT_ADDRESS
                } else {
                    MAX_SEVEN_BIT_ADDRESS
                };

                if i2c.slave_address > max {
                    return Err(SpbError::InvalidParameter);
                }

                u32::from(i2c.slave_address)
            }
            BusConfiguration::Spi(spi) => {
                // Exactly one select line.
                if spi.device_select.count_ones() != 1 {
                    return Err(SpbError::InvalidParameter);
                }

                spi.device_select
            }
            BusConfiguration::Uart(_) => return Err(SpbError::NotSupported),
        };

        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.target = Some(target);
            state.statistics.configurations += 1;
        });

        Ok(())
    }

    fn lock_bus(&self, _configuration: Option<&Configuration>) {
        self.state.lock(|state| state.borrow_mut().statistics.locks += 1);
    }

    fn unlock_bus(&self) {
        self.state.lock(|state| state.borrow_mut().statistics.unlocks += 1);
    }

    fn submit_transfer(
        &self,
        transfer: Transfer,
    ) -> Result<(), (SpbError, Transfer)> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if !state.pending.is_empty() {
                return Err((SpbError::Busy, transfer));
            }

            state.pending.push_back(transfer);
            Ok(())
        })
    }
}
