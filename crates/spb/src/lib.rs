#![no_std]
//! Simple Peripheral Bus (SPB) arbitration core.
//!
//! A host controller driver registers a [`Controller`] for its physical bus
//! (I2C, SPI or UART) and implements [`HostAdapter`] to program the hardware.
//! Client drivers open [`Handle`]s on the controller and submit
//! [`TransferSet`]s. The core guarantees that the transfers of one set are
//! never interleaved with another handle's transfers, queues sets in FIFO
//! order, and hands the bus directly from one handle to the next queued one
//! without ever letting a third party grab it in between.
//!
//! There are no worker tasks. Sets run on the submitter's context or on the
//! context the adapter reports completion from (typically an interrupt
//! worker), which is why [`Controller::transfer_completion`] hands the next
//! transfer back to the adapter instead of submitting it itself.

extern crate alloc;

mod adapter;
mod configuration;
mod controller;
mod error;
mod handle;
mod transfer;

pub use adapter::{
    DeviceServices, DeviceToken, HostAdapter, InterfaceDescriptor,
    ResourceType, SPB_INTERFACE_UUID,
};
pub use configuration::{
    BusConfiguration, BusType, Configuration, ConfigurationHeader, DataFlags,
    I2cConfiguration, I2cFlags, SpiConfiguration, SpiFlags, UartConfiguration,
    UartControlLines, UartFlags, HEADER_SIZE, I2C_CONFIGURATION_SIZE,
    RESOURCE_SPB_DATA_VERSION, SPI_CONFIGURATION_SIZE,
    UART_CONFIGURATION_SIZE,
};
pub use controller::{
    Controller, ControllerInformation, SPB_CONTROLLER_INFORMATION_MAX_VERSION,
    SPB_CONTROLLER_INFORMATION_VERSION,
};
pub use error::SpbError;
pub use handle::{Handle, HandleId};
pub use transfer::{Transfer, TransferDirection, TransferFlags, TransferSet};
