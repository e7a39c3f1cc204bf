use crate::configuration::{BusType, Configuration};
use crate::error::SpbError;
use crate::transfer::Transfer;

/// Hardware-specific half of a controller, implemented by each host
/// controller driver.
///
/// The core serializes calls per bus: `configure` and `submit_transfer` are
/// only invoked by the handle that currently owns the bus, and never while
/// the controller's structural lock is held.
pub trait HostAdapter {
    /// Program the hardware for a new configuration (speed, address, mode).
    fn configure(&self, configuration: &Configuration) -> Result<(), SpbError>;

    /// The bus has been acquired by a handle with the given configuration.
    fn lock_bus(&self, configuration: Option<&Configuration>);

    /// The bus has been released by its owner.
    fn unlock_bus(&self);

    /// Start a transfer.
    ///
    /// The adapter may return as soon as the transfer is started and report
    /// the outcome later through
    /// [`transfer_completion`](crate::Controller::transfer_completion), then
    /// keep submitting the transfers it hands back until it returns
    /// `None`. On failure the transfer is handed back with the error.
    fn submit_transfer(
        &self,
        transfer: Transfer,
    ) -> Result<(), (SpbError, Transfer)>;
}

/// Opaque identity of the host device a controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceToken(pub u64);

/// Resource types the device framework arbitrates for a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResourceType {
    /// Bus numbers handed to the child devices of a simple peripheral bus.
    SimpleBus,
}

/// Identifies the SPB client interface published for each started controller.
pub const SPB_INTERFACE_UUID: [u32; 4] =
    [0xC56A4C42, 0x4D2511E5, 0x98F108E6, 0xEB8E6BF4];

/// What a controller publishes so client drivers can find it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceDescriptor {
    pub uuid: [u32; 4],
    pub device: DeviceToken,
    pub bus_type: BusType,
}

/// Device framework services used while starting and stopping a controller.
pub trait DeviceServices {
    /// Create the arbiter for `resource` on `device`. Returns
    /// [`SpbError::AlreadyInitialized`] if it already exists.
    fn create_resource_arbiter(
        &self,
        device: DeviceToken,
        resource: ResourceType,
    ) -> Result<(), SpbError>;

    fn publish_interface(
        &self,
        interface: &InterfaceDescriptor,
    ) -> Result<(), SpbError>;

    fn retract_interface(&self, interface: &InterfaceDescriptor);
}
