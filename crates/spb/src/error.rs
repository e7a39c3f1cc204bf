/// Status codes reported by the SPB core and passed through from host
/// adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpbError {
    /// A registration, configuration or transfer was malformed, or its bus
    /// type does not match the controller.
    InvalidParameter,
    /// An allocation failed.
    InsufficientResources,
    /// A transfer set was submitted on a handle that has no configuration.
    NotConfigured,
    /// The resource arbiter already exists. Treated as success by
    /// [`Controller::start`](crate::Controller::start).
    AlreadyInitialized,
    /// The adapter does not support the requested mode.
    NotSupported,
    /// The hardware reported an I/O error.
    DeviceIo,
    /// The hardware did not finish in time.
    Timeout,
    /// The addressed device did not acknowledge.
    NoAcknowledge,
    /// The hardware is busy with another transfer.
    Busy,
}

impl core::fmt::Display for SpbError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SpbError::InvalidParameter => write!(f, "Invalid parameter"),
            SpbError::InsufficientResources => {
                write!(f, "Insufficient resources")
            }
            SpbError::NotConfigured => {
                write!(f, "Handle has no bus configuration")
            }
            SpbError::AlreadyInitialized => write!(f, "Already initialized"),
            SpbError::NotSupported => write!(f, "Not supported"),
            SpbError::DeviceIo => write!(f, "Device I/O error"),
            SpbError::Timeout => write!(f, "Timed out"),
            SpbError::NoAcknowledge => write!(f, "Device did not acknowledge"),
            SpbError::Busy => write!(f, "Device busy"),
        }
    }
}
