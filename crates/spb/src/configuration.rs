use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::SpbError;

/// Current version of the configuration header.
pub const RESOURCE_SPB_DATA_VERSION: u32 = 1;

/// Size of the common configuration header on the wire.
pub const HEADER_SIZE: usize = 24;
/// Size of a complete I2C configuration without vendor data.
pub const I2C_CONFIGURATION_SIZE: usize = HEADER_SIZE + 12;
/// Size of a complete SPI configuration without vendor data.
pub const SPI_CONFIGURATION_SIZE: usize = HEADER_SIZE + 16;
/// Size of a complete UART configuration without vendor data.
pub const UART_CONFIGURATION_SIZE: usize = HEADER_SIZE + 16;

/// Serial bus flavours a controller can expose. Zero is reserved as invalid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive,
)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum BusType {
    I2c = 1,
    Spi = 2,
    Uart = 3,
}

impl BusType {
    /// Wire size of a configuration for this bus type, excluding vendor data.
    pub const fn configuration_size(self) -> usize {
        match self {
            BusType::I2c => I2C_CONFIGURATION_SIZE,
            BusType::Spi => SPI_CONFIGURATION_SIZE,
            BusType::Uart => UART_CONFIGURATION_SIZE,
        }
    }
}

bitflags! {
    /// Flags common to every bus type.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct DataFlags: u32 {
        /// The controller acts as the bus slave.
        const SLAVE = 0x0000_0001;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct I2cFlags: u32 {
        const TEN_BIT_ADDRESSING = 0x0000_0001;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct SpiFlags: u32 {
        /// Sample on the second clock edge (CPHA = 1).
        const SECOND_PHASE = 0x0000_0001;
        /// Clock idles high (CPOL = 1).
        const START_HIGH = 0x0000_0002;
        const THREE_WIRES = 0x0000_0004;
        const DEVICE_SELECT_ACTIVE_HIGH = 0x0000_0008;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct UartFlags: u32 {
        const PARITY_EVEN = 0x0000_0001;
        const PARITY_ODD = 0x0000_0002;
        const PARITY_MARK = 0x0000_0004;
        const PARITY_SPACE = 0x0000_0008;
        const STOP_BITS_NONE = 0x0000_0010;
        const STOP_BITS_1 = 0x0000_0020;
        const STOP_BITS_1_5 = 0x0000_0040;
        const STOP_BITS_2 = 0x0000_0080;
        const FLOW_CONTROL_HARDWARE = 0x0000_0100;
        const FLOW_CONTROL_SOFTWARE = 0x0000_0200;
        const BIG_ENDIAN = 0x0000_0400;

        const PARITY_MASK = Self::PARITY_EVEN.bits()
            | Self::PARITY_ODD.bits()
            | Self::PARITY_MARK.bits()
            | Self::PARITY_SPACE.bits();
        const STOP_BITS_MASK = Self::STOP_BITS_NONE.bits()
            | Self::STOP_BITS_1.bits()
            | Self::STOP_BITS_1_5.bits()
            | Self::STOP_BITS_2.bits();
    }
}

bitflags! {
    /// UART control lines, matching the ACPI serial bus descriptor bits.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct UartControlLines: u16 {
        const DTD = 0x0004;
        const RI = 0x0008;
        const DSR = 0x0010;
        const DTR = 0x0020;
        const CTS = 0x0040;
        const RTS = 0x0080;
    }
}

/// Common header preceding every bus-specific configuration.
///
/// `size` is the declared total size of the configuration including the
/// bus-specific block and any vendor data. The bus type is kept raw so that
/// malformed values survive decoding and are rejected by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationHeader {
    pub version: u32,
    pub size: u32,
    pub bus_type: u32,
    pub flags: DataFlags,
    pub vendor_data_offset: u32,
    pub vendor_data_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct I2cConfiguration {
    pub flags: I2cFlags,
    /// Bus speed in Hertz.
    pub speed: u32,
    pub slave_address: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpiConfiguration {
    pub flags: SpiFlags,
    /// Bus speed in Hertz.
    pub speed: u32,
    /// Word size in bits.
    pub word_size: u32,
    /// Mask of device select lines to assert.
    pub device_select: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UartConfiguration {
    pub flags: UartFlags,
    pub baud_rate: u32,
    pub data_bits: u16,
    pub rx_fifo_size: u16,
    pub tx_fifo_size: u16,
    pub control_lines: UartControlLines,
}

/// Bus-specific portion of a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusConfiguration {
    I2c(I2cConfiguration),
    Spi(SpiConfiguration),
    Uart(UartConfiguration),
}

impl BusConfiguration {
    pub const fn bus_type(&self) -> BusType {
        match self {
            BusConfiguration::I2c(_) => BusType::I2c,
            BusConfiguration::Spi(_) => BusType::Spi,
            BusConfiguration::Uart(_) => BusType::Uart,
        }
    }
}

/// A handle's bus configuration: header, bus-specific block and optional
/// vendor bytes.
///
/// Controllers copy configurations into their own storage and never modify
/// them afterwards; a new configuration always replaces the old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub header: ConfigurationHeader,
    pub bus: BusConfiguration,
    pub vendor_data: Vec<u8>,
}

impl Configuration {
    /// Create a configuration with a consistent header and no vendor data.
    pub fn new(bus: BusConfiguration) -> Self {
        let bus_type = bus.bus_type();
        Self {
            header: ConfigurationHeader {
                version: RESOURCE_SPB_DATA_VERSION,
                size: bus_type.configuration_size() as u32,
                bus_type: bus_type.into(),
                flags: DataFlags::empty(),
                vendor_data_offset: 0,
                vendor_data_size: 0,
            },
            bus,
            vendor_data: Vec::new(),
        }
    }

    pub fn i2c(configuration: I2cConfiguration) -> Self {
        Self::new(BusConfiguration::I2c(configuration))
    }

    pub fn spi(configuration: SpiConfiguration) -> Self {
        Self::new(BusConfiguration::Spi(configuration))
    }

    pub fn uart(configuration: UartConfiguration) -> Self {
        Self::new(BusConfiguration::Uart(configuration))
    }

    /// Append vendor data right after the bus-specific block, growing the
    /// declared size accordingly.
    pub fn with_vendor_data(mut self, vendor_data: Vec<u8>) -> Self {
        let block_size = self.bus.bus_type().configuration_size() as u32;
        let length = vendor_data.len() as u32;
        self.header.vendor_data_offset =
            if length == 0 { 0 } else { block_size };
        self.header.vendor_data_size = length;
        self.header.size = block_size + length;
        self.vendor_data = vendor_data;
        self
    }

    /// The bus type declared in the header, if it is a known one.
    pub fn bus_type(&self) -> Option<BusType> {
        BusType::try_from(self.header.bus_type).ok()
    }

    /// Check the declared sizes and bus type for consistency.
    ///
    /// Fails when the declared size cannot hold the header, when the vendor
    /// data would run past the declared size, or when the header's bus type
    /// is unknown or disagrees with the bus-specific block.
    pub fn validate(&self) -> Result<BusType, SpbError> {
        let size = self.header.size as usize;
        if size < HEADER_SIZE {
            return Err(SpbError::InvalidParameter);
        }

        if self.header.vendor_data_size as usize > size - HEADER_SIZE {
            return Err(SpbError::InvalidParameter);
        }

        let bus_type = self.bus_type().ok_or(SpbError::InvalidParameter)?;
        if bus_type != self.bus.bus_type() {
            return Err(SpbError::InvalidParameter);
        }

        Ok(bus_type)
    }

    /// Parse a configuration from its little-endian wire layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, SpbError> {
        if bytes.len() < HEADER_SIZE {
            return Err(SpbError::InvalidParameter);
        }

        let header = ConfigurationHeader {
            version: LittleEndian::read_u32(&bytes[0..4]),
            size: LittleEndian::read_u32(&bytes[4..8]),
            bus_type: LittleEndian::read_u32(&bytes[8..12]),
            flags: DataFlags::from_bits_retain(LittleEndian::read_u32(
                &bytes[12..16],
            )),
            vendor_data_offset: LittleEndian::read_u32(&bytes[16..20]),
            vendor_data_size: LittleEndian::read_u32(&bytes[20..24]),
        };

        let size = header.size as usize;
        if size < HEADER_SIZE || size > bytes.len() {
            return Err(SpbError::InvalidParameter);
        }

        let bus_type = BusType::try_from(header.bus_type)
            .map_err(|_| SpbError::InvalidParameter)?;

        if size < bus_type.configuration_size() {
            return Err(SpbError::InvalidParameter);
        }

        let block = &bytes[HEADER_SIZE..size];
        let bus = match bus_type {
            BusType::I2c => BusConfiguration::I2c(I2cConfiguration {
                flags: I2cFlags::from_bits_retain(LittleEndian::read_u32(
                    &block[0..4],
                )),
                speed: LittleEndian::read_u32(&block[4..8]),
                slave_address: LittleEndian::read_u16(&block[8..10]),
            }),
            BusType::Spi => BusConfiguration::Spi(SpiConfiguration {
                flags: SpiFlags::from_bits_retain(LittleEndian::read_u32(
                    &block[0..4],
                )),
                speed: LittleEndian::read_u32(&block[4..8]),
                word_size: LittleEndian::read_u32(&block[8..12]),
                device_select: LittleEndian::read_u32(&block[12..16]),
            }),
            BusType::Uart => BusConfiguration::Uart(UartConfiguration {
                flags: UartFlags::from_bits_retain(LittleEndian::read_u32(
                    &block[0..4],
                )),
                baud_rate: LittleEndian::read_u32(&block[4..8]),
                data_bits: LittleEndian::read_u16(&block[8..10]),
                rx_fifo_size: LittleEndian::read_u16(&block[10..12]),
                tx_fifo_size: LittleEndian::read_u16(&block[12..14]),
                control_lines: UartControlLines::from_bits_retain(
                    LittleEndian::read_u16(&block[14..16]),
                ),
            }),
        };

        let vendor_data = vendor_range(&header)
            .map(|range| bytes[range].to_vec())
            .ok_or(SpbError::InvalidParameter)?;

        Ok(Self { header, bus, vendor_data })
    }

    /// Serialize into the little-endian wire layout, `header.size` bytes long.
    pub fn encode(&self) -> Result<Vec<u8>, SpbError> {
        let bus_type = self.validate()?;
        let size = self.header.size as usize;
        if size < bus_type.configuration_size()
            || self.vendor_data.len() != self.header.vendor_data_size as usize
        {
            return Err(SpbError::InvalidParameter);
        }

        let range =
            vendor_range(&self.header).ok_or(SpbError::InvalidParameter)?;
        let mut bytes = vec![0u8; size];
        let header = &self.header;
        LittleEndian::write_u32(&mut bytes[0..4], header.version);
        LittleEndian::write_u32(&mut bytes[4..8], header.size);
        LittleEndian::write_u32(&mut bytes[8..12], header.bus_type);
        LittleEndian::write_u32(&mut bytes[12..16], header.flags.bits());
        LittleEndian::write_u32(&mut bytes[16..20], header.vendor_data_offset);
        LittleEndian::write_u32(&mut bytes[20..24], header.vendor_data_size);

        let block = &mut bytes[HEADER_SIZE..];
        match &self.bus {
            BusConfiguration::I2c(i2c) => {
                LittleEndian::write_u32(&mut block[0..4], i2c.flags.bits());
                LittleEndian::write_u32(&mut block[4..8], i2c.speed);
                LittleEndian::write_u16(&mut block[8..10], i2c.slave_address);
            }
            BusConfiguration::Spi(spi) => {
                LittleEndian::write_u32(&mut block[0..4], spi.flags.bits());
                LittleEndian::write_u32(&mut block[4..8], spi.speed);
                LittleEndian::write_u32(&mut block[8..12], spi.word_size);
                LittleEndian::write_u32(&mut block[12..16], spi.device_select);
            }
            BusConfiguration::Uart(uart) => {
                LittleEndian::write_u32(&mut block[0..4], uart.flags.bits());
                LittleEndian::write_u32(&mut block[4..8], uart.baud_rate);
                LittleEndian::write_u16(&mut block[8..10], uart.data_bits);
                LittleEndian::write_u16(&mut block[10..12], uart.rx_fifo_size);
                LittleEndian::write_u16(&mut block[12..14], uart.tx_fifo_size);
                LittleEndian::write_u16(
                    &mut block[14..16],
                    uart.control_lines.bits(),
                );
            }
        }

        bytes[range].copy_from_slice(&self.vendor_data);
        Ok(bytes)
    }
}

/// Byte range of the vendor data, or `None` if it does not fit inside the
/// declared size.
fn vendor_range(
    header: &ConfigurationHeader,
) -> Option<core::ops::Range<usize>> {
    let size = header.size as usize;
    let length = header.vendor_data_size as usize;
    if length == 0 {
        return Some(0..0);
    }

    if length > size.checked_sub(HEADER_SIZE)? {
        return None;
    }

    let start = header.vendor_data_offset as usize;
    let end = start.checked_add(length)?;
    if start < HEADER_SIZE || end > size {
        return None;
    }

    Some(start..end)
}
