//! AN3155 wire constants and frame encoding.

use core::fmt;
use core::num::ParseIntError;

pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Maximum payload of a single write or read memory command
pub const MAX_CHUNK: usize = 256;

/// Start of main flash on all supported parts
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Oldest bootloader this tool will talk to
pub const MIN_VERSION: Version = Version::new(2, 1);

/// Chip identifiers the tool has been validated against
pub const SUPPORTED_CHIP_IDS: [u16; 4] = [0x0410, 0x0414, 0x0413, 0x0440];

#[derive(Debug, PartialEq, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

/// Bootloader protocol version as reported by the GET command
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Decode the packed version byte (0x21 is v2.1)
    pub fn from_byte(v: u8) -> Self {
        Self::new(v >> 4, v & 0x0F)
    }

    /// `major * 256 + minor`, used for ordering against [`MIN_VERSION`]
    pub fn encoded(self) -> u16 {
        u16::from(self.major) << 8 | u16::from(self.minor)
    }

    pub fn is_supported(self) -> bool {
        self.encoded() >= MIN_VERSION.encoded()
    }

    pub fn erase_strategy(self) -> EraseStrategy {
        EraseStrategy::for_major(self.major)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Check a chip identifier against [`SUPPORTED_CHIP_IDS`]
pub fn is_supported_chip(id: u16) -> bool {
    SUPPORTED_CHIP_IDS.contains(&id)
}

/// Whole-chip erase variant, fixed by the bootloader generation
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EraseStrategy {
    /// Erase (0x43) with the global erase parameter
    Legacy,
    /// Extended Erase (0x44) with the 0xFFFF mass erase sentinel
    Extended,
}

impl EraseStrategy {
    pub fn for_major(major: u8) -> Self {
        if major == 3 {
            EraseStrategy::Extended
        } else {
            EraseStrategy::Legacy
        }
    }

    pub fn command(self) -> Command {
        match self {
            EraseStrategy::Legacy => Command::Erase,
            EraseStrategy::Extended => Command::ExtendedErase,
        }
    }

    /// Parameter bytes (including checksum) selecting a full erase
    pub fn erase_all_frame(self) -> &'static [u8] {
        match self {
            EraseStrategy::Legacy => &[0xFF, 0x00],
            EraseStrategy::Extended => &[0xFF, 0xFF, 0x00],
        }
    }
}

impl fmt::Display for EraseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EraseStrategy::Legacy => write!(f, "erase"),
            EraseStrategy::Extended => write!(f, "extended erase"),
        }
    }
}

/// XOR of all bytes
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |c, b| c ^ b)
}

/// Opcode followed by its complement
pub fn command_frame(command: Command) -> [u8; 2] {
    let c = command as u8;
    [c, !c]
}

/// Big-endian address followed by its checksum
pub fn address_frame(address: u32) -> [u8; 5] {
    let a = address.to_be_bytes();
    [a[0], a[1], a[2], a[3], checksum(&a)]
}

/// Write memory payload: `N-1`, data, checksum.
///
/// The bootloader requires the byte count to be a multiple of four, so the
/// data is padded with erased-flash bytes (0xFF) where needed.
pub fn data_frame(data: &[u8]) -> Vec<u8> {
    debug_assert!(!data.is_empty() && data.len() <= MAX_CHUNK);

    let padded = (data.len() + 3) & !3;

    let mut frame = Vec::with_capacity(padded + 2);
    frame.push((padded - 1) as u8);
    frame.extend_from_slice(data);
    frame.resize(padded + 1, 0xFF);

    let c = checksum(&frame);
    frame.push(c);

    frame
}

/// Read memory length parameter: `N-1` and its complement
pub fn read_length_frame(len: usize) -> [u8; 2] {
    debug_assert!(len > 0 && len <= MAX_CHUNK);
    let n = (len - 1) as u8;
    [n, !n]
}

/// Parse a decimal or `0x` prefixed hexadecimal address
pub fn parse_address(s: &str) -> Result<u32, ParseIntError> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}
