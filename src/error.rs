//! Error types.

use core::fmt::Debug;
use std::io;

use thiserror::Error;

use crate::protocol::{Version, MIN_VERSION};
use crate::State;

/// Link level failure of a single bootloader exchange
#[derive(Clone, PartialEq, Debug, Error)]
pub enum Fault<SerialError: Debug> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    #[error("bootloader responded with NACK")]
    Nack,

    #[error("timeout awaiting bootloader response")]
    ResponseTimeout,

    #[error("unexpected bootloader response 0x{0:02x}")]
    InvalidResponse(u8),
}

impl<SerialError: Debug> From<SerialError> for Fault<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

/// Session failures, one per flashing phase.
///
/// All of these are terminal; nothing is rolled back.
#[derive(Clone, PartialEq, Debug, Error)]
pub enum Error<SerialError: Debug> {
    #[error("unable to open serial port {port}: {reason}")]
    PortUnavailable { port: String, reason: String },

    #[error("bootloader is not connected (programmer state {0:?})")]
    NotConnected(State),

    #[error("unable to connect to bootloader: {0}")]
    Sync(Fault<SerialError>),

    #[error("unable to connect to bootloader, no ACK after {attempts} attempts")]
    SyncTimeout { attempts: u32 },

    #[error("unable to get bootloader version: {0}")]
    VersionQuery(Fault<SerialError>),

    #[error("unsupported bootloader version {0}, at least {} is required", MIN_VERSION)]
    UnsupportedVersion(Version),

    #[error("unable to get chip ID: {0}")]
    ChipIdQuery(Fault<SerialError>),

    #[error("unsupported chip ID 0x{0:04X}")]
    UnsupportedChip(u16),

    #[error("unable to execute write unprotect: {0}")]
    Protection(Fault<SerialError>),

    #[error("unable to erase flash: {0}")]
    Erase(Fault<SerialError>),

    #[error("unable to program flash at offset 0x{offset:08x}: {fault}")]
    Program {
        offset: u32,
        fault: Fault<SerialError>,
    },

    #[error("flash contents differ from image at offset 0x{offset:08x}")]
    Verify { offset: u32 },

    #[error("image of {len} bytes does not fit above base address 0x{base:08x}")]
    ImageTooLarge { base: u32, len: u64 },

    #[error("unable to run go command: {0}")]
    Go(Fault<SerialError>),

    #[error("unable to read image file: {0}")]
    ImageFile(io::ErrorKind),
}

impl<SerialError: Debug> Error<SerialError> {
    /// Whether the failure happened after flash contents were touched,
    /// leaving the target erased or partially written
    pub fn leaves_target_modified(&self) -> bool {
        matches!(
            self,
            Error::Erase(_)
                | Error::Program { .. }
                | Error::Verify { .. }
                | Error::ImageTooLarge { .. }
                | Error::ImageFile(_)
        )
    }
}
