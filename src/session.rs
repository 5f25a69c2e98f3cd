//! Flashing session: the fixed connect, identify, erase, program, go sequence.

use core::fmt::Debug;
use std::path::PathBuf;

use embedded_hal::blocking::delay::DelayMs;
use thiserror::Error as ThisError;

use crate::error::Error;
use crate::image::DataSource;
use crate::progress::ProgramProgress;
use crate::protocol::{self, EraseStrategy, Version};
use crate::{Programmer, SerialPort};

/// Invalid user configuration, detected before the port is opened
#[derive(Clone, PartialEq, Debug, ThisError)]
pub enum ConfigError {
    #[error("no UART port selected")]
    MissingPort,

    #[error("no image file selected, pass a file or skip flashing")]
    MissingImage,

    #[error("invalid baud rate {0}")]
    InvalidBaud(usize),
}

/// Validated flashing configuration
#[derive(Clone, PartialEq, Debug)]
pub struct Plan {
    pub port: String,
    pub baud: usize,
    /// Image to flash, `None` to only probe the device
    pub image: Option<PathBuf>,
    /// Start the application once done
    pub go: bool,
}

impl Plan {
    pub const DEFAULT_BAUD: usize = 9600;

    /// Image path meaning "do not flash"
    pub const SKIP_IMAGE: &'static str = "0";

    pub fn new(
        port: impl Into<String>,
        baud: usize,
        image: Option<String>,
        skip_flash: bool,
        go: bool,
    ) -> Result<Self, ConfigError> {
        let port = port.into();
        if port.trim().is_empty() {
            return Err(ConfigError::MissingPort);
        }
        if baud == 0 {
            return Err(ConfigError::InvalidBaud(baud));
        }

        let image = match image {
            _ if skip_flash => None,
            Some(ref f) if f == Self::SKIP_IMAGE => None,
            Some(ref f) if f.trim().is_empty() => return Err(ConfigError::MissingImage),
            Some(f) => Some(PathBuf::from(f)),
            None => return Err(ConfigError::MissingImage),
        };

        Ok(Self {
            port,
            baud,
            image,
            go,
        })
    }

    pub fn skip_flash(&self) -> bool {
        self.image.is_none()
    }
}

/// What the target reported about itself
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Identity {
    pub version: Version,
    pub chip_id: u16,
}

impl Identity {
    pub fn erase_strategy(&self) -> EraseStrategy {
        self.version.erase_strategy()
    }
}

/// Informational session events
#[allow(unused_variables)]
pub trait Observer {
    fn sync_retry(&mut self, attempt: u32) {}
    fn identified(&mut self, identity: &Identity, commands: &[u8]) {}
    fn unprotected(&mut self) {}
    fn erase_started(&mut self, strategy: EraseStrategy) {}
    fn erased(&mut self, strategy: EraseStrategy) {}
    fn program_started(&mut self, total_bytes: u32) {}
    fn progress(&mut self, bytes_written: u32, total_bytes: u32) {}
    fn decile(&mut self, percent: u32) {}
    fn programmed(&mut self, bytes_written: u32) {}
    /// Every written block was read back and matched
    fn verified(&mut self, bytes: u32) {}
    fn skipped(&mut self) {}
    fn launching(&mut self, address: u32) {}
}

impl Observer for () {}

/// Outcome of a successful [`Session::run`]
#[derive(Clone, PartialEq, Debug)]
pub struct Report {
    pub identity: Identity,
    /// Erase performed, `None` when flashing was skipped
    pub erase: Option<EraseStrategy>,
    pub bytes_written: u32,
    pub launched: bool,
}

pub struct Session<P, D, E> {
    programmer: Programmer<P, D, E>,
    identity: Option<Identity>,
    progress: Option<ProgramProgress>,
}

impl<P, D, E> Session<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub fn new(programmer: Programmer<P, D, E>) -> Self {
        Self {
            programmer,
            identity: None,
            progress: None,
        }
    }

    pub fn programmer(&self) -> &Programmer<P, D, E> {
        &self.programmer
    }

    pub fn into_programmer(self) -> Programmer<P, D, E> {
        self.programmer
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn progress(&self) -> Option<&ProgramProgress> {
        self.progress.as_ref()
    }

    /// Run the whole sequence.
    ///
    /// Flashing is skipped when `image` is `None`, the device is still
    /// synchronised and identified.
    pub fn run<S, O>(
        &mut self,
        image: Option<&mut S>,
        go: bool,
        observer: &mut O,
    ) -> Result<Report, Error<E>>
    where
        S: DataSource + ?Sized,
        O: Observer + ?Sized,
    {
        let identity = self.probe(observer)?;

        let mut report = Report {
            identity,
            erase: None,
            bytes_written: 0,
            launched: false,
        };

        match image {
            Some(image) => {
                report.erase = Some(identity.erase_strategy());
                report.bytes_written = self.flash(image, observer)?;
            }
            None => {
                debug!("Skipping flashing");
                observer.skipped();
            }
        }

        if go {
            self.launch(observer)?;
            report.launched = true;
        }

        Ok(report)
    }

    /// Synchronise, then read and validate the bootloader version and chip ID
    pub fn probe<O>(&mut self, observer: &mut O) -> Result<Identity, Error<E>>
    where
        O: Observer + ?Sized,
    {
        self.programmer
            .sync_with(|attempt| observer.sync_retry(attempt))?;

        let version = self.programmer.get_version()?;
        debug!("Found bootloader version: {}", version);
        if !version.is_supported() {
            self.programmer.abort();
            return Err(Error::UnsupportedVersion(version));
        }

        let chip_id = self.programmer.get_chip_id()?;
        debug!("Chip ID: {:04X}", chip_id);
        if !protocol::is_supported_chip(chip_id) {
            self.programmer.abort();
            return Err(Error::UnsupportedChip(chip_id));
        }

        let identity = Identity { version, chip_id };
        self.identity = Some(identity);
        observer.identified(&identity, self.programmer.supported_commands());

        Ok(identity)
    }

    /// Unprotect, erase and program the image, probing first if needed
    pub fn flash<S, O>(&mut self, image: &mut S, observer: &mut O) -> Result<u32, Error<E>>
    where
        S: DataSource + ?Sized,
        O: Observer + ?Sized,
    {
        let identity = match self.identity {
            Some(i) => i,
            None => self.probe(observer)?,
        };

        self.programmer.write_unprotect()?;
        observer.unprotected();

        let strategy = identity.erase_strategy();
        observer.erase_started(strategy);
        self.programmer.erase(strategy)?;
        observer.erased(strategy);

        let total = image.total_length();
        observer.program_started(total);

        let mut progress = ProgramProgress::new(total);
        let r = {
            let mut sink = |written: u32| {
                observer.progress(written, total);
                for percent in progress.update(written) {
                    observer.decile(percent);
                }
            };
            self.programmer.program(image, &mut sink)
        };
        self.progress = Some(progress);

        let written = r?;
        observer.programmed(written);
        if self.programmer.options().verify {
            observer.verified(written);
        }

        Ok(written)
    }

    /// Start the application at the configured base address
    pub fn launch<O>(&mut self, observer: &mut O) -> Result<(), Error<E>>
    where
        O: Observer + ?Sized,
    {
        let address = self.programmer.options().base_address;
        observer.launching(address);
        self.programmer.go(address)
    }
}
