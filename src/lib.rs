//! STM32 Serial Bootloader.
//!
//! Base on AN3155

use core::fmt::Debug;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod error;
pub mod image;
pub mod progress;
pub mod protocol;
pub mod session;

pub use error::{Error, Fault};
pub use image::{DataSource, FileSource, SliceSource};
pub use progress::{ProgramProgress, ProgressSink};
pub use protocol::{Command, EraseStrategy, Version};
pub use session::{ConfigError, Identity, Observer, Plan, Report, Session};

use protocol::{MAX_CHUNK, UART_ACK, UART_DISC, UART_NACK};

/// Upper bound on stale bytes discarded before a sync or retry
const DRAIN_LIMIT: usize = 4096;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

/// Programmer protocol state, advancing forward only.
///
/// Phase operations are only accepted once synchronised; `Failed` is
/// terminal until the next [`Programmer::sync`].
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Disconnected,
    Syncing,
    Synced,
    VersionKnown,
    ChipIdKnown,
    Unprotected,
    Erased,
    Programmed,
    Launched,
    /// An operation failed, the session cannot continue
    Failed,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for each bootloader response byte
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for erase and unprotect to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "30000"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init before sending init character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub init_delay_ms: u32,

    /// Number of init characters to send before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "60"))]
    pub sync_attempts: u32,

    /// Delay between init attempts
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub sync_interval_ms: u32,

    /// Attempts for each flash write before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub write_attempts: u32,

    /// Read back and compare each block after writing
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub verify: bool,

    /// Flash address to program the image at, also used as the go address
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "0x08000000", parse(try_from_str = protocol::parse_address))
    )]
    pub base_address: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 1000,
            erase_timeout_ms: 30_000,
            poll_delay_ms: 1,
            init_delay_ms: 100,
            sync_attempts: 60,
            sync_interval_ms: 1000,
            write_attempts: 3,
            verify: false,
            base_address: protocol::FLASH_BASE,
        }
    }
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    commands: Vec<u8>,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Disconnected,
            options,
            port,
            delay,
            commands: Vec::new(),
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Command opcodes reported by the bootloader, empty until [`Self::get_version`]
    pub fn supported_commands(&self) -> &[u8] {
        &self.commands
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Release the serial port
    pub fn into_inner(self) -> P {
        self.port
    }

    /// Pulse DTR / RTS to reset the target into the bootloader
    pub fn reset(&mut self) -> Result<(), Fault<E>> {
        debug!("Resetting device");

        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;

        self.delay.delay_ms(100u32);

        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;

        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    /// Synchronise with the bootloader, logging each failed attempt
    pub fn sync(&mut self) -> Result<(), Error<E>> {
        self.sync_with(|attempt| warn!("Sending 0x7F, no ACK received, retry = [{}]", attempt))
    }

    /// Synchronise with the bootloader, reporting each failed attempt to `on_retry`
    pub fn sync_with<F>(&mut self, on_retry: F) -> Result<(), Error<E>>
    where
        F: FnMut(u32),
    {
        self.state = State::Syncing;

        // First, reset device
        if !self.options.no_reset {
            if let Err(e) = self.reset() {
                self.state = State::Failed;
                return Err(Error::Sync(e));
            }
        }

        let r = self.sync_attempts(false, on_retry);
        if r.is_ok() {
            info!("Bootloader connected");
        }
        self.track(State::Synced, r)
    }

    /// Fetch the bootloader version and supported command list (GET)
    pub fn get_version(&mut self) -> Result<Version, Error<E>> {
        self.require_connected()?;
        let r = self.read_version().map_err(Error::VersionQuery);
        self.track(State::VersionKnown, r)
    }

    /// Fetch the two byte product identifier (GET ID)
    pub fn get_chip_id(&mut self) -> Result<u16, Error<E>> {
        self.require_connected()?;
        let r = self.read_chip_id().map_err(Error::ChipIdQuery);
        self.track(State::ChipIdKnown, r)
    }

    /// Disable flash write protection.
    ///
    /// The target resets once protection is cleared, so the bootloader is
    /// resynchronised before returning.
    pub fn write_unprotect(&mut self) -> Result<(), Error<E>> {
        self.require_connected()?;
        let r = self.unprotect();
        self.track(State::Unprotected, r)
    }

    /// Erase the whole flash
    pub fn erase(&mut self, strategy: EraseStrategy) -> Result<(), Error<E>> {
        self.require_connected()?;
        debug!("Starting {}", strategy);
        let r = self.erase_all(strategy).map_err(Error::Erase);
        self.track(State::Erased, r)
    }

    /// Write an image to flash from the configured base address.
    ///
    /// `sink` receives the cumulative number of bytes written after every
    /// acknowledged chunk. Returns the total number of bytes written.
    pub fn program<S, K>(&mut self, source: &mut S, sink: &mut K) -> Result<u32, Error<E>>
    where
        S: DataSource + ?Sized,
        K: ProgressSink + ?Sized,
    {
        self.require_connected()?;
        let r = self.write_image(source, sink);
        self.track(State::Programmed, r)
    }

    /// Jump to the application at `address`.
    ///
    /// The target leaves the bootloader on success and may not acknowledge
    /// the address, so only a NACK or link failure is an error.
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        self.require_connected()?;
        let r = self.jump(address).map_err(Error::Go);
        self.track(State::Launched, r)
    }

    /// Read up to [`MAX_CHUNK`] bytes of target memory.
    ///
    /// Raw access with no state checks, the caller must have synchronised.
    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), Fault<E>> {
        if data.is_empty() {
            return Ok(());
        }
        debug_assert!(data.len() <= MAX_CHUNK);

        self.send_command(Command::ReadMemory)?;
        self.send_address(address)?;

        self.send(&protocol::read_length_frame(data.len()))?;
        self.await_ack(self.options.response_timeout_ms)?;

        for b in data.iter_mut() {
            *b = self.read_byte(self.options.response_timeout_ms)?;
        }

        Ok(())
    }

    /// Mark the session failed without issuing further commands
    pub(crate) fn abort(&mut self) {
        self.state = State::Failed;
    }

    fn require_connected(&self) -> Result<(), Error<E>> {
        match self.state {
            State::Disconnected | State::Syncing | State::Failed => {
                Err(Error::NotConnected(self.state))
            }
            _ => Ok(()),
        }
    }

    fn track<T>(&mut self, next: State, r: Result<T, Error<E>>) -> Result<T, Error<E>> {
        self.state = match &r {
            Ok(_) => next,
            Err(e) => {
                debug!("Programmer failed in state {:?}: {}", self.state, e);
                State::Failed
            }
        };
        r
    }

    fn sync_attempts<F>(&mut self, accept_nack: bool, mut on_retry: F) -> Result<(), Error<E>>
    where
        F: FnMut(u32),
    {
        let attempts = self.options.sync_attempts;

        for attempt in 1..=attempts {
            match self.try_sync(accept_nack) {
                Ok(()) => return Ok(()),
                Err(Fault::Serial(e)) => return Err(Error::Sync(Fault::Serial(e))),
                Err(f) => {
                    debug!("Sync attempt {} failed: {}", attempt, f);
                    on_retry(attempt);
                    if attempt < attempts {
                        self.delay.delay_ms(self.options.sync_interval_ms);
                    }
                }
            }
        }

        Err(Error::SyncTimeout { attempts })
    }

    fn try_sync(&mut self, accept_nack: bool) -> Result<(), Fault<E>> {
        self.drain()?;

        debug!("Sending discovery character");
        self.send(&[UART_DISC])?;

        // A running bootloader NACKs a repeated init character
        match self.read_byte(self.options.response_timeout_ms)? {
            UART_ACK => Ok(()),
            UART_NACK if accept_nack => {
                debug!("Bootloader already synchronised");
                Ok(())
            }
            UART_NACK => Err(Fault::Nack),
            v => Err(Fault::InvalidResponse(v)),
        }
    }

    fn read_version(&mut self) -> Result<Version, Fault<E>> {
        let t = self.options.response_timeout_ms;

        self.send_command(Command::Get)?;

        // N, version, then N command codes
        let n = self.read_byte(t)?;
        let version = Version::from_byte(self.read_byte(t)?);

        let mut commands = Vec::with_capacity(n as usize);
        for _ in 0..n {
            commands.push(self.read_byte(t)?);
        }

        self.await_ack(t)?;

        debug!("Bootloader {} supports commands {:02x?}", version, commands);
        self.commands = commands;

        Ok(version)
    }

    fn read_chip_id(&mut self) -> Result<u16, Fault<E>> {
        let t = self.options.response_timeout_ms;

        self.send_command(Command::GetId)?;

        // N = 1 for every STM32, the PID follows MSB first
        let n = self.read_byte(t)?;
        if n != 1 {
            debug!("Unexpected chip ID length: {}", n);
            return Err(Fault::InvalidResponse(n));
        }

        let hi = self.read_byte(t)?;
        let lo = self.read_byte(t)?;

        self.await_ack(t)?;

        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn unprotect(&mut self) -> Result<(), Error<E>> {
        self.send_command(Command::WriteUnprotect)
            .map_err(Error::Protection)?;

        // Second ACK once the option bytes are rewritten
        self.await_ack(self.options.erase_timeout_ms)
            .map_err(Error::Protection)?;

        debug!("Write protection cleared, target resetting");

        self.sync_attempts(true, |attempt| {
            debug!("Resynchronising after unprotect, retry = [{}]", attempt)
        })
    }

    fn erase_all(&mut self, strategy: EraseStrategy) -> Result<(), Fault<E>> {
        self.send_command(strategy.command())?;
        self.send(strategy.erase_all_frame())?;
        self.await_ack(self.options.erase_timeout_ms)
    }

    fn write_image<S, K>(&mut self, source: &mut S, sink: &mut K) -> Result<u32, Error<E>>
    where
        S: DataSource + ?Sized,
        K: ProgressSink + ?Sized,
    {
        let base = self.options.base_address;
        let total = source.total_length();

        if u64::from(base) + u64::from(total) > 1 << 32 {
            return Err(Error::ImageTooLarge {
                base,
                len: u64::from(total),
            });
        }

        let mut data = [0u8; MAX_CHUNK];
        let mut written: u32 = 0;
        let mut exhausted = false;

        while !exhausted {
            // Short reads are merged so every frame but the last is full
            // and each write starts word aligned
            let mut n = 0;
            while n < MAX_CHUNK {
                let count = source
                    .next_chunk(&mut data[n..])
                    .map_err(|e| Error::ImageFile(e.kind()))?;
                if count == 0 {
                    exhausted = true;
                    break;
                }
                n += count.min(MAX_CHUNK - n);
            }
            if n == 0 {
                break;
            }

            // The source may deliver more than it declared
            let end = u64::from(base) + u64::from(written) + n as u64;
            if end > 1 << 32 {
                return Err(Error::ImageTooLarge {
                    base,
                    len: end - u64::from(base),
                });
            }

            let address = base + written;
            let chunk = &data[..n];

            self.write_chunk(address, chunk)
                .map_err(|fault| Error::Program {
                    offset: written,
                    fault,
                })?;

            if self.options.verify {
                self.verify_chunk(address, chunk, written)?;
            }

            written += n as u32;
            sink.update(written);
        }

        debug!("Wrote {} bytes from 0x{:08x}", written, base);

        Ok(written)
    }

    fn write_chunk(&mut self, address: u32, data: &[u8]) -> Result<(), Fault<E>> {
        let attempts = self.options.write_attempts.max(1);
        let frame = protocol::data_frame(data);

        let mut attempt = 1;
        loop {
            match self.write_memory(address, &frame) {
                Ok(()) => return Ok(()),
                Err(Fault::Serial(e)) => return Err(Fault::Serial(e)),
                Err(f) if attempt < attempts => {
                    warn!(
                        "Write of {} bytes at 0x{:08x} failed ({}), retry = [{}]",
                        data.len(),
                        address,
                        f,
                        attempt
                    );
                    self.drain()?;
                    attempt += 1;
                }
                Err(f) => return Err(f),
            }
        }
    }

    fn write_memory(&mut self, address: u32, frame: &[u8]) -> Result<(), Fault<E>> {
        self.send_command(Command::WriteMemory)?;
        self.send_address(address)?;
        self.send(frame)?;
        self.await_ack(self.options.response_timeout_ms)
    }

    fn verify_chunk(&mut self, address: u32, expected: &[u8], offset: u32) -> Result<(), Error<E>> {
        let mut actual = [0u8; MAX_CHUNK];
        let actual = &mut actual[..expected.len()];

        self.read_memory(address, actual)
            .map_err(|fault| Error::Program { offset, fault })?;

        match expected.iter().zip(actual.iter()).position(|(e, a)| e != a) {
            Some(i) => Err(Error::Verify {
                offset: offset + i as u32,
            }),
            None => Ok(()),
        }
    }

    fn jump(&mut self, address: u32) -> Result<(), Fault<E>> {
        self.send_command(Command::Go)?;
        self.send(&protocol::address_frame(address))?;

        match self.await_ack(self.options.response_timeout_ms) {
            Ok(()) | Err(Fault::ResponseTimeout) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn send_command(&mut self, command: Command) -> Result<(), Fault<E>> {
        debug!("Sending command {:?}", command);
        self.send(&protocol::command_frame(command))?;
        self.await_ack(self.options.response_timeout_ms)
    }

    fn send_address(&mut self, address: u32) -> Result<(), Fault<E>> {
        self.send(&protocol::address_frame(address))?;
        self.await_ack(self.options.response_timeout_ms)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), Fault<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, Fault<E>> {
        let mut t: u32 = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            if t >= timeout_ms {
                debug!("Receive timeout");
                return Err(Fault::ResponseTimeout);
            }

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t = t.saturating_add(self.options.poll_delay_ms.max(1));
        }
    }

    fn await_ack(&mut self, timeout_ms: u32) -> Result<(), Fault<E>> {
        match self.read_byte(timeout_ms)? {
            UART_ACK => {
                debug!("Received bootloader ack");
                Ok(())
            }
            UART_NACK => {
                debug!("Received bootloader nack");
                Err(Fault::Nack)
            }
            v => {
                debug!("Received unexpected value: 0x{:02x}", v);
                Err(Fault::InvalidResponse(v))
            }
        }
    }

    fn drain(&mut self) -> Result<(), Fault<E>> {
        for _ in 0..DRAIN_LIMIT {
            match self.port.read() {
                Ok(v) => debug!("Discarding stale byte 0x{:02x}", v),
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
