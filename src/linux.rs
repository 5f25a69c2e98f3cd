use std::io::{self, ErrorKind as IoErrorKind};
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Error, Options, Programmer, SerialPort};

fn error_kind(e: SerialError) -> IoErrorKind {
    io::Error::from(e).kind()
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(error_kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(error_kind)
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance.
    ///
    /// The port is configured 8E1 as the bootloader requires and is held
    /// until the programmer is dropped.
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, Error<IoErrorKind>> {
        let path = port.as_ref();
        let unavailable = |e: SerialError| Error::PortUnavailable {
            port: path.display().to_string(),
            reason: e.to_string(),
        };

        // Open port
        let mut port = Serial::open(path).map_err(unavailable)?;

        // Apply settings
        let mut settings = port.0.read_settings().map_err(unavailable)?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings
            .set_baud_rate(BaudRate::from_speed(baud))
            .map_err(unavailable)?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings).map_err(unavailable)?;

        // Reads return immediately, timeouts are polled by the programmer
        port.0
            .set_timeout(Duration::from_millis(0))
            .map_err(unavailable)?;

        debug!("Opened {} at {} baud", path.display(), baud);

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
