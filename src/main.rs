#[macro_use]
extern crate log;

use std::process;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use structopt::StructOpt;

use simplelog::{Config, LevelFilter, SimpleLogger};

use stm32ld::{
    DataSource, EraseStrategy, FileSource, Identity, Observer, Options, Plan, Programmer, Session,
};

#[derive(Clone, Debug, StructOpt)]
#[structopt(
    name = "stm32ld",
    about = "Flash STM32 devices via the factory UART bootloader",
    after_help = "EXAMPLE:\n    stm32ld -p /dev/ttyUSB0 -f /path/to/flash.bin -g"
)]
pub struct Args {
    /// UART port path, e.g. /dev/ttyUSB0
    #[structopt(short, long)]
    port: String,

    /// Binary image path, "0" to skip flashing
    #[structopt(short, long)]
    file: Option<String>,

    /// Serial port baud rate
    #[structopt(short, long, default_value = "9600")]
    baud: usize,

    /// Skip flashing, only show device info
    #[structopt(short, long)]
    skip: bool,

    /// Send go command once done to execute the user program
    #[structopt(short, long)]
    go: bool,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

/// Console reporting of session events
#[derive(Default)]
struct Console {
    bar: Option<ProgressBar>,
}

impl Observer for Console {
    fn sync_retry(&mut self, attempt: u32) {
        warn!("Sending 0x7F to STM32, no ACK received, retry = [{}]", attempt);
    }

    fn identified(&mut self, identity: &Identity, commands: &[u8]) {
        info!("Found bootloader version: {}", identity.version);
        info!("Chip ID: {:04X}", identity.chip_id);
        debug!("Supported commands: {}", hex::encode(commands));
    }

    fn unprotected(&mut self) {
        info!("Cleared write protection");
    }

    fn erase_started(&mut self, strategy: EraseStrategy) {
        match strategy {
            EraseStrategy::Extended => {
                info!("Starting extended erase of flash memory, this may take some time")
            }
            EraseStrategy::Legacy => info!("Erasing flash memory"),
        }
    }

    fn erased(&mut self, _strategy: EraseStrategy) {
        info!("Erased flash memory");
    }

    fn program_started(&mut self, total_bytes: u32) {
        info!("Programming flash");

        let bar = ProgressBar::new(u64::from(total_bytes));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} {msg}")
                .progress_chars("#>-"),
        );
        self.bar = Some(bar);
    }

    fn progress(&mut self, bytes_written: u32, _total_bytes: u32) {
        if let Some(bar) = &self.bar {
            bar.set_position(u64::from(bytes_written));
        }
    }

    fn decile(&mut self, percent: u32) {
        if let Some(bar) = &self.bar {
            bar.set_message(&format!("{}%", percent));
        }
    }

    fn programmed(&mut self, bytes_written: u32) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
        info!("Done, wrote {}", bytefmt::format(u64::from(bytes_written)));
    }

    fn verified(&mut self, bytes: u32) {
        info!("Verified {}", bytefmt::format(u64::from(bytes)));
    }

    fn skipped(&mut self) {
        info!("Skipping flashing");
    }

    fn launching(&mut self, address: u32) {
        info!("Sending go command (0x{:08x})", address);
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let plan = Plan::new(args.port, args.baud, args.file, args.skip, args.go)?;

    info!("Port: [{}]", plan.port);
    info!("Baud: [{}]", plan.baud);
    match &plan.image {
        Some(path) => info!("File: [{}]", path.display()),
        None => info!("File: [none, skipping flash]"),
    }
    info!("Go: [{}]", plan.go);

    // Open the image first so a bad path fails before touching the device
    let mut image = match &plan.image {
        Some(path) => {
            let source = FileSource::open(path)
                .with_context(|| format!("unable to open file {}", path.display()))?;
            info!(
                "Image size: {}",
                bytefmt::format(u64::from(source.total_length()))
            );
            Some(source)
        }
        None => None,
    };

    info!("Connecting to serial port");
    let programmer = Programmer::linux(&plan.port, plan.baud, args.options)?;

    info!("Connecting to bootloader");
    let mut session = Session::new(programmer);
    let mut console = Console::default();

    match session.run(image.as_mut(), plan.go, &mut console) {
        Ok(_) => Ok(()),
        Err(e) => {
            if e.leaves_target_modified() {
                warn!("Flash was left erased or partially written, re-run to recover");
            }
            Err(e.into())
        }
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
