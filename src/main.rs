use std::fs;
use std::io::{self, Write};
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use msp430_bsl::actions::{segment_erase_actions, Action, Schedule};
use msp430_bsl::linux::scan_ports;
use msp430_bsl::memory::{Format, MemoryImage};
use msp430_bsl::{BslDownload, Options, Password, Programmer, StartOptions};

/// Erase cycles above which flash wear becomes a concern
const ERASE_CYCLES_WARN: u32 = 20;

/// Upload output formats
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum OutputFormat {
    Hexdump,
    IntelHex,
    TiText,
    Binary,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hex" | "hexdump" => Ok(OutputFormat::Hexdump),
            "ihex" => Ok(OutputFormat::IntelHex),
            "titext" => Ok(OutputFormat::TiText),
            "bin" => Ok(OutputFormat::Binary),
            _ => Err(format!("unknown output format '{}' (hex, ihex, titext, bin)", s)),
        }
    }
}

fn parse_u16(s: &str) -> Result<u16, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u16::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn parse_usize(s: &str) -> Result<usize, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => usize::from_str_radix(h, 16),
        None => s.parse(),
    }
}

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "9600")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// List available serial ports and exit
    #[structopt(long)]
    list_ports: bool,

    /// Firmware image used for program, verify and erase check
    #[structopt(long)]
    firmware: Option<PathBuf>,

    /// Firmware format (auto, ihex, titext)
    #[structopt(long, default_value = "auto")]
    format: Format,

    /// Load the firmware as raw binary at this address
    #[structopt(long, parse(try_from_str = parse_u16))]
    binary_base: Option<u16>,

    /// Image whose vector table is the BSL password
    #[structopt(long)]
    password: Option<PathBuf>,

    /// Erase all flash
    #[structopt(long)]
    mass_erase: bool,

    /// Erase main flash, keeping the information memory
    #[structopt(long)]
    main_erase: bool,

    /// First address of a segment erase range
    #[structopt(long, parse(try_from_str = parse_u16))]
    erase_from: Option<u16>,

    /// Last address of a segment erase range (default: --erase-from)
    #[structopt(long, parse(try_from_str = parse_u16))]
    erase_to: Option<u16>,

    /// Check the firmware address range is erased
    #[structopt(long)]
    erase_check: bool,

    /// Program the firmware
    #[structopt(long)]
    program: bool,

    /// Verify the firmware
    #[structopt(long)]
    verify: bool,

    /// Read the device id and BSL version
    #[structopt(long)]
    bsl_version: bool,

    /// Replacement BSL image
    #[structopt(long)]
    bsl_file: Option<PathBuf>,

    /// Patch image for BSL 1.10
    #[structopt(long)]
    patch_file: Option<PathBuf>,

    /// Do not load the BSL 1.10 patch
    #[structopt(long)]
    no_patch: bool,

    /// Always download the replacement BSL
    #[structopt(long, conflicts_with = "no-download-bsl")]
    force_bsl: bool,

    /// Never download the replacement BSL
    #[structopt(long)]
    no_download_bsl: bool,

    /// Baud rate to switch to once connected (9600, 19200, 38400)
    #[structopt(long)]
    speed: Option<u32>,

    /// Upload memory from this address after the other actions
    #[structopt(long, parse(try_from_str = parse_u16))]
    upload: Option<u16>,

    /// Number of bytes to upload
    #[structopt(long, default_value = "256", parse(try_from_str = parse_usize))]
    size: usize,

    /// Upload output format (hex, ihex, titext, bin)
    #[structopt(long, default_value = "hex")]
    output_format: OutputFormat,

    /// Write the upload to a file instead of stdout
    #[structopt(long)]
    output: Option<PathBuf>,

    /// Start user code at this address when done
    #[structopt(long, parse(try_from_str = parse_u16))]
    go: Option<u16>,

    /// Reset the device when done
    #[structopt(long, conflicts_with = "go")]
    reset: bool,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

impl Args {
    fn firmware_format(&self) -> Format {
        match self.binary_base {
            Some(base) => Format::Binary { base },
            None => self.format,
        }
    }

    fn schedule(&self) -> Schedule {
        let mut init = Vec::new();
        if self.mass_erase {
            init.push(Action::MassErase);
        }
        if self.main_erase {
            init.push(Action::MainErase);
        }
        if let Some(from) = self.erase_from {
            init.extend(segment_erase_actions(from, self.erase_to.unwrap_or(from)));
        }
        if self.erase_check {
            init.push(Action::EraseCheck);
        }

        let mut work = Vec::new();
        if self.bsl_version {
            work.push(Action::ReadVersion);
        }
        if self.program {
            work.push(Action::Program);
        }
        if self.verify {
            work.push(Action::Verify);
        }
        if self.reset {
            work.push(Action::Reset);
        }
        if let Some(address) = self.go {
            work.push(Action::Run(address));
        }
        if let Some(address) = self.upload {
            work.push(Action::Upload {
                address,
                length: self.size,
            });
        }

        Schedule::new(init, work)
    }
}

fn load_image(path: &Path, format: Format) -> anyhow::Result<MemoryImage> {
    let data = fs::read(path).with_context(|| format!("Error reading {}", path.display()))?;
    let image = MemoryImage::load(&data, format)
        .with_context(|| format!("Error parsing {}", path.display()))?;

    debug!("{}: {}", path.display(), bytefmt::format(image.len() as u64));
    Ok(image)
}

fn load_optional(path: &Option<PathBuf>) -> anyhow::Result<Option<MemoryImage>> {
    match path {
        Some(p) => load_image(p, Format::Auto).map(Some),
        None => Ok(None),
    }
}

fn render_upload(
    address: u16,
    data: &[u8],
    format: OutputFormat,
) -> anyhow::Result<Vec<u8>> {
    let mut image = MemoryImage::new();
    image.insert(address, data)?;

    let out = match format {
        OutputFormat::Hexdump => {
            let mut s = String::new();
            for (i, row) in data.chunks(16).enumerate() {
                s += &format!("{:04x}: {}\n", address as usize + i * 16, hex::encode(row));
            }
            s.into_bytes()
        }
        OutputFormat::IntelHex => image.to_ihex()?.into_bytes(),
        OutputFormat::TiText => image.to_titext().into_bytes(),
        OutputFormat::Binary => data.to_vec(),
    };

    Ok(out)
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if o.list_ports {
        for p in scan_ports() {
            println!("{}", p);
        }
        return Ok(());
    }

    let mut options = o.options.clone();
    if let Some(path) = &o.password {
        let image = load_image(path, Format::Auto)?;
        let password = Password::from_image(&image)
            .with_context(|| format!("No complete vector table in {}", path.display()))?;
        options.password = Some(password);
    }

    if options.erase_cycles > ERASE_CYCLES_WARN {
        warn!(
            "{} erase cycles may wear out the flash",
            options.erase_cycles
        );
    }
    if o.bsl_version && options.password.is_none() && !o.mass_erase && !o.main_erase {
        warn!("Reading the BSL version of a programmed device needs --password");
    }

    let image = match &o.firmware {
        Some(path) => load_image(path, o.firmware_format())?,
        None => MemoryImage::new(),
    };
    if (o.program || o.verify || o.erase_check) && image.is_empty() {
        return Err(anyhow!(
            "--program, --verify and --erase-check need a --firmware image"
        ));
    }

    let start = StartOptions {
        use_patch: !o.no_patch,
        patch: load_optional(&o.patch_file)?,
        replacement: load_optional(&o.bsl_file)?,
        download: match (o.force_bsl, o.no_download_bsl) {
            (true, _) => BslDownload::Force,
            (_, true) => BslDownload::Never,
            _ => BslDownload::Auto,
        },
        speed: o.speed,
    };

    let schedule = o.schedule();
    if schedule.is_empty() {
        info!("Nothing to do");
        return Ok(());
    }

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, options)
        .with_context(|| format!("Error connecting to serial port {}", o.port))?;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar().template("{msg:>12} [{bar:40}] {bytes}/{total_bytes}"),
    );

    let r = schedule.run(&mut p, &start, &image, |action, done, total| {
        bar.set_message(&format!("{:?}", action));
        bar.set_length(total as u64);
        bar.set_position(done as u64);
    });

    bar.finish_and_clear();
    p.release();
    drop(p);

    let report = r.context("BSL session failed")?;

    if let Some(v) = report.version {
        println!("{}", v);
    }

    if let Some((address, data)) = report.upload {
        info!(
            "Uploaded {} from 0x{:04x}",
            bytefmt::format(data.len() as u64),
            address
        );

        let out = render_upload(address, &data, o.output_format)?;
        match &o.output {
            Some(path) => fs::write(path, out)
                .with_context(|| format!("Error writing {}", path.display()))?,
            None => io::stdout().write_all(&out)?,
        }
    }

    info!("Done");
    Ok(())
}
