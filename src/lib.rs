//! MSP430 Serial Bootstrap Loader.
//!
//! Based on SLAU319

use core::fmt::{self, Debug};
use core::marker::PhantomData;
use core::str::FromStr;

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

pub mod actions;
pub mod memory;
pub mod protocol;

#[cfg(test)]
mod mock;

use memory::{ImageError, MemoryImage};
use protocol::*;

/// Pre-command sync attempts
const COMMAND_SYNC_ATTEMPTS: u32 = 3;

const PIN_DELAY_MS: u32 = 10;
const SLOW_PIN_DELAY_MS: u32 = 100;
const RESET_SETTLE_MS: u32 = 250;
const BAUD_SETTLE_MS: u32 = 10;

/// Upper bound on stale bytes discarded before a sync
const MAX_DRAIN: usize = 1024;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), E>;
    /// Blocking read timeout, zero makes reads return `WouldBlock` at once
    fn set_read_timeout(&mut self, timeout_ms: u32) -> Result<(), E>;
}

/// Session state, see [`Programmer`] for the allowed transitions
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    LinkOpen,
    Synchronized,
    Authenticated,
    Ready,
    /// The device was left executing user code
    Running,
    Closed,
    Faulted,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    #[error("bootloader answered NAK")]
    Nack,

    #[error("bootloader response timeout")]
    ResponseTimeout,

    #[error("unexpected bootloader response 0x{0:02x}")]
    InvalidResponse(u8),

    #[error("{0}")]
    Frame(FrameError),

    #[error("no bootloader sync after {0} attempts")]
    Sync(u32),

    #[error("password rejected by bootloader")]
    Auth,

    #[error("programming failed at 0x{address:04x}")]
    Program { address: u16 },

    #[error("verify failed at 0x{address:04x} (expected 0x{expected:02x}, read 0x{found:02x})")]
    Verify { address: u16, expected: u8, found: u8 },

    #[error("erase check failed at 0x{address:04x} (read 0x{found:02x})")]
    EraseCheck { address: u16, found: u8 },

    #[error("{0}")]
    Image(ImageError),

    #[error("{op} not allowed in state {state:?}")]
    InvalidState { op: &'static str, state: State },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError> Error<SerialError> {
    /// Errors after which the link state is unknown and the session faults
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Serial(_)
                | Error::ResponseTimeout
                | Error::InvalidResponse(_)
                | Error::Frame(_)
                | Error::Sync(_)
                | Error::Auth
        )
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ResponseTimeout | Error::InvalidResponse(_) | Error::Frame(_)
        )
    }
}

/// Target CPU family
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Cpu {
    Auto,
    F1x,
    F4x,
}

impl Cpu {
    /// Detect the family from the device id in the version block
    pub fn from_device_id(id: u16) -> Self {
        if id >> 8 == 0xF4 {
            Cpu::F4x
        } else {
            Cpu::F1x
        }
    }
}

impl FromStr for Cpu {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Cpu::Auto),
            "f1x" => Ok(Cpu::F1x),
            "f4x" => Ok(Cpu::F4x),
            _ => Err(format!("unknown cpu family '{}' (auto, f1x, f4x)", s)),
        }
    }
}

/// BSL password, the 32 byte interrupt vector table of the installed firmware
#[derive(Clone, PartialEq, Debug)]
pub struct Password([u8; PASSWORD_LEN]);

impl Password {
    pub fn new(bytes: [u8; PASSWORD_LEN]) -> Self {
        Self(bytes)
    }

    /// Password of a device whose vector table is erased
    pub fn erased() -> Self {
        Self([ERASED; PASSWORD_LEN])
    }

    /// Take the password from the vector table of a firmware image
    pub fn from_image(image: &MemoryImage) -> Result<Self, ImageError> {
        let v = image.get_range(PASSWORD_ADDR, PASSWORD_LEN)?;

        let mut bytes = [0u8; PASSWORD_LEN];
        bytes.copy_from_slice(&v);

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Target CPU family (auto, f1x, f4x)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "auto"))]
    pub cpu: Cpu,

    /// Timeout to wait for the first byte of a bootloader response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Timeout between bytes of a bootloader response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub byte_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Data bytes per frame, clamped to 16..=240 and rounded down to a multiple of 16
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "224"))]
    pub max_data: usize,

    /// Number of mass erase cycles
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub erase_cycles: u32,

    /// Invert the RST line
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub invert_rst: bool,

    /// Invert the TEST line
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub invert_test: bool,

    /// Drive RST from RTS and TEST from DTR
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub swap_reset_test: bool,

    /// Slow down the BSL entry sequence
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub slow_mode: bool,

    /// Do not check the bootloader answer to the password
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub ignore_answer: bool,

    /// Sync attempts when entering the bootloader (default: until the sync timeout)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub sync_retries: Option<u32>,

    /// Time budget for bootloader sync when no retry count is given
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10000"))]
    pub sync_timeout_ms: u32,

    /// Attempts per bootloader command
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub command_attempts: u32,

    #[cfg_attr(feature = "structopt", structopt(skip))]
    pub password: Option<Password>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cpu: Cpu::Auto,
            response_timeout_ms: 1000,
            byte_timeout_ms: 100,
            poll_delay_ms: 1,
            max_data: 224,
            erase_cycles: 1,
            invert_rst: false,
            invert_test: false,
            swap_reset_test: false,
            slow_mode: false,
            ignore_answer: false,
            sync_retries: None,
            sync_timeout_ms: 10_000,
            command_attempts: 1,
            password: None,
        }
    }
}

/// Whether to download a replacement bootloader into RAM
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum BslDownload {
    /// When one is supplied and the ROM BSL is older than 1.60
    Auto,
    Force,
    Never,
}

/// Bootloader bring-up choices for [`Programmer::start_bsl`]
#[derive(Clone, PartialEq, Debug)]
pub struct StartOptions {
    /// Apply the RAM patch on BSL 1.10 devices
    pub use_patch: bool,
    pub patch: Option<MemoryImage>,
    pub replacement: Option<MemoryImage>,
    pub download: BslDownload,
    /// Baud rate to switch to once connected
    pub speed: Option<u32>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            use_patch: true,
            patch: None,
            replacement: None,
            download: BslDownload::Auto,
            speed: None,
        }
    }
}

/// Device id and ROM bootloader version
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DeviceVersion {
    pub device_id: u16,
    pub major: u8,
    pub minor: u8,
}

impl DeviceVersion {
    fn from_block(b: &[u8]) -> Self {
        Self {
            device_id: u16::from_be_bytes([b[0], b[1]]),
            major: b[10],
            minor: b[11],
        }
    }

    pub fn bsl_version(&self) -> u16 {
        u16::from_be_bytes([self.major, self.minor])
    }
}

impl fmt::Display for DeviceVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "device 0x{:04X}, BSL {:x}.{:02x}",
            self.device_id, self.major, self.minor
        )
    }
}

enum Reply {
    Ack,
    Data(Vec<u8>),
}

/// BSL session
///
/// `Idle -> LinkOpen -> Synchronized -> Authenticated -> Ready`, then
/// `Running` once user code was started and `Closed` after release. Fatal
/// link errors move any state to `Faulted`, from which only
/// [`release`](Programmer::release) is possible.
pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    max_data: usize,
    port: P,
    delay: D,
    elapsed_ms: u64,
    unlocked: bool,
    /// The device acknowledged a sync and is waiting for a frame
    synced: bool,
    vectors_erased: bool,
    cpu: Cpu,
    device: Option<DeviceVersion>,
    patch_loaded: bool,
    replacement_loaded: bool,
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
        let max_data = effective_max_data(options.max_data);
        if max_data != options.max_data {
            warn!(
                "Frame data size {} adjusted to {}",
                options.max_data, max_data
            );
        }

        Self {
            state: State::Idle,
            cpu: options.cpu,
            options,
            max_data,
            port,
            delay,
            elapsed_ms: 0,
            unlocked: false,
            synced: false,
            vectors_erased: false,
            device: None,
            patch_loaded: false,
            replacement_loaded: false,
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

    /// Effective data bytes per frame
    pub fn max_data(&self) -> usize {
        self.max_data
    }

    /// CPU family, resolved once the bootloader was started
    pub fn cpu(&self) -> Cpu {
        self.cpu
    }

    pub fn device(&self) -> Option<DeviceVersion> {
        self.device
    }

    /// Bring the link up with RST and TEST at their idle levels
    pub fn connect(&mut self) -> Result<(), Error<E>> {
        self.run_op("connect", &[State::Idle], |p| {
            // Reads are polled against the response timeout
            p.port.set_read_timeout(0)?;
            p.idle_lines()?;
            p.drain()?;
            p.transition(State::LinkOpen);
            Ok(())
        })
    }

    /// Reset the device into the bootloader and synchronise
    pub fn enter_bsl(&mut self) -> Result<(), Error<E>> {
        self.run_op("enter BSL", &[State::LinkOpen], |p| p.enter())
    }

    /// Enter the bootloader if required and prepare it for commands
    ///
    /// Probes the device version, downloads a replacement bootloader or the
    /// BSL 1.10 patch as requested and switches baud rate.
    pub fn start_bsl(&mut self, start: &StartOptions) -> Result<(), Error<E>> {
        self.run_op(
            "start BSL",
            &[
                State::LinkOpen,
                State::Synchronized,
                State::Authenticated,
                State::Ready,
            ],
            |p| {
                if p.state == State::LinkOpen {
                    p.enter()?;
                }
                p.bring_up(start)
            },
        )
    }

    /// Authenticate with the configured password
    ///
    /// Without a password this only advances the state. With
    /// `ignore_answer` the bootloader reply is not checked.
    pub fn send_password(&mut self) -> Result<(), Error<E>> {
        self.run_op(
            "send password",
            &[State::Synchronized, State::Authenticated, State::Ready],
            |p| {
                if p.state == State::Ready {
                    return Ok(());
                }

                if p.options.password.is_some() {
                    let password = p.effective_password();
                    p.unlock(&password)?;
                } else {
                    debug!("No password configured");
                }

                p.transition(State::Authenticated);
                p.transition(State::Ready);
                Ok(())
            },
        )
    }

    /// Erase all flash, `erase_cycles` times
    pub fn mass_erase(&mut self) -> Result<(), Error<E>> {
        self.run_op(
            "mass erase",
            &[State::Synchronized, State::Authenticated, State::Ready],
            |p| {
                let cycles = p.options.erase_cycles.max(1);
                for i in 0..cycles {
                    debug!("Mass erase cycle {}/{}", i + 1, cycles);
                    p.command(Command::MassErase, ERASE_ALL_ADDR, ERASE_MASS, &[])?;
                }
                info!("Mass erase complete");

                p.erased_vectors()?;
                p.transition(State::Authenticated);
                p.transition(State::Ready);
                Ok(())
            },
        )
    }

    /// Erase the main flash, keeping the information memory
    pub fn main_erase(&mut self) -> Result<(), Error<E>> {
        self.run_op("main erase", &[State::Ready], |p| {
            p.command(Command::Erase, ERASE_ALL_ADDR, ERASE_MAIN, &[])?;
            info!("Main erase complete");

            p.erased_vectors()
        })
    }

    /// Erase the segment containing `address`
    pub fn segment_erase(&mut self, address: u16) -> Result<(), Error<E>> {
        self.run_op("segment erase", &[State::Ready], |p| p.erase_segment(address))
    }

    /// Erase every segment touching `start..=end`, in ascending order
    pub fn segment_erase_range(&mut self, start: u16, end: u16) -> Result<(), Error<E>> {
        self.run_op("segment erase", &[State::Ready], |p| {
            for base in segment_range(start, end) {
                p.erase_segment(base)?;
            }
            Ok(())
        })
    }

    /// Check that every address in `image` reads back erased
    pub fn erase_check(
        &mut self,
        image: &MemoryImage,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<(), Error<E>> {
        self.run_op("erase check", &[State::Ready], |p| {
            let total = image.len();
            let mut done = 0;

            for s in image.segments() {
                for (i, chunk) in s.data.chunks(p.max_data).enumerate() {
                    let address = s.address + (i * p.max_data) as u16;
                    let found = p.read_memory(address, chunk.len())?;

                    if let Some(o) = found.iter().position(|b| *b != ERASED) {
                        return Err(Error::EraseCheck {
                            address: address + o as u16,
                            found: found[o],
                        });
                    }

                    done += chunk.len();
                    progress(done, total);
                }
            }

            info!("Erase check passed ({} bytes)", total);
            Ok(())
        })
    }

    /// Write every segment of `image`, chunked to the frame data size
    pub fn program(
        &mut self,
        image: &MemoryImage,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<(), Error<E>> {
        self.run_op("program", &[State::Ready], |p| {
            if image.is_empty() {
                warn!("Nothing to program");
                return Ok(());
            }

            let chunk = p.max_data;
            p.write_image(image, chunk, &mut progress)?;

            info!("Programmed {} bytes", image.len());
            Ok(())
        })
    }

    /// Read back every segment of `image` and compare
    pub fn verify(
        &mut self,
        image: &MemoryImage,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<(), Error<E>> {
        self.run_op("verify", &[State::Ready], |p| {
            let total = image.len();
            let mut done = 0;

            for s in image.segments() {
                for (i, expected) in s.data.chunks(p.max_data).enumerate() {
                    let address = s.address + (i * p.max_data) as u16;
                    let found = p.read_memory(address, expected.len())?;

                    let mismatch = expected.iter().zip(found.iter()).position(|(e, f)| e != f);
                    if let Some(o) = mismatch {
                        return Err(Error::Verify {
                            address: address + o as u16,
                            expected: expected[o],
                            found: found[o],
                        });
                    }

                    done += expected.len();
                    progress(done, total);
                }
            }

            info!("Verified {} bytes", total);
            Ok(())
        })
    }

    /// Read the device id and bootloader version
    pub fn read_version(&mut self) -> Result<DeviceVersion, Error<E>> {
        self.run_op("read version", &[State::Ready], |p| {
            let version = p.fetch_version()?;
            p.device = Some(version);
            Ok(version)
        })
    }

    /// Read `length` bytes of device memory from `address`
    pub fn upload(
        &mut self,
        address: u16,
        length: usize,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<Vec<u8>, Error<E>> {
        self.run_op("upload", &[State::Ready], |p| {
            if length == 0 || address as u64 + length as u64 > ADDRESS_SPACE as u64 {
                return Err(Error::Image(ImageError::Range {
                    address: address as u32,
                    length,
                }));
            }

            let mut data = Vec::with_capacity(length);
            while data.len() < length {
                let n = (length - data.len()).min(p.max_data);
                let chunk = p.read_memory(address + data.len() as u16, n)?;
                data.extend_from_slice(&chunk);
                progress(data.len(), length);
            }

            debug!("Uploaded {} bytes from 0x{:04x}", length, address);
            Ok(data)
        })
    }

    /// Load the program counter with `address`, no answer is awaited
    pub fn execute(&mut self, address: u16) -> Result<(), Error<E>> {
        self.run_op("execute", &[State::Ready], |p| {
            info!("Starting user code at 0x{:04x}", address);
            p.send_only(Command::LoadPc, address)?;
            p.unlocked = false;
            p.transition(State::Running);
            Ok(())
        })
    }

    /// Reset the device without entering the bootloader
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        self.run_op(
            "reset",
            &[
                State::LinkOpen,
                State::Synchronized,
                State::Authenticated,
                State::Ready,
                State::Running,
            ],
            |p| {
                info!("Resetting device");
                p.entry_sequence(false)?;
                p.unlocked = false;
                p.transition(State::Running);
                Ok(())
            },
        )
    }

    /// Wait for a running device to re-enter the bootloader, then authenticate
    pub fn resynchronize(&mut self) -> Result<(), Error<E>> {
        self.run_op("resynchronize", &[State::Running], |p| {
            info!("Waiting for the device to re-enter the bootloader");
            p.sync(p.options.sync_retries)?;
            p.transition(State::Synchronized);

            let password = p.effective_password();
            p.unlock(&password)?;
            p.transition(State::Authenticated);
            p.transition(State::Ready);
            Ok(())
        })
    }

    /// Return RST and TEST to their idle levels and close the session
    ///
    /// Allowed from every state and never fails; line errors are logged.
    /// The port stays open until the programmer is dropped, or is handed
    /// back by [`into_inner`](Programmer::into_inner).
    pub fn release(&mut self) {
        if self.state == State::Closed {
            return;
        }

        if let Err(e) = self.idle_lines() {
            debug!("Failed to idle RST/TEST on release: {}", e);
        }

        self.unlocked = false;
        self.transition(State::Closed);
    }

    /// Release the session and hand back the serial port
    ///
    /// The caller owns the port afterwards and closes it by dropping it.
    pub fn into_inner(mut self) -> P {
        self.release();
        self.port
    }

    fn run_op<T>(
        &mut self,
        op: &'static str,
        allowed: &[State],
        f: impl FnOnce(&mut Self) -> Result<T, Error<E>>,
    ) -> Result<T, Error<E>> {
        if !allowed.contains(&self.state) {
            return Err(Error::InvalidState {
                op,
                state: self.state,
            });
        }

        let r = f(self);
        if let Err(e) = &r {
            if e.is_fatal() {
                error!("{} failed: {}", op, e);
                self.transition(State::Faulted);
            }
        }
        r
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            debug!("BSL state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn enter(&mut self) -> Result<(), Error<E>> {
        info!("Invoking bootloader");

        self.entry_sequence(true)?;
        self.sync(self.options.sync_retries)?;

        self.unlocked = false;
        self.transition(State::Synchronized);
        Ok(())
    }

    fn bring_up(&mut self, start: &StartOptions) -> Result<(), Error<E>> {
        let password = self.effective_password();
        self.unlock(&password)?;

        let version = self.fetch_version()?;
        info!("Found {}", version);
        self.device = Some(version);

        if self.options.cpu == Cpu::Auto {
            self.cpu = Cpu::from_device_id(version.device_id);
            debug!("Detected CPU family {:?}", self.cpu);
        }

        let download = match start.download {
            BslDownload::Never => false,
            BslDownload::Force => true,
            BslDownload::Auto => {
                start.replacement.is_some() && version.bsl_version() < REPLACE_BELOW_VERSION
            }
        };

        if download {
            let image = start.replacement.as_ref().ok_or(Error::InvalidArgument(
                "BSL download forced without a replacement image",
            ))?;
            self.load_replacement(image)?;
        } else if start.use_patch && version.bsl_version() == PATCH_BSL_VERSION {
            match &start.patch {
                Some(patch) => self.load_patch(patch)?,
                None => warn!("BSL 1.10 needs a patch for reliable block transfers, none given"),
            }
        }

        if let Some(speed) = start.speed {
            if speed != INITIAL_BAUD {
                self.change_baud(speed)?;
            }
        }

        Ok(())
    }

    fn load_replacement(&mut self, image: &MemoryImage) -> Result<(), Error<E>> {
        let entry = match image.segments().first() {
            Some(s) => s.address,
            None => return Err(Error::InvalidArgument("empty replacement BSL image")),
        };

        // The ROM loader receives the replacement in smaller frames
        let chunk = effective_max_data(self.max_data.min(MAX_DATA_BYTES - 32));
        info!(
            "Downloading replacement BSL ({} bytes, {} byte frames)",
            image.len(),
            chunk
        );
        self.write_image(image, chunk, &mut |_, _| ())?;

        self.send_only(Command::LoadPc, entry)?;
        self.unlocked = false;
        self.patch_loaded = false;

        self.sync(self.options.sync_retries)?;
        let password = self.effective_password();
        self.unlock(&password)?;

        self.replacement_loaded = true;
        info!("Replacement BSL running from 0x{:04x}", entry);
        Ok(())
    }

    fn load_patch(&mut self, patch: &MemoryImage) -> Result<(), Error<E>> {
        info!("Loading BSL patch ({} bytes)", patch.len());

        let chunk = self.max_data;
        self.write_image(patch, chunk, &mut |_, _| ())?;

        self.patch_loaded = true;
        Ok(())
    }

    fn change_baud(&mut self, speed: u32) -> Result<(), Error<E>> {
        let supported = self.replacement_loaded
            || self
                .device
                .map(|d| d.bsl_version() >= CHANGE_BAUD_MIN_VERSION)
                .unwrap_or(false);
        if !supported {
            return Err(Error::Unsupported(
                "this BSL version cannot change baud rate".to_string(),
            ));
        }

        let (a, l) = baud_parameters(self.cpu == Cpu::F4x, speed)
            .ok_or_else(|| Error::Unsupported(format!("baud rate {}", speed)))?;

        self.command(Command::ChangeBaud, a, l, &[])?;
        self.wait(BAUD_SETTLE_MS);
        self.port.set_baud_rate(speed)?;

        info!("Changed baud rate to {}", speed);
        Ok(())
    }

    fn effective_password(&self) -> Password {
        if self.vectors_erased {
            return Password::erased();
        }
        self.options
            .password
            .clone()
            .unwrap_or_else(Password::erased)
    }

    fn unlock(&mut self, password: &Password) -> Result<(), Error<E>> {
        if self.options.ignore_answer {
            let raw = Frame::request(
                Command::RxPassword,
                PASSWORD_ADDR,
                PASSWORD_LEN as u16,
                password.as_bytes(),
            )
            .encode()
            .map_err(Error::Frame)?;

            self.presync()?;
            self.write_bytes(&raw)?;
            match self.read_reply() {
                Err(Error::Serial(e)) => return Err(Error::Serial(e)),
                Err(e) => debug!("Ignoring password answer: {}", e),
                Ok(_) => (),
            }

            warn!("Password answer not checked");
            self.unlocked = true;
            return Ok(());
        }

        match self.command(
            Command::RxPassword,
            PASSWORD_ADDR,
            PASSWORD_LEN as u16,
            password.as_bytes(),
        ) {
            Err(Error::Nack) => Err(Error::Auth),
            Err(e) => Err(e),
            Ok(()) => {
                debug!("Password accepted");
                self.unlocked = true;
                Ok(())
            }
        }
    }

    /// The vector table is blank now, so is the password
    fn erased_vectors(&mut self) -> Result<(), Error<E>> {
        self.vectors_erased = true;
        self.unlock(&Password::erased())
    }

    fn erase_segment(&mut self, address: u16) -> Result<(), Error<E>> {
        let base = segment_base(address);
        debug!("Erasing segment 0x{:04x}", base);

        self.command(Command::Erase, base, ERASE_SEGMENT, &[])?;

        let size = segment_size(base as u32);
        if (base as u32..base as u32 + size).contains(&(PASSWORD_ADDR as u32)) {
            self.vectors_erased = true;
        }
        Ok(())
    }

    fn fetch_version(&mut self) -> Result<DeviceVersion, Error<E>> {
        let block = self.read_memory(VERSION_ADDR, VERSION_LEN)?;
        Ok(DeviceVersion::from_block(&block))
    }

    fn write_image(
        &mut self,
        image: &MemoryImage,
        chunk: usize,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<(), Error<E>> {
        let blocks: Vec<(u16, Vec<u8>)> = image
            .segments()
            .into_iter()
            .map(|s| pad_even(s.address, s.data))
            .collect();

        let total: usize = blocks.iter().map(|(_, d)| d.len()).sum();
        let mut done = 0;

        for (address, data) in &blocks {
            for (i, c) in data.chunks(chunk).enumerate() {
                let a = address + (i * chunk) as u16;

                self.write_block(a, c).map_err(|e| match e {
                    Error::Nack => Error::Program { address: a },
                    e => e,
                })?;

                done += c.len();
                progress(done, total);
            }
        }

        Ok(())
    }

    fn write_block(&mut self, address: u16, data: &[u8]) -> Result<(), Error<E>> {
        if self.patch_loaded {
            self.command(Command::LoadPc, RAM_LOAD_ADDR, 0, &[])?;
        }
        self.command(Command::RxDataBlock, address, data.len() as u16, data)
    }

    /// Read any range, aligning to the even boundaries block reads need
    fn read_memory(&mut self, address: u16, length: usize) -> Result<Vec<u8>, Error<E>> {
        let start = address as u32 & !1;
        let end = (address as u32 + length as u32 + 1) & !1;

        let mut data = Vec::with_capacity((end - start) as usize);
        let mut a = start;
        while a < end {
            let n = ((end - a) as usize).min(self.max_data);
            let block = self.read_block(a as u16, n)?;
            data.extend_from_slice(&block);
            a += n as u32;
        }

        let offset = (address as u32 - start) as usize;
        Ok(data[offset..offset + length].to_vec())
    }

    fn read_block(&mut self, address: u16, length: usize) -> Result<Vec<u8>, Error<E>> {
        if self.patch_loaded {
            self.command(Command::LoadPc, RAM_LOAD_ADDR, 0, &[])?;
        }

        match self.transact(Command::TxDataBlock, address, length as u16, &[])? {
            Reply::Data(d) if d.len() == length => Ok(d),
            Reply::Data(d) => Err(Error::Frame(FrameError::Length {
                declared: length,
                actual: d.len(),
            })),
            Reply::Ack => Err(Error::InvalidResponse(DATA_ACK)),
        }
    }

    /// Send a command that is answered with a plain ACK
    fn command(
        &mut self,
        command: Command,
        address: u16,
        length: u16,
        data: &[u8],
    ) -> Result<(), Error<E>> {
        match self.transact(command, address, length, data)? {
            Reply::Ack => Ok(()),
            Reply::Data(_) => Err(Error::InvalidResponse(DATA_FRAME)),
        }
    }

    fn transact(
        &mut self,
        command: Command,
        address: u16,
        length: u16,
        data: &[u8],
    ) -> Result<Reply, Error<E>> {
        let frame = Frame::request(command, address, length, data);
        if frame.requires_password() && !self.unlocked {
            warn!("{:?} sent to a locked bootloader", command);
        }
        let raw = frame.encode().map_err(Error::Frame)?;

        let attempts = self.options.command_attempts.max(1);
        let mut n = 0;
        loop {
            n += 1;
            trace!(
                "{:?} 0x{:04x} 0x{:04x} ({} data bytes)",
                command,
                address,
                length,
                data.len()
            );

            match self.exchange(&raw) {
                Err(e) if e.is_retryable() && n < attempts => {
                    warn!("{:?} attempt {} failed: {}", command, n, e);
                }
                r => return r,
            }
        }
    }

    fn exchange(&mut self, raw: &[u8]) -> Result<Reply, Error<E>> {
        self.presync()?;
        self.write_bytes(raw)?;
        self.read_reply()
    }

    fn send_only(&mut self, command: Command, address: u16) -> Result<(), Error<E>> {
        let raw = Frame::request(command, address, 0, &[])
            .encode()
            .map_err(Error::Frame)?;

        self.presync()?;
        self.write_bytes(&raw)
    }

    /// Sync before a frame unless an earlier handshake is still pending
    ///
    /// The bootloader takes the byte after an acknowledged sync as a frame
    /// header, so a second sync there would be read as a command.
    fn presync(&mut self) -> Result<(), Error<E>> {
        if self.synced {
            self.synced = false;
            return Ok(());
        }
        self.sync(Some(COMMAND_SYNC_ATTEMPTS))
    }

    fn read_reply(&mut self) -> Result<Reply, Error<E>> {
        let first = self.read_byte(self.options.response_timeout_ms)?;

        match first {
            DATA_ACK => Ok(Reply::Ack),
            DATA_NAK => {
                debug!("Received bootloader nack");
                Err(Error::Nack)
            }
            DATA_FRAME => {
                let mut raw = vec![first];
                for _ in 0..3 {
                    raw.push(self.read_byte(self.options.byte_timeout_ms)?);
                }
                for _ in 0..raw[2] as usize + 2 {
                    raw.push(self.read_byte(self.options.byte_timeout_ms)?);
                }

                let frame = Frame::decode(&raw).map_err(Error::Frame)?;
                Ok(Reply::Data(frame.payload))
            }
            v => {
                debug!("Received unexpected value: 0x{:x}", v);
                Err(Error::InvalidResponse(v))
            }
        }
    }

    /// Sync handshake, `None` retries until the sync timeout elapses
    fn sync(&mut self, attempts: Option<u32>) -> Result<(), Error<E>> {
        let started = self.elapsed_ms;
        let mut n = 0;
        self.synced = false;

        loop {
            n += 1;
            self.drain()?;
            self.write_bytes(&[BSL_SYNC])?;

            match self.read_byte(self.options.response_timeout_ms) {
                Ok(DATA_ACK) => {
                    trace!("Sync after {} attempt(s)", n);
                    self.synced = true;
                    return Ok(());
                }
                Ok(v) => debug!("Sync attempt {}: unexpected 0x{:02x}", n, v),
                Err(Error::ResponseTimeout) => debug!("Sync attempt {}: no response", n),
                Err(e) => return Err(e),
            }

            let exhausted = match attempts {
                Some(max) => n >= max,
                None => self.elapsed_ms - started >= self.options.sync_timeout_ms as u64,
            };
            if exhausted {
                error!("Bootloader sync failed");
                return Err(Error::Sync(n));
            }
        }
    }

    fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut t = 0;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            }

            // Wait for delay period
            self.wait(poll);
            t += poll;

            if t > timeout_ms {
                return Err(Error::ResponseTimeout);
            }
        }
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    /// Discard anything left over from a previous exchange
    fn drain(&mut self) -> Result<(), Error<E>> {
        for _ in 0..MAX_DRAIN {
            match self.port.read() {
                Ok(v) => trace!("Discarding 0x{:02x}", v),
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// RST/TEST pulses, `invoke_bsl` selects the bootloader entry pattern
    fn entry_sequence(&mut self, invoke_bsl: bool) -> Result<(), Error<E>> {
        self.synced = false;
        let d = if self.options.slow_mode {
            SLOW_PIN_DELAY_MS
        } else {
            PIN_DELAY_MS
        };

        self.set_rst(true)?;
        self.set_test(true)?;
        self.wait(RESET_SETTLE_MS);

        self.set_rst(false)?;
        self.wait(d);

        if invoke_bsl {
            // Two TEST pulses while RST is held low, release RST with TEST high
            for level in &[true, false, true, false, true] {
                self.set_test(*level)?;
                self.wait(d);
            }
            self.set_rst(true)?;
            self.wait(d);
            self.set_test(false)?;
        } else {
            self.set_test(false)?;
            self.wait(d);
            self.set_rst(true)?;
        }

        self.wait(RESET_SETTLE_MS);
        self.drain()
    }

    fn idle_lines(&mut self) -> Result<(), Error<E>> {
        self.set_rst(true)?;
        self.set_test(false)
    }

    fn set_rst(&mut self, level: bool) -> Result<(), Error<E>> {
        let level = level ^ self.options.invert_rst;
        if self.options.swap_reset_test {
            self.port.set_rts(level)?;
        } else {
            self.port.set_dtr(level)?;
        }
        Ok(())
    }

    fn set_test(&mut self, level: bool) -> Result<(), Error<E>> {
        let level = level ^ self.options.invert_test;
        if self.options.swap_reset_test {
            self.port.set_dtr(level)?;
        } else {
            self.port.set_rts(level)?;
        }
        Ok(())
    }

    fn wait(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
        self.elapsed_ms += ms as u64;
    }
}

/// Pad a block to even address and length with erased bytes
fn pad_even(address: u16, mut data: Vec<u8>) -> (u16, Vec<u8>) {
    let mut address = address;
    if address % 2 != 0 {
        address -= 1;
        data.insert(0, ERASED);
    }
    if data.len() % 2 != 0 {
        data.push(ERASED);
    }
    (address, data)
}
