//! Init and work action lists, run in order against one session

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;

use crate::memory::MemoryImage;
use crate::protocol::segment_range;
use crate::{DeviceVersion, Error, Programmer, SerialPort, StartOptions, State};

#[derive(Clone, PartialEq, Debug)]
pub enum Action {
    MassErase,
    MainErase,
    /// Erase the segment containing this address
    SegmentErase(u16),
    /// Check the image address range reads back erased
    EraseCheck,
    Program,
    Verify,
    ReadVersion,
    /// Reset the device into user code
    Reset,
    /// Start user code at this address
    Run(u16),
    Upload { address: u16, length: usize },
}

impl Action {
    fn needs_password(&self) -> bool {
        !matches!(self, Action::MassErase)
    }
}

/// One segment erase per segment touching `start..=end`
pub fn segment_erase_actions(start: u16, end: u16) -> Vec<Action> {
    segment_range(start, end)
        .into_iter()
        .map(Action::SegmentErase)
        .collect()
}

/// Results of the actions that produce data
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Report {
    pub version: Option<DeviceVersion>,
    pub upload: Option<(u16, Vec<u8>)>,
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct Schedule {
    init: Vec<Action>,
    work: Vec<Action>,
}

impl Schedule {
    pub fn new(init: Vec<Action>, work: Vec<Action>) -> Self {
        Self { init, work }
    }

    pub fn init(&self) -> &[Action] {
        &self.init
    }

    pub fn work(&self) -> &[Action] {
        &self.work
    }

    pub fn is_empty(&self) -> bool {
        self.init.is_empty() && self.work.is_empty()
    }

    /// Run the init then the work actions, stopping at the first failure
    ///
    /// Init actions run on a synchronised bootloader, work actions once
    /// [`Programmer::start_bsl`] has probed the device. Completed actions
    /// are not rolled back on failure.
    pub fn run<P, D, E>(
        &self,
        p: &mut Programmer<P, D, E>,
        start: &StartOptions,
        image: &MemoryImage,
        mut progress: impl FnMut(&Action, usize, usize),
    ) -> Result<Report, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        let mut report = Report::default();

        if !self.is_empty() && p.state() == State::Idle {
            p.connect()?;
        }

        for action in &self.init {
            if p.state() == State::LinkOpen {
                p.enter_bsl()?;
            }
            if action.needs_password() {
                p.send_password()?;
            }

            perform(p, action, image, &mut report, &mut progress)?;
        }

        let mut started = false;
        for action in &self.work {
            if p.state() == State::Running {
                // The device has to come back to the bootloader first
                if let Action::Upload { .. } = action {
                    p.resynchronize()?;
                }
            } else if !started {
                p.start_bsl(start)?;
                p.send_password()?;
                started = true;
            }

            perform(p, action, image, &mut report, &mut progress)?;
        }

        Ok(report)
    }
}

fn perform<P, D, E>(
    p: &mut Programmer<P, D, E>,
    action: &Action,
    image: &MemoryImage,
    report: &mut Report,
    progress: &mut dyn FnMut(&Action, usize, usize),
) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    debug!("Action: {:?}", action);

    match action {
        Action::MassErase => p.mass_erase(),
        Action::MainErase => p.main_erase(),
        Action::SegmentErase(address) => p.segment_erase(*address),
        Action::EraseCheck => p.erase_check(image, |d, t| progress(action, d, t)),
        Action::Program => p.program(image, |d, t| progress(action, d, t)),
        Action::Verify => p.verify(image, |d, t| progress(action, d, t)),
        Action::ReadVersion => {
            let version = p.read_version()?;
            info!("{}", version);
            report.version = Some(version);
            Ok(())
        }
        Action::Reset => p.reset(),
        Action::Run(address) => p.execute(*address),
        Action::Upload { address, length } => {
            let data = p.upload(*address, *length, |d, t| progress(action, d, t))?;
            report.upload = Some((*address, data));
            Ok(())
        }
    }
}
