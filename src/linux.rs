use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Options, Programmer, SerialPort};

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        ErrorKind::Io(k) => k,
        _ => IoErrorKind::Other,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), IoErrorKind> {
        let mut settings = self.0.read_settings().map_err(io_kind)?;
        settings
            .set_baud_rate(BaudRate::from_speed(baud as usize))
            .map_err(io_kind)?;
        self.0.write_settings(&settings).map_err(io_kind)
    }

    fn set_read_timeout(&mut self, timeout_ms: u32) -> Result<(), IoErrorKind> {
        self.0
            .set_timeout(Duration::from_millis(timeout_ms as u64))
            .map_err(io_kind)
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // The BSL talks 8E1
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings)?;

        // Response timeouts are counted by the programmer
        port.0.set_timeout(Duration::from_millis(0))?;

        Ok(Self::new(port, Delay {}, options))
    }
}

/// Names of the serial ports on this machine
pub fn scan_ports() -> Vec<String> {
    let mut ports: Vec<String> = match serialport::available_ports() {
        Ok(p) => p.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            warn!("Unable to list serial ports: {}", e);
            return Vec::new();
        }
    };

    ports.sort();
    debug!("Found {} serial ports", ports.len());
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_errors_map_to_io_kinds() {
        let e = SerialError::new(ErrorKind::Io(IoErrorKind::TimedOut), "timed out");
        assert_eq!(io_kind(e), IoErrorKind::TimedOut);

        let e = SerialError::new(ErrorKind::NoDevice, "gone");
        assert_eq!(io_kind(e), IoErrorKind::Other);
    }

    #[test]
    fn scanned_ports_are_sorted() {
        let ports = scan_ports();
        let mut sorted = ports.clone();
        sorted.sort();
        assert_eq!(ports, sorted);
    }
}
