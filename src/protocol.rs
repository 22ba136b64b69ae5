//! BSL wire protocol: constants, commands and the frame codec.
//!
//! Based on SLAU319 (MSP430 Programming Via the Bootstrap Loader)

use thiserror::Error;

/// Synchronisation character, answered by [`DATA_ACK`]
pub const BSL_SYNC: u8 = 0x80;

/// First byte of every data frame (both directions)
pub const DATA_FRAME: u8 = 0x80;

pub const DATA_ACK: u8 = 0x90;
pub const DATA_NAK: u8 = 0xA0;

/// Baud rate the ROM BSL starts at
pub const INITIAL_BAUD: u32 = 9600;

/// Largest data block the ROM BSL accepts in one frame
pub const MAX_DATA_BYTES: usize = 250;

/// Smallest data block we will split transfers into
pub const MIN_DATA_BYTES: usize = 16;

/// Interrupt vector table, doubling as the BSL password
pub const PASSWORD_ADDR: u16 = 0xFFE0;
pub const PASSWORD_LEN: usize = 32;

/// Device id and BSL version block
pub const VERSION_ADDR: u16 = 0x0FF0;
pub const VERSION_LEN: usize = 16;

/// RAM address patches and replacement loaders are placed at
pub const RAM_LOAD_ADDR: u16 = 0x0220;

/// ROM BSL version whose block transfers need the RAM patch
pub const PATCH_BSL_VERSION: u16 = 0x0110;

/// ROM BSL versions below this are replaced when a replacement image is given
pub const REPLACE_BELOW_VERSION: u16 = 0x0160;

/// Oldest ROM BSL implementing the change baud rate command
pub const CHANGE_BAUD_MIN_VERSION: u16 = 0x0140;

/// Address used by the main and mass erase commands
pub const ERASE_ALL_ADDR: u16 = 0xFFFE;

/// Length-field codes selecting the erase mode
pub const ERASE_SEGMENT: u16 = 0xA502;
pub const ERASE_MAIN: u16 = 0xA504;
pub const ERASE_MASS: u16 = 0xA506;

/// Value of an erased flash cell
pub const ERASED: u8 = 0xFF;

/// Size of the 16-bit device address space
pub const ADDRESS_SPACE: u32 = 0x1_0000;

#[derive(Debug, PartialEq, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// Unlock the BSL with the 32 byte interrupt vector table.
    RxPassword = 0x10,

    /// Writes a block of data to RAM or flash.
    RxDataBlock = 0x12,

    /// Reads a block of memory back to the host.
    TxDataBlock = 0x14,

    /// Erases a segment, or the main memory, depending on the length field.
    Erase = 0x16,

    /// Erases all flash memory, including the information segments.
    MassErase = 0x18,

    /// Loads the program counter and starts execution at an address.
    LoadPc = 0x1A,

    /// Switches the BSL to another baud rate.
    ChangeBaud = 0x20,
}

impl Command {
    /// Whether the BSL refuses this command until the password was received
    pub fn requires_password(self) -> bool {
        !matches!(self, Command::RxPassword | Command::MassErase)
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x10 => Some(Command::RxPassword),
            0x12 => Some(Command::RxDataBlock),
            0x14 => Some(Command::TxDataBlock),
            0x16 => Some(Command::Erase),
            0x18 => Some(Command::MassErase),
            0x1A => Some(Command::LoadPc),
            0x20 => Some(Command::ChangeBaud),
            _ => None,
        }
    }
}

/// Frame level decode failures
#[derive(Clone, PartialEq, Debug, Error)]
pub enum FrameError {
    #[error("frame checksum mismatch (computed 0x{computed:04x}, received 0x{received:04x})")]
    Checksum { computed: u16, received: u16 },

    #[error("invalid frame header 0x{0:02x}")]
    Header(u8),

    #[error("frame length fields disagree (0x{0:02x} / 0x{1:02x})")]
    LengthMismatch(u8, u8),

    #[error("frame declares {declared} payload bytes but carries {actual}")]
    Length { declared: usize, actual: usize },

    #[error("frame too short ({0} bytes)")]
    Truncated(usize),

    #[error("payload of {0} bytes does not fit a frame")]
    TooLong(usize),
}

impl FrameError {
    /// Checksum failures may be retried, everything else means we lost framing
    pub fn is_checksum(&self) -> bool {
        matches!(self, FrameError::Checksum { .. })
    }
}

/// One BSL frame: `[0x80][cmd][L1][L2][payload..][CKL][CKH]`
///
/// Both length bytes carry the payload length. Replies from the device use
/// the same layout with a command byte of zero.
#[derive(Clone, PartialEq, Debug)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u8, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    /// Build a request frame, the payload starts with the address and length fields
    pub fn request(command: Command, address: u16, length: u16, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(&length.to_le_bytes());
        payload.extend_from_slice(data);

        Self::new(command as u8, payload)
    }

    /// Whether the device needs to be unlocked to accept this frame
    pub fn requires_password(&self) -> bool {
        Command::from_u8(self.command)
            .map(Command::requires_password)
            .unwrap_or(true)
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > u8::MAX as usize {
            return Err(FrameError::TooLong(self.payload.len()));
        }
        let len = self.payload.len() as u8;

        let mut raw = Vec::with_capacity(self.payload.len() + 6);
        raw.extend_from_slice(&[DATA_FRAME, self.command, len, len]);
        raw.extend_from_slice(&self.payload);

        let ck = checksum(&raw);
        raw.extend_from_slice(&ck.to_le_bytes());

        Ok(raw)
    }

    /// Decode a complete raw frame
    ///
    /// The checksum is checked before any field is trusted.
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < 6 {
            return Err(FrameError::Truncated(raw.len()));
        }

        let (body, ck) = raw.split_at(raw.len() - 2);
        let received = u16::from_le_bytes([ck[0], ck[1]]);
        let computed = checksum(body);
        if computed != received {
            return Err(FrameError::Checksum { computed, received });
        }

        if body[0] != DATA_FRAME {
            return Err(FrameError::Header(body[0]));
        }
        if body[2] != body[3] {
            return Err(FrameError::LengthMismatch(body[2], body[3]));
        }

        let payload = &body[4..];
        if payload.len() != body[2] as usize {
            return Err(FrameError::Length {
                declared: body[2] as usize,
                actual: payload.len(),
            });
        }

        Ok(Self::new(body[1], payload.to_vec()))
    }
}

/// Inverted XOR of little endian 16-bit words, an odd trailing byte is
/// zero extended.
pub fn checksum(data: &[u8]) -> u16 {
    let ck = data.chunks(2).fold(0u16, |ck, w| {
        let lo = w[0] as u16;
        let hi = w.get(1).copied().unwrap_or(0) as u16;
        ck ^ (lo | hi << 8)
    });

    !ck
}

/// Clamp a requested frame data size to what the BSL accepts
pub fn effective_max_data(requested: usize) -> usize {
    let n = requested.max(MIN_DATA_BYTES).min(MAX_DATA_BYTES);
    n - n % 16
}

/// Erase granularity of the segment containing `address`
pub fn segment_size(address: u32) -> u32 {
    if address < 0x1100 {
        // Information memory
        64
    } else if address < 0x1200 {
        256
    } else {
        512
    }
}

/// Start of the segment containing `address`
pub fn segment_base(address: u16) -> u16 {
    let a = address as u32;
    (a - a % segment_size(a)) as u16
}

/// Segment starts covering `start..=end`, ascending
pub fn segment_range(start: u16, end: u16) -> Vec<u16> {
    let mut segments = Vec::new();
    let mut a = start as u32;

    while a <= end as u32 {
        let size = segment_size(a);
        a -= a % size;
        segments.push(a as u16);
        a += size;
    }

    segments
}

/// Change baud rate parameters (address, length fields) per CPU family
pub fn baud_parameters(f4x: bool, baud: u32) -> Option<(u16, u16)> {
    let p = match (f4x, baud) {
        (false, 9600) => (0x8580, 0x0000),
        (false, 19200) => (0x86E0, 0x0001),
        (false, 38400) => (0x87E0, 0x0002),
        (true, 9600) => (0x9800, 0x0000),
        (true, 19200) => (0xB000, 0x0001),
        (true, 38400) => (0xC800, 0x0002),
        _ => return None,
    };
    Some(p)
}
