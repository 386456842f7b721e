//! The protocol spoken between the gateway and the robots.
//!
//! A frame is a fixed size header, a payload type byte and a payload. All integers are little
//! endian. Frames are put on the serial line by a [`FrameCodec`], normally [`hdlc::HdlcCodec`].
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod hdlc;

pub use hdlc::HdlcCodec;

pub const PROTOCOL_VERSION: u8 = 9;

/// Destination used for everything sent towards the controlling application.
pub const GATEWAY_ADDRESS_DEFAULT: Address = Address(0);
pub const SWARM_ID_DEFAULT: u16 = 0x0000;

/// destination + source + swarm id + application + version
pub const HEADER_SZ: usize = 8 + 8 + 2 + 1 + 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame is not delimited by flag bytes")]
    MissingFlag,

    #[error("escape byte at end of frame")]
    InvalidEscape,

    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("frame exceeds {0} bytes")]
    TooLong(usize),

    #[error("checksum mismatch: expected {expected:#06x}, got {found:#06x}")]
    ChecksumMismatch { expected: u16, found: u16 },

    #[error("payload truncated")]
    Truncated,

    #[error("unknown payload type: {0}")]
    UnknownPayloadType(u8),

    #[error("unknown application type: {0}")]
    UnknownApplication(u8),

    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(_: std::io::Error) -> ProtocolError {
        ProtocolError::Truncated
    }
}

/// 64 bit device address, written as 16 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub u64);

impl FromStr for Address {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Address, ProtocolError> {
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);

        if hex.is_empty() || hex.len() > 16 {
            return Err(ProtocolError::InvalidAddress(s.into()));
        }

        u64::from_str_radix(hex, 16)
            .map(Address)
            .map_err(|_| ProtocolError::InvalidAddress(s.into()))
    }
}

impl TryFrom<String> for Address {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Address, ProtocolError> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> String {
        a.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApplicationType {
    DotBot = 0,
    SailBot = 1,
    FreeBot = 2,
    Xgo = 3,
}

impl TryFrom<u8> for ApplicationType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        use ApplicationType::*;

        match v {
            0 => Ok(DotBot),
            1 => Ok(SailBot),
            2 => Ok(FreeBot),
            3 => Ok(Xgo),
            v => Err(ProtocolError::UnknownApplication(v)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    CmdMoveRaw = 0,
    CmdRgbLed = 1,
    Advertisement = 4,
    ControlMode = 7,
    SailBotData = 10,
}

impl TryFrom<u8> for PayloadType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        use PayloadType::*;

        match v {
            0 => Ok(CmdMoveRaw),
            1 => Ok(CmdRgbLed),
            4 => Ok(Advertisement),
            7 => Ok(ControlMode),
            10 => Ok(SailBotData),
            v => Err(ProtocolError::UnknownPayloadType(v)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub destination: Address,
    pub source: Address,
    pub swarm_id: u16,
    pub application: ApplicationType,
    pub version: u8,
}

impl Header {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.destination.0);
        buf.put_u64_le(self.source.0);
        buf.put_u16_le(self.swarm_id);
        buf.put_u8(self.application as u8);
        buf.put_u8(self.version);
    }

    fn read(rd: &mut &[u8]) -> Result<Header, ProtocolError> {
        Ok(Header {
            destination: Address(rd.read_u64::<LittleEndian>()?),
            source: Address(rd.read_u64::<LittleEndian>()?),
            swarm_id: rd.read_u16::<LittleEndian>()?,
            application: rd.read_u8()?.try_into()?,
            version: rd.read_u8()?,
        })
    }
}

/// Raw joystick positions. The values are unsigned on the wire but carry a two's complement
/// signed byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MoveRaw {
    pub left_x: u8,
    pub left_y: u8,
    pub right_x: u8,
    pub right_y: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RgbLed {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SailBotData {
    pub heading: u16,
    /// deg * 1e6
    pub latitude: i32,
    /// deg * 1e6
    pub longitude: i32,
    pub wind_angle: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    MoveRaw(MoveRaw),
    RgbLed(RgbLed),
    Advertisement,
    ControlMode(u8),
    SailBotData(SailBotData),
}

impl Payload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::MoveRaw(_) => PayloadType::CmdMoveRaw,
            Payload::RgbLed(_) => PayloadType::CmdRgbLed,
            Payload::Advertisement => PayloadType::Advertisement,
            Payload::ControlMode(_) => PayloadType::ControlMode,
            Payload::SailBotData(_) => PayloadType::SailBotData,
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        match self {
            Payload::MoveRaw(m) => {
                buf.put_u8(m.left_x);
                buf.put_u8(m.left_y);
                buf.put_u8(m.right_x);
                buf.put_u8(m.right_y);
            }
            Payload::RgbLed(c) => {
                buf.put_u8(c.red);
                buf.put_u8(c.green);
                buf.put_u8(c.blue);
            }
            Payload::Advertisement => {}
            Payload::ControlMode(mode) => buf.put_u8(*mode),
            Payload::SailBotData(d) => {
                buf.put_u16_le(d.heading);
                buf.put_i32_le(d.latitude);
                buf.put_i32_le(d.longitude);
                buf.put_u16_le(d.wind_angle);
            }
        }
    }

    fn read(ty: PayloadType, rd: &mut &[u8]) -> Result<Payload, ProtocolError> {
        Ok(match ty {
            PayloadType::CmdMoveRaw => Payload::MoveRaw(MoveRaw {
                left_x: rd.read_u8()?,
                left_y: rd.read_u8()?,
                right_x: rd.read_u8()?,
                right_y: rd.read_u8()?,
            }),
            PayloadType::CmdRgbLed => Payload::RgbLed(RgbLed {
                red: rd.read_u8()?,
                green: rd.read_u8()?,
                blue: rd.read_u8()?,
            }),
            PayloadType::Advertisement => Payload::Advertisement,
            PayloadType::ControlMode => Payload::ControlMode(rd.read_u8()?),
            PayloadType::SailBotData => Payload::SailBotData(SailBotData {
                heading: rd.read_u16::<LittleEndian>()?,
                latitude: rd.read_i32::<LittleEndian>()?,
                longitude: rd.read_i32::<LittleEndian>()?,
                wind_angle: rd.read_u16::<LittleEndian>()?,
            }),
        })
    }
}

/// A decoded protocol frame: header and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Payload,
}

impl Frame {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SZ + 1 + 12);
        self.header.write(&mut buf);
        buf.put_u8(self.payload.payload_type() as u8);
        self.payload.write(&mut buf);
        buf.freeze()
    }

    /// Parse an unframed frame. Trailing bytes after the payload are ignored.
    pub fn from_bytes(b: &[u8]) -> Result<Frame, ProtocolError> {
        let mut rd = b;

        let header = Header::read(&mut rd)?;
        let ty = PayloadType::try_from(rd.read_u8()?)?;
        let payload = Payload::read(ty, &mut rd)?;

        Ok(Frame { header, payload })
    }
}

/// Puts frames on, and takes frames off, the serial line.
pub trait FrameCodec: Send + Sync {
    fn encode(&self, frame: &Frame) -> Bytes;

    fn decode(&self, framed: &[u8]) -> Result<Frame, ProtocolError>;
}
