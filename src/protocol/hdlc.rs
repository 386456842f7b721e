//! HDLC-like framing of protocol frames on the serial line.
//!
//! A frame is delimited by [`FLAG`] bytes. Inside, [`FLAG`] and [`ESCAPE`] are escaped as
//! `ESCAPE, b ^ 0x20`. The last two unescaped bytes are the CRC-16/IBM-SDLC frame check sequence
//! of the preceding bytes in little endian.
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_IBM_SDLC};

use super::{Frame, FrameCodec, ProtocolError};

pub const FLAG: u8 = 0x7e;
pub const ESCAPE: u8 = 0x7d;
const ESCAPE_XOR: u8 = 0x20;

const FCS_SZ: usize = 2;

/// Longest unescaped frame accepted by [`HdlcDecoder`].
pub const MAX_FRAME_SZ: usize = 1024;

const FCS: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

fn stuff(out: &mut BytesMut, b: u8) {
    if b == FLAG || b == ESCAPE {
        out.put_u8(ESCAPE);
        out.put_u8(b ^ ESCAPE_XOR);
    } else {
        out.put_u8(b);
    }
}

/// Frame `payload` for the serial line.
pub fn encode(payload: &[u8]) -> Bytes {
    let fcs = FCS.checksum(payload).to_le_bytes();

    let mut out = BytesMut::with_capacity(2 * (payload.len() + FCS_SZ) + 2);
    out.put_u8(FLAG);
    for b in payload.iter().chain(fcs.iter()) {
        stuff(&mut out, *b);
    }
    out.put_u8(FLAG);

    out.freeze()
}

/// Verify and strip the frame check sequence of an unescaped frame.
fn check_fcs(unescaped: &[u8]) -> Result<&[u8], ProtocolError> {
    if unescaped.len() <= FCS_SZ {
        return Err(ProtocolError::TooShort(unescaped.len()));
    }

    let (data, fcs) = unescaped.split_at(unescaped.len() - FCS_SZ);
    let found = u16::from_le_bytes([fcs[0], fcs[1]]);
    let expected = FCS.checksum(data);

    if found != expected {
        return Err(ProtocolError::ChecksumMismatch { expected, found });
    }

    Ok(data)
}

/// Decode one complete frame, including both flags.
pub fn decode(framed: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let inner = match framed {
        [FLAG, inner @ .., FLAG] => inner,
        _ => return Err(ProtocolError::MissingFlag),
    };

    let mut unescaped = Vec::with_capacity(inner.len());
    let mut bytes = inner.iter();

    while let Some(&b) = bytes.next() {
        match b {
            FLAG => return Err(ProtocolError::MissingFlag),
            ESCAPE => {
                let b = bytes.next().ok_or(ProtocolError::InvalidEscape)?;
                unescaped.push(b ^ ESCAPE_XOR);
            }
            b => unescaped.push(b),
        }
    }

    let len = check_fcs(&unescaped)?.len();
    unescaped.truncate(len);

    Ok(unescaped)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    /// Waiting for an opening flag.
    Idle,
    Receiving,
    Escaped,
}

/// Reassembles frames from a byte stream, one byte at a time.
///
/// A closing flag may double as the opening flag of the next frame.
#[derive(Debug)]
pub struct HdlcDecoder {
    state: DecoderState,
    buf: Vec<u8>,
}

impl Default for HdlcDecoder {
    fn default() -> Self {
        HdlcDecoder::new()
    }
}

impl HdlcDecoder {
    pub fn new() -> HdlcDecoder {
        HdlcDecoder {
            state: DecoderState::Idle,
            buf: Vec::new(),
        }
    }

    /// Feed one byte. Returns the unescaped frame (without FCS) once a frame is complete.
    pub fn push(&mut self, b: u8) -> Option<Result<Vec<u8>, ProtocolError>> {
        use DecoderState::*;

        match (self.state, b) {
            (Idle, FLAG) => {
                self.buf.clear();
                self.state = Receiving;
                None
            }
            (Idle, _) => None,
            (Receiving, FLAG) if self.buf.is_empty() => None,
            (Receiving, FLAG) | (Escaped, FLAG) => {
                let escaped = self.state == Escaped;
                let frame = std::mem::take(&mut self.buf);
                self.state = Receiving;

                if escaped {
                    return Some(Err(ProtocolError::InvalidEscape));
                }

                Some(check_fcs(&frame).map(|data| data.to_vec()))
            }
            (Receiving, ESCAPE) => {
                self.state = Escaped;
                None
            }
            (Receiving, b) => self.accept(b),
            (Escaped, b) => {
                self.state = Receiving;
                self.accept(b ^ ESCAPE_XOR)
            }
        }
    }

    fn accept(&mut self, b: u8) -> Option<Result<Vec<u8>, ProtocolError>> {
        if self.buf.len() >= MAX_FRAME_SZ {
            self.buf.clear();
            self.state = DecoderState::Idle;
            return Some(Err(ProtocolError::TooLong(MAX_FRAME_SZ)));
        }

        self.buf.push(b);
        None
    }
}

/// The codec used by the DotBot gateway firmware.
#[derive(Debug, Default, Clone, Copy)]
pub struct HdlcCodec;

impl FrameCodec for HdlcCodec {
    fn encode(&self, frame: &Frame) -> Bytes {
        encode(&frame.to_bytes())
    }

    fn decode(&self, framed: &[u8]) -> Result<Frame, ProtocolError> {
        Frame::from_bytes(&decode(framed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_flag_and_escape() {
        let payload = [0x01, FLAG, 0x02, ESCAPE, 0x03];
        let framed = encode(&payload);

        assert_eq!(framed[0], FLAG);
        assert_eq!(framed[framed.len() - 1], FLAG);
        assert!(!framed[1..framed.len() - 1].contains(&FLAG));
        assert_eq!(&framed[1..8], &[0x01, ESCAPE, 0x5e, 0x02, ESCAPE, 0x5d, 0x03]);

        assert_eq!(decode(&framed).unwrap(), payload);
    }

    #[test]
    fn known_checksum() {
        // CRC-16/IBM-SDLC check value
        assert_eq!(FCS.checksum(b"123456789"), 0x906e);

        let framed = encode(b"123456789");
        assert_eq!(&framed[10..12], &[0x6e, 0x90]);
    }

    #[test]
    fn corrupted_frames() {
        let mut framed = encode(b"hello").to_vec();

        assert_eq!(decode(&framed[1..]), Err(ProtocolError::MissingFlag));
        assert_eq!(decode(&framed[..framed.len() - 1]), Err(ProtocolError::MissingFlag));
        assert_eq!(decode(&[FLAG, FLAG]), Err(ProtocolError::TooShort(0)));
        assert_eq!(decode(&[FLAG, 0x01, ESCAPE, FLAG]), Err(ProtocolError::InvalidEscape));

        framed[2] ^= 0x01;
        assert!(matches!(
            decode(&framed),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn stream_decoder() {
        let mut stream = vec![0x00, 0x13];
        stream.extend_from_slice(&encode(&[FLAG, 1, 2, 3]));
        stream.extend_from_slice(&encode(b"second"));

        let mut dec = HdlcDecoder::new();
        let frames: Vec<_> = stream.iter().filter_map(|b| dec.push(*b)).collect();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Ok(vec![FLAG, 1, 2, 3]));
        assert_eq!(frames[1], Ok(b"second".to_vec()));
    }

    #[test]
    fn stream_decoder_shared_flag() {
        let a = encode(b"one");
        let b = encode(b"two");

        let mut stream = a[..a.len() - 1].to_vec();
        stream.extend_from_slice(&b);

        let mut dec = HdlcDecoder::new();
        let frames: Vec<_> = stream.iter().filter_map(|b| dec.push(*b)).collect();

        assert_eq!(frames, vec![Ok(b"one".to_vec()), Ok(b"two".to_vec())]);
    }

    #[test]
    fn stream_decoder_recovers_after_garbage() {
        let mut stream = vec![FLAG, 0x01, 0x02, 0x03];
        stream.extend_from_slice(&encode(b"ok"));

        let mut dec = HdlcDecoder::new();
        let frames: Vec<_> = stream.iter().filter_map(|b| dec.push(*b)).collect();

        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_err());
        assert_eq!(frames[1], Ok(b"ok".to_vec()));
    }

    #[test]
    fn stream_decoder_bounds_frame_length() {
        let mut dec = HdlcDecoder::new();
        dec.push(FLAG);

        let errors: Vec<_> = std::iter::repeat(0x11)
            .take(MAX_FRAME_SZ + 1)
            .filter_map(|b| dec.push(b))
            .collect();

        assert_eq!(errors, vec![Err(ProtocolError::TooLong(MAX_FRAME_SZ))]);

        let frames: Vec<_> = encode(b"after").iter().filter_map(|b| dec.push(*b)).collect();
        assert_eq!(frames, vec![Ok(b"after".to_vec())]);
    }
}
