use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{FrameError, Result};
use crate::flags::Flags;

/// Frame delimiter.
pub const SYNC: u8 = 0x01;

/// Delimiter (1) + flags (1) + seq (1) + ack (1) + length (2) + header check (1).
pub const HEADER_SIZE: usize = 7;

/// CRC-32 trailer.
pub const TRAILER_SIZE: usize = 4;

/// Default maximum payload per frame.
pub const DEFAULT_MTU: usize = 255;

/// A single transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: Flags,
    /// Sequence number of this frame.
    pub seq: u8,
    /// Sequence number being acknowledged (meaningful with `ACK`).
    pub ack: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: Flags, seq: u8, ack: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            flags,
            seq,
            ack,
            payload: payload.into(),
        }
    }

    pub fn syn(seq: u8) -> Self {
        Self::new(Flags::SYN, seq, 0, Bytes::new())
    }

    pub fn syn_ack(seq: u8, ack: u8) -> Self {
        Self::new(Flags::SYN | Flags::ACK, seq, ack, Bytes::new())
    }

    pub fn ack(ack: u8) -> Self {
        Self::new(Flags::ACK, 0, ack, Bytes::new())
    }

    pub fn fin(seq: u8) -> Self {
        Self::new(Flags::FIN, seq, 0, Bytes::new())
    }

    pub fn rst() -> Self {
        Self::new(Flags::RST, 0, 0, Bytes::new())
    }

    /// A data fragment; `eor` marks the last fragment of a message.
    pub fn data(seq: u8, payload: impl Into<Bytes>, eor: bool) -> Self {
        let mut flags = Flags::DATA;
        if eor {
            flags |= Flags::EOR;
        }
        Self::new(flags, seq, 0, payload)
    }

    pub fn is_data(&self) -> bool {
        self.flags.contains(Flags::DATA)
    }

    /// The total wire size of this frame.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + TRAILER_SIZE
    }

    /// Encode this frame into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        encode_frame(self.flags, self.seq, self.ack, &self.payload, dst)
    }
}

fn header_check(header: &[u8]) -> u8 {
    !header.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn frame_crc(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}

/// Encode a frame into the wire format.
///
/// ```text
/// +------+-------+-----+-----+-----------+-----+-----------+-----------+
/// | 0x01 | flags | seq | ack | len (BE16)| hcs | payload   | crc32 (LE)|
/// +------+-------+-----+-----+-----------+-----+-----------+-----------+
/// ```
///
/// `hcs` is the one's complement of the byte sum of flags, seq, ack and
/// length. The CRC covers flags, seq, ack, length and payload.
pub fn encode_frame(
    flags: Flags,
    seq: u8,
    ack: u8,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u16::MAX as usize,
        });
    }

    let len = (payload.len() as u16).to_be_bytes();
    let header = [flags.bits(), seq, ack, len[0], len[1]];

    dst.reserve(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    dst.put_u8(SYNC);
    dst.put_slice(&header);
    dst.put_u8(header_check(&header));
    dst.put_slice(payload);
    dst.put_u32_le(frame_crc(&header, payload));
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Bytes before the next delimiter are discarded. Returns `Ok(None)` if the
/// buffer does not yet hold a complete frame.
///
/// Errors leave the buffer positioned for the next attempt:
/// - a bad header check skips one byte so the scan resumes inside the
///   damaged region
/// - a bad CRC behind a valid header skips the whole frame
/// - a structurally invalid frame is consumed and reported as `Malformed`
///
/// A single flipped bit anywhere after the delimiter is always detected. Wider
/// damage escapes detection only if it defeats both the header check and
/// CRC-32.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    match src.iter().position(|b| *b == SYNC) {
        Some(0) => {}
        Some(skip) => {
            trace!(skip, "discarding bytes before delimiter");
            src.advance(skip);
        }
        None => {
            if !src.is_empty() {
                trace!(skip = src.len(), "discarding bytes before delimiter");
                src.clear();
            }
            return Ok(None);
        }
    }

    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header: [u8; 5] = [src[1], src[2], src[3], src[4], src[5]];
    let expected = header_check(&header);
    if src[6] != expected {
        let actual = src[6];
        src.advance(1);
        return Err(FrameError::HeaderChecksum { expected, actual });
    }

    let payload_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if payload_len > max_payload {
        src.advance(1);
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len + TRAILER_SIZE;
    if src.len() < total {
        return Ok(None);
    }

    let payload_end = HEADER_SIZE + payload_len;
    let expected = frame_crc(&header, &src[HEADER_SIZE..payload_end]);
    let actual = u32::from_le_bytes([
        src[payload_end],
        src[payload_end + 1],
        src[payload_end + 2],
        src[payload_end + 3],
    ]);
    if expected != actual {
        src.advance(total);
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    src.advance(TRAILER_SIZE);

    let flags = validate_flags(header[0], payload_len)?;
    Ok(Some(Frame {
        flags,
        seq: header[1],
        ack: header[2],
        payload,
    }))
}

fn validate_flags(raw: u8, payload_len: usize) -> Result<Flags> {
    let flags = Flags::from_bits(raw)
        .ok_or_else(|| FrameError::Malformed(format!("undefined flag bits 0x{raw:02x}")))?;

    if flags.is_empty() {
        return Err(FrameError::Malformed("no flags set".to_string()));
    }
    if payload_len > 0 && !flags.contains(Flags::DATA) {
        return Err(FrameError::Malformed(format!(
            "{payload_len} payload bytes without DATA ({flags:?})"
        )));
    }
    if flags.contains(Flags::EOR) && !flags.contains(Flags::DATA) {
        return Err(FrameError::Malformed(format!("EOR without DATA ({flags:?})")));
    }
    if flags.contains(Flags::DATA) && flags.intersects(Flags::SYN | Flags::FIN | Flags::RST) {
        return Err(FrameError::Malformed(format!(
            "DATA combined with control flags ({flags:?})"
        )));
    }
    Ok(flags)
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload per frame in bytes. Default: 255.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MTU,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_decode_data() {
        let frame = Frame::data(7, &b"version"[..], true);
        let mut buf = encoded(&frame);
        assert_eq!(buf.len(), frame.wire_size());
        assert_eq!(buf[0], SYNC);

        let decoded = decode_frame(&mut buf, DEFAULT_MTU).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_control_frames_have_no_payload() {
        for frame in [
            Frame::syn(0),
            Frame::syn_ack(0, 0),
            Frame::ack(3),
            Frame::fin(9),
            Frame::rst(),
        ] {
            let mut buf = encoded(&frame);
            assert_eq!(buf.len(), HEADER_SIZE + TRAILER_SIZE);
            let decoded = decode_frame(&mut buf, DEFAULT_MTU).unwrap().unwrap();
            assert_eq!(decoded.flags, frame.flags);
            assert!(decoded.payload.is_empty());
        }
    }

    #[test]
    fn test_known_layout() {
        let buf = encoded(&Frame::ack(5));
        // flags=0x40 seq=0 ack=5 len=0 -> sum 0x45 -> hcs 0xba
        assert_eq!(&buf[..HEADER_SIZE], &[0x01, 0x40, 0x00, 0x05, 0x00, 0x00, 0xba]);
        let crc = crc32fast::hash(&[0x40, 0x00, 0x05, 0x00, 0x00]);
        assert_eq!(&buf[HEADER_SIZE..], &crc.to_le_bytes());
    }

    #[test]
    fn test_decode_incomplete() {
        let full = encoded(&Frame::data(1, &b"hello"[..], true));

        let mut header_only = BytesMut::from(&full[..4]);
        assert!(decode_frame(&mut header_only, DEFAULT_MTU).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(decode_frame(&mut partial, DEFAULT_MTU).unwrap().is_none());
        assert_eq!(partial.len(), full.len() - 1, "incomplete input must not be consumed");
    }

    #[test]
    fn test_skips_noise_before_delimiter() {
        let frame = Frame::data(2, &b"ls"[..], true);
        let mut buf = BytesMut::from(&b"\xff\xfe garbage"[..]);
        buf.extend_from_slice(&encoded(&frame));

        let decoded = decode_frame(&mut buf, DEFAULT_MTU).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_noise_only_is_discarded() {
        let mut buf = BytesMut::from(&b"\xff\xfe\x00"[..]);
        assert!(decode_frame(&mut buf, DEFAULT_MTU).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_corruption_skips_one_byte() {
        let mut buf = encoded(&Frame::data(0, &b"abc"[..], true));
        let before = buf.len();
        buf[4] ^= 0x01;

        let err = decode_frame(&mut buf, DEFAULT_MTU).unwrap_err();
        assert!(matches!(err, FrameError::HeaderChecksum { .. }));
        assert!(err.is_corruption());
        assert_eq!(buf.len(), before - 1);
    }

    #[test]
    fn test_body_corruption_skips_frame() {
        let mut buf = encoded(&Frame::data(0, &b"abc"[..], true));
        let second = Frame::data(1, &b"def"[..], true);
        buf.extend_from_slice(&encoded(&second));
        buf[HEADER_SIZE] ^= 0x80;

        let err = decode_frame(&mut buf, DEFAULT_MTU).unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
        assert_eq!(decode_frame(&mut buf, DEFAULT_MTU).unwrap().unwrap(), second);
    }

    #[test]
    fn test_every_single_bit_flip_is_detected() {
        let frame = Frame::data(42, &b"hello world"[..], true);
        let clean = encoded(&frame);

        for index in 1..clean.len() {
            for bit in 0..8 {
                let mut buf = clean.clone();
                buf[index] ^= 1 << bit;

                let first = decode_frame(&mut buf, DEFAULT_MTU);
                assert!(
                    matches!(&first, Err(e) if e.is_corruption()),
                    "flip at byte {index} bit {bit} gave {first:?}"
                );

                // Whatever remains must never decode into a frame.
                loop {
                    match decode_frame(&mut buf, DEFAULT_MTU) {
                        Ok(None) => break,
                        Ok(Some(f)) => panic!("false frame after flip at {index}/{bit}: {f:?}"),
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    #[test]
    fn test_payload_too_large() {
        let mut buf = BytesMut::new();
        encode_frame(Flags::DATA | Flags::EOR, 0, 0, &[0u8; 300], &mut buf).unwrap();

        let result = decode_frame(&mut buf, DEFAULT_MTU);
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 300, max: DEFAULT_MTU })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut buf = BytesMut::new();
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            encode_frame(Flags::DATA, 0, 0, &payload, &mut buf),
            Err(FrameError::PayloadTooLarge { .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_flag_combinations() {
        let cases: [(Flags, &[u8]); 4] = [
            (Flags::ACK, b"x"),
            (Flags::EOR, b""),
            (Flags::DATA | Flags::SYN, b"x"),
            (Flags::empty(), b""),
        ];
        for (flags, payload) in cases {
            let mut buf = BytesMut::new();
            encode_frame(flags, 0, 0, payload, &mut buf).unwrap();
            let result = decode_frame(&mut buf, DEFAULT_MTU);
            assert!(
                matches!(result, Err(FrameError::Malformed(_))),
                "{flags:?} should be malformed"
            );
            assert!(buf.is_empty(), "malformed frame must be consumed");
        }
    }

    #[test]
    fn test_undefined_flag_bits_are_malformed() {
        let mut buf = BytesMut::new();
        let raw = Flags::from_bits(0x40).unwrap();
        encode_frame(raw, 0, 0, b"", &mut buf).unwrap();
        // Set an undefined bit and fix up both checks so only the flags are wrong.
        buf[1] = 0x44;
        let header = [buf[1], buf[2], buf[3], buf[4], buf[5]];
        buf[6] = header_check(&header);
        let crc = frame_crc(&header, b"");
        let len = buf.len();
        buf[len - 4..].copy_from_slice(&crc.to_le_bytes());

        assert!(matches!(
            decode_frame(&mut buf, DEFAULT_MTU),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_data_message() {
        let frame = Frame::data(3, Bytes::new(), true);
        let mut buf = encoded(&frame);
        assert_eq!(decode_frame(&mut buf, DEFAULT_MTU).unwrap().unwrap(), frame);
    }
}
