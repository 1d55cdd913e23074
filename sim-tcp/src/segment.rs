//! Wire format of a transport segment.
//!
//! A [`Segment`] travels as the opaque payload of a network
//! [`crate::packet::Packet`].  This module only converts between the two
//! representations; no I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |        Destination Port       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Kind      |                    Window ...                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... Window   |               Sequence Number ...             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | ... Sequence  |        Payload Length         |   Checksum    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Checksum    |                Payload ...                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 17 bytes.
//! src(2) + dst(2) + kind(1) + window(4) + seq(4) + payload_len(2) + checksum(2)
//!
//! The meaning of `seq` depends on the kind: the ISN for SYN, the cumulative
//! acknowledgment number for ACK, the first payload byte for DATA.

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 17;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

// Byte offsets of each field within the serialised header.
const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_KIND: usize = 4;
const OFF_WINDOW: usize = 5;
const OFF_SEQ: usize = 9;
const OFF_PAYLOAD_LEN: usize = 13;
const OFF_CHECKSUM: usize = 15;

/// Segment type carried in the `kind` header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Connection request.
    Syn,
    /// Cumulative acknowledgment (also used as the SYN-ACK).
    Ack,
    /// Connection teardown, or reset when no connection matches.
    Fin,
    /// Stream payload.
    Data,
}

impl SegmentKind {
    pub fn code(self) -> u8 {
        match self {
            Self::Syn => 0,
            Self::Ack => 1,
            Self::Fin => 2,
            Self::Data => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, SegmentError> {
        match code {
            0 => Ok(Self::Syn),
            1 => Ok(Self::Ack),
            2 => Ok(Self::Fin),
            3 => Ok(Self::Data),
            other => Err(SegmentError::UnknownKind(other)),
        }
    }
}

impl std::fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Syn => "SYN",
            Self::Ack => "ACK",
            Self::Fin => "FIN",
            Self::Data => "DATA",
        };
        f.write_str(name)
    }
}

/// One transport segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub src_port: u16,
    pub dst_port: u16,
    pub kind: SegmentKind,
    /// Receiver's advertised free space, or the sender's congestion window on
    /// SYN and DATA segments.
    pub window: u32,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Build a control segment (no payload).
    pub fn control(src_port: u16, dst_port: u16, kind: SegmentKind, window: u32, seq: u32) -> Self {
        Self {
            src_port,
            dst_port,
            kind,
            window,
            seq,
            payload: Vec::new(),
        }
    }

    /// Sequence number just past this segment's payload.
    pub fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.payload.len() as u32)
    }

    /// Serialise this segment into a newly allocated byte vector.
    ///
    /// The payload length and checksum fields are computed here.
    pub fn pack(&self) -> Result<Vec<u8>, SegmentError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(SegmentError::PayloadTooLarge(payload_len));
        }
        let mut buf = vec![0u8; HEADER_LEN + payload_len];

        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[OFF_KIND] = self.kind.code();
        buf[OFF_WINDOW..OFF_WINDOW + 4].copy_from_slice(&self.window.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload_len as u16).to_be_bytes());
        // Checksum field is zero while computing the checksum.
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        Ok(buf)
    }

    /// Parse a [`Segment`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the `payload_len` field disagrees with `buf.len()`,
    /// - the kind byte is not a known segment type, or
    /// - the checksum does not verify.
    pub fn unpack(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() < HEADER_LEN {
            return Err(SegmentError::TooShort(buf.len()));
        }

        let payload_len = usize::from(read_u16(buf, OFF_PAYLOAD_LEN));
        if buf.len() != HEADER_LEN + payload_len {
            return Err(SegmentError::LengthMismatch {
                declared: payload_len,
                actual: buf.len() - HEADER_LEN,
            });
        }

        // Verify checksum: zero the stored field, recompute, compare.
        let checksum = read_u16(buf, OFF_CHECKSUM);
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&[0, 0]);
        if internet_checksum(&scratch) != checksum {
            return Err(SegmentError::ChecksumFailed);
        }

        Ok(Segment {
            src_port: read_u16(buf, OFF_SRC_PORT),
            dst_port: read_u16(buf, OFF_DST_PORT),
            kind: SegmentKind::from_code(buf[OFF_KIND])?,
            window: read_u32(buf, OFF_WINDOW),
            seq: read_u32(buf, OFF_SEQ),
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Errors that can arise when packing or parsing a segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    #[error("buffer of {0} bytes is too short to contain a segment header")]
    TooShort(usize),
    #[error("payload_len field says {declared} bytes but {actual} follow the header")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown segment kind {0}")]
    UnknownKind(u8),
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("payload of {0} bytes does not fit the length field")]
    PayloadTooLarge(usize),
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// Sum consecutive 16-bit big-endian words, fold the carry, return the
/// one's-complement.  The caller must zero any checksum field within `data`
/// before calling this function.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    // Odd trailing byte, padded with a zero byte on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u32, payload: &[u8]) -> Segment {
        Segment {
            src_port: 1024,
            dst_port: 80,
            kind: SegmentKind::Data,
            window: 4000,
            seq,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let seg = data(1001, b"hello");
        assert_eq!(Segment::unpack(&seg.pack().unwrap()).unwrap(), seg);
    }

    #[test]
    fn every_kind_survives_the_wire() {
        for kind in [SegmentKind::Syn, SegmentKind::Ack, SegmentKind::Fin, SegmentKind::Data] {
            let seg = Segment::control(7, 9, kind, u32::MAX, 0xdead_beef);
            assert_eq!(Segment::unpack(&seg.pack().unwrap()).unwrap(), seg);
        }
    }

    #[test]
    fn encoded_length_equals_header_plus_payload() {
        let bytes = data(0, b"exactly twelve!").pack().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 15);
    }

    #[test]
    fn fields_are_big_endian_on_wire() {
        let seg = Segment::control(0x0102, 0x0304, SegmentKind::Ack, 0x0506_0708, 0x090a_0b0c);
        let bytes = seg.pack().unwrap();
        assert_eq!(&bytes[OFF_SRC_PORT..OFF_SRC_PORT + 2], &[0x01, 0x02]);
        assert_eq!(&bytes[OFF_DST_PORT..OFF_DST_PORT + 2], &[0x03, 0x04]);
        assert_eq!(bytes[OFF_KIND], 1);
        assert_eq!(&bytes[OFF_WINDOW..OFF_WINDOW + 4], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x09, 0x0a, 0x0b, 0x0c]);
    }

    #[test]
    fn unpack_short_buffer_is_rejected() {
        assert_eq!(Segment::unpack(&[]), Err(SegmentError::TooShort(0)));
        assert_eq!(
            Segment::unpack(&[0u8; HEADER_LEN - 1]),
            Err(SegmentError::TooShort(HEADER_LEN - 1))
        );
    }

    #[test]
    fn unpack_truncated_payload_is_rejected() {
        let mut bytes = data(0, b"data").pack().unwrap();
        bytes.pop();
        assert_eq!(
            Segment::unpack(&bytes),
            Err(SegmentError::LengthMismatch { declared: 4, actual: 3 })
        );
    }

    #[test]
    fn corrupt_byte_fails_checksum() {
        let mut bytes = data(99, b"test").pack().unwrap();
        bytes[HEADER_LEN] ^= 0xff;
        assert_eq!(Segment::unpack(&bytes), Err(SegmentError::ChecksumFailed));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = data(0, b"").pack().unwrap();
        bytes[OFF_KIND] = 9;
        // Recompute the checksum so only the kind is wrong.
        bytes[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&[0, 0]);
        let csum = internet_checksum(&bytes);
        bytes[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(Segment::unpack(&bytes), Err(SegmentError::UnknownKind(9)));
    }

    #[test]
    fn oversized_payload_cannot_be_packed() {
        let seg = data(0, &vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert_eq!(seg.pack(), Err(SegmentError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1)));
    }

    #[test]
    fn end_seq_wraps() {
        assert_eq!(data(u32::MAX - 1, b"abcd").end_seq(), 2);
    }
}
