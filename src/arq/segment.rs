//! Wire format of reliable-session segments.
//!
//! All integers are little endian.
//!
//! ```text
//!  0       4     5     6       8       12      16      20      24
//! +-------+-----+-----+-------+-------+-------+-------+-------+------+
//! | conv  | cmd | frg |  wnd  |  ts   |  sn   |  una  |  len  | data |
//! +-------+-----+-----+-------+-------+-------+-------+-------+------+
//! ```
//!
//! A datagram holds one or more segments back to back.

use super::ArqError;
use bytes::{BufMut, Bytes, BytesMut};

/// Segment header size in bytes
pub const SEGMENT_HEADER_LEN: usize = 24;

/// Segment commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentKind {
    /// Application data
    Push = 81,
    /// Selective acknowledgement of one segment
    Ack = 82,
    /// Ask the peer for its window size
    WindowAsk = 83,
    /// Tell the peer our window size
    WindowTell = 84,
}

impl TryFrom<u8> for SegmentKind {
    type Error = ArqError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            81 => Ok(SegmentKind::Push),
            82 => Ok(SegmentKind::Ack),
            83 => Ok(SegmentKind::WindowAsk),
            84 => Ok(SegmentKind::WindowTell),
            other => Err(ArqError::UnknownSegment(other)),
        }
    }
}

/// One decoded segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub conv: u32,
    pub kind: SegmentKind,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub data: Bytes,
}

impl Segment {
    /// Append the encoded segment to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u32_le(self.conv);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    pub fn encoded_size(&self) -> usize {
        SEGMENT_HEADER_LEN + self.data.len()
    }

    /// Decode every segment in a datagram.
    ///
    /// Fails without returning partial results if any segment is malformed,
    /// belongs to another conv, or claims more data than is present.
    pub fn decode_all(conv: u32, datagram: &Bytes) -> Result<Vec<Segment>, ArqError> {
        let mut segments = Vec::new();
        let mut offset = 0;

        while datagram.len() - offset >= SEGMENT_HEADER_LEN {
            let header = &datagram[offset..offset + SEGMENT_HEADER_LEN];
            let seg_conv = read_u32(header, 0);
            if seg_conv != conv {
                return Err(ArqError::ConvMismatch {
                    expected: conv,
                    actual: seg_conv,
                });
            }

            let kind = SegmentKind::try_from(header[4])?;
            let len = read_u32(header, 20) as usize;
            let data_start = offset + SEGMENT_HEADER_LEN;
            if len > datagram.len() - data_start {
                return Err(ArqError::Truncated {
                    claimed: len,
                    available: datagram.len() - data_start,
                });
            }

            segments.push(Segment {
                conv: seg_conv,
                kind,
                frg: header[5],
                wnd: u16::from_le_bytes([header[6], header[7]]),
                ts: read_u32(header, 8),
                sn: read_u32(header, 12),
                una: read_u32(header, 16),
                data: datagram.slice(data_start..data_start + len),
            });
            offset = data_start + len;
        }

        if offset != datagram.len() || segments.is_empty() {
            return Err(ArqError::Truncated {
                claimed: SEGMENT_HEADER_LEN,
                available: datagram.len() - offset,
            });
        }

        Ok(segments)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
