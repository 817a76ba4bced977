//! Mux frame codec
//!
//! ```text
//!  0       2       3       4               8
//!  +-------+-------+-------+---------------+----------------
//!  | length| flags |  rsv  |      cid      | payload ...
//!  +-------+-------+-------+---------------+----------------
//! ```
//!
//! `length` counts payload bytes only. All integers are little-endian.

use crate::buffer::{Buffer, BufferPool, BufferStream};

/// Size of the frame header
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest payload a single frame can carry
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize - FRAME_HEADER_LEN;

/// Cap on unparsed bytes buffered per parent (1 MiB)
pub const MAX_READ_BUFFER: usize = 1024 * 1024;

/// Frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameFlag {
    Open = 0,
    Close = 1,
    FlowPause = 2,
    FlowResume = 3,
    Data = 4,
}

impl FrameFlag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FrameFlag::Open),
            1 => Some(FrameFlag::Close),
            2 => Some(FrameFlag::FlowPause),
            3 => Some(FrameFlag::FlowResume),
            4 => Some(FrameFlag::Data),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameFlag::Open => "open",
            FrameFlag::Close => "close",
            FrameFlag::FlowPause => "flow-pause",
            FrameFlag::FlowResume => "flow-resume",
            FrameFlag::Data => "data",
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u16,
    /// Raw flag byte; unknown values are kept so the reader can log them
    pub flags: u8,
    pub cid: u32,
}

impl FrameHeader {
    pub fn new(flag: FrameFlag, cid: u32, length: u16) -> Self {
        Self {
            length,
            flags: flag as u8,
            cid,
        }
    }

    pub fn flag(&self) -> Option<FrameFlag> {
        FrameFlag::from_u8(self.flags)
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[0..2].copy_from_slice(&self.length.to_le_bytes());
        out[2] = self.flags;
        out[4..8].copy_from_slice(&self.cid.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..FRAME_HEADER_LEN)?;
        Some(Self {
            length: u16::from_le_bytes([header[0], header[1]]),
            flags: header[2],
            cid: u32::from_le_bytes([header[4], header[5], header[6], header[7]]),
        })
    }
}

/// A header-only frame (Open, Close, FlowPause, FlowResume)
pub fn control_frame(pool: &BufferPool, flag: FrameFlag, cid: u32) -> Buffer {
    pool.acquire_from(&FrameHeader::new(flag, cid, 0).encode())
}

/// Wrap a child payload into one or more Data frames, in order
pub fn data_frames(pool: &BufferPool, cid: u32, mut buf: Buffer) -> Vec<Buffer> {
    if buf.len() <= MAX_FRAME_PAYLOAD {
        let header = FrameHeader::new(FrameFlag::Data, cid, buf.len() as u16);
        buf.prepend(&header.encode());
        return vec![buf];
    }

    let frames = buf
        .as_slice()
        .chunks(MAX_FRAME_PAYLOAD)
        .map(|chunk| {
            let mut frame = pool.acquire(FRAME_HEADER_LEN + chunk.len());
            frame.extend_from_slice(
                &FrameHeader::new(FrameFlag::Data, cid, chunk.len() as u16).encode(),
            );
            frame.extend_from_slice(chunk);
            frame
        })
        .collect();
    pool.release(buf);
    frames
}

/// Cut the next complete frame off the stream; the returned buffer holds
/// only the payload
pub fn next_frame(stream: &mut BufferStream, pool: &BufferPool) -> Option<(FrameHeader, Buffer)> {
    let header = FrameHeader::decode(stream.peek(FRAME_HEADER_LEN)?)?;
    let total = FRAME_HEADER_LEN + header.length as usize;
    if stream.len() < total {
        return None;
    }
    let mut frame = stream.read_exact(pool, total)?;
    frame.advance(FRAME_HEADER_LEN);
    Some((header, frame))
}
