//! Append-only journal of checksummed frames.
//!
//! ## Frame layout
//!
//! ```text
//! | magic (4) | payload_len u32 LE (4) | payload | crc32 u32 LE (4) |
//! ```
//!
//! The CRC covers magic, length and payload. Replay stops at the first frame
//! that is incomplete or fails its checksum; everything from that offset on
//! is treated as a torn write and truncated.
//!
//! [`Journal::rewrite`] replaces the whole journal with a new set of frames
//! in one atomic backend swap, which is how callers compact it.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};

/// Magic bytes starting every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"CSJ1";

const HEADER_SIZE: usize = 8;
const CRC_SIZE: usize = 4;
const MAX_PAYLOAD: usize = u32::MAX as usize;

/// Result of replaying a journal on open.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Replay {
    /// Payloads of all intact frames, in append order.
    pub frames: Vec<Vec<u8>>,
    /// Bytes discarded from the tail (torn or corrupted frame).
    pub discarded_bytes: u64,
}

/// A durable append-only log of opaque payloads.
///
/// Every [`append`](Journal::append) is flushed and synced before it
/// returns, so an acknowledged frame survives a crash.
pub struct Journal<B: StorageBackend> {
    backend: B,
    frames: u64,
}

impl<B: StorageBackend> Journal<B> {
    /// Opens a journal over `backend`, replaying existing frames.
    ///
    /// A torn trailing frame is cut off so later appends start on a clean
    /// boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or truncated.
    pub fn open(mut backend: B) -> StorageResult<(Self, Replay)> {
        let bytes = backend.read_all()?;

        let mut replay = Replay::default();
        let mut pos = 0usize;

        while let Some((payload, frame_len)) = decode_frame(&bytes[pos..]) {
            replay.frames.push(payload.to_vec());
            pos += frame_len;
        }

        if pos < bytes.len() {
            replay.discarded_bytes = (bytes.len() - pos) as u64;
            backend.truncate(pos as u64)?;
        }

        let journal = Self {
            backend,
            frames: replay.frames.len() as u64,
        };
        Ok((journal, replay))
    }

    /// Appends one payload as a frame and makes it durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is too large or the write fails.
    pub fn append(&mut self, payload: &[u8]) -> StorageResult<()> {
        let frame = encode_frame(payload)?;
        self.backend.append(&frame)?;
        self.backend.sync()?;
        self.frames += 1;
        Ok(())
    }

    /// Appends several payloads as consecutive frames with a single sync.
    ///
    /// After a crash the journal replays a prefix of `payloads`.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload is too large or the write fails.
    pub fn append_all<P: AsRef<[u8]>>(&mut self, payloads: &[P]) -> StorageResult<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let bytes = encode_frames(payloads)?;
        self.backend.append(&bytes)?;
        self.backend.sync()?;
        self.frames += payloads.len() as u64;
        Ok(())
    }

    /// Replaces every frame with `payloads`, in order.
    ///
    /// The swap is atomic: after a crash the journal replays either the old
    /// frames or the new ones.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload is too large or the write fails; the
    /// old frames are then still in place.
    pub fn rewrite<P: AsRef<[u8]>>(&mut self, payloads: &[P]) -> StorageResult<()> {
        let bytes = encode_frames(payloads)?;
        self.backend.replace(&bytes)?;
        self.frames = payloads.len() as u64;
        Ok(())
    }

    /// Number of frames in the journal.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Size of the journal in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.size()
    }
}

fn encode_frames<P: AsRef<[u8]>>(payloads: &[P]) -> StorageResult<Vec<u8>> {
    let mut bytes = Vec::new();
    for payload in payloads {
        bytes.extend_from_slice(&encode_frame(payload.as_ref())?);
    }
    Ok(bytes)
}

fn encode_frame(payload: &[u8]) -> StorageResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(StorageError::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Decodes the frame at the start of `bytes`, returning its payload and total length.
fn decode_frame(bytes: &[u8]) -> Option<(&[u8], usize)> {
    if bytes.len() < HEADER_SIZE + CRC_SIZE || bytes[..4] != FRAME_MAGIC {
        return None;
    }

    let payload_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let total = HEADER_SIZE.checked_add(payload_len)?.checked_add(CRC_SIZE)?;
    if bytes.len() < total {
        return None;
    }

    let body_end = HEADER_SIZE + payload_len;
    let stored = u32::from_le_bytes([
        bytes[body_end],
        bytes[body_end + 1],
        bytes[body_end + 2],
        bytes[body_end + 3],
    ]);
    if stored != compute_crc32(&bytes[..body_end]) {
        return None;
    }

    Some((&bytes[HEADER_SIZE..body_end], total))
}

/// Computes a CRC32 (IEEE polynomial) checksum.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
