//! Binary envelope for engine snapshots crossing the worker boundary.
//!
//! ```text
//! Header (24 bytes):
//!   Magic: "FPSN" (4 bytes)
//!   Version: u16
//!   Flags: u16 (compression in lower 4 bits)
//!   Payload length: u64
//!   Reserved: 8 bytes
//!
//! Payload (variable):
//!   serde_json encoding of the engine, optionally LZ4 compressed
//! ```

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::schema::CompressionType;

/// Magic bytes identifying an engine snapshot.
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"FPSN";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Snapshot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Payload compression.
    pub compression: CompressionType,
    /// Stored payload length in bytes.
    pub payload_len: u64,
}

impl SnapshotHeader {
    /// Magic(4) + Version(2) + Flags(2) + PayloadLen(8) + Reserved(8) = 24
    pub const SIZE: usize = 24;

    /// Write header to output.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(SNAPSHOT_MAGIC)?;
        w.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
        w.write_all(&(self.compression as u16).to_le_bytes())?;
        w.write_all(&self.payload_len.to_le_bytes())?;
        w.write_all(&[0u8; 8])?;
        Ok(())
    }

    /// Read header from input.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, SnapshotError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }

        let mut buf2 = [0u8; 2];
        let mut buf8 = [0u8; 8];

        r.read_exact(&mut buf2)?;
        let version = u16::from_le_bytes(buf2);
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        r.read_exact(&mut buf2)?;
        let flags = u16::from_le_bytes(buf2);
        let compression = CompressionType::from_u8((flags & 0x0F) as u8)
            .ok_or(SnapshotError::UnknownCompression(flags & 0x0F))?;

        r.read_exact(&mut buf8)?;
        let payload_len = u64::from_le_bytes(buf8);

        // Reserved
        r.read_exact(&mut buf8)?;

        Ok(Self {
            compression,
            payload_len,
        })
    }
}

/// Serialized, self-contained capture of an engine.
///
/// Moved by value into exactly one task; workers decode their own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSnapshot {
    bytes: Vec<u8>,
}

impl EngineSnapshot {
    /// Serialize an engine into a snapshot.
    pub fn capture<E: Serialize>(
        engine: &E,
        compression: CompressionType,
    ) -> Result<Self, SnapshotError> {
        let json = serde_json::to_vec(engine)?;
        let payload = match compression {
            CompressionType::None => json,
            CompressionType::Lz4 => compress_lz4(&json),
        };

        let header = SnapshotHeader {
            compression,
            payload_len: payload.len() as u64,
        };
        let mut bytes = Vec::with_capacity(SnapshotHeader::SIZE + payload.len());
        header.write_to(&mut bytes)?;
        bytes.extend_from_slice(&payload);

        Ok(Self { bytes })
    }

    /// Wrap raw bytes received from elsewhere. Validation happens on restore.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode the header without touching the payload.
    pub fn header(&self) -> Result<SnapshotHeader, SnapshotError> {
        SnapshotHeader::read_from(&mut &self.bytes[..])
    }

    /// Rebuild a fresh engine from this snapshot.
    pub fn restore<E: DeserializeOwned>(&self) -> Result<E, SnapshotError> {
        let header = self.header()?;
        let payload = &self.bytes[SnapshotHeader::SIZE..];
        if payload.len() as u64 != header.payload_len {
            return Err(SnapshotError::LengthMismatch {
                expected: header.payload_len,
                actual: payload.len() as u64,
            });
        }

        let engine = match header.compression {
            CompressionType::None => serde_json::from_slice(payload)?,
            CompressionType::Lz4 => serde_json::from_slice(&decompress_lz4(payload)?)?,
        };
        Ok(engine)
    }
}

/// Compress data using LZ4.
#[cfg(feature = "lz4")]
pub fn compress_lz4(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompress LZ4 data.
#[cfg(feature = "lz4")]
pub fn decompress_lz4(data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| SnapshotError::Decompress(e.to_string()))
}

/// Fallback when LZ4 is not available.
#[cfg(not(feature = "lz4"))]
pub fn compress_lz4(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}

#[cfg(not(feature = "lz4"))]
pub fn decompress_lz4(data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
    Ok(data.to_vec())
}

/// Corrupt or undecodable snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Invalid snapshot magic bytes")]
    InvalidMagic,
    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u16),
    #[error("Unknown snapshot compression type: {0}")]
    UnknownCompression(u16),
    #[error("Snapshot payload length mismatch: header says {expected}, found {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("Snapshot decompression failed: {0}")]
    Decompress(String),
    #[error("Snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Snapshot truncated: {0}")]
    Io(#[from] io::Error),
}
