//! In-memory byte encoding for trained models.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! magic "HLMK" | version u16 | kind u8 | payload length u64 | payload | blake3 digest (32 bytes)
//! ```
//!
//! The payload is the bincode encoding of the model, which stores floats by
//! their bit pattern, so a decoded model reproduces the original exactly.
//! The digest covers everything before it, so truncation, bit flips and
//! foreign bytes all surface as [`Error::CorruptModel`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"HLMK";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 1 + 8;
const DIGEST_LEN: usize = 32;

/// Which model a byte sequence holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModelKind {
    ObjectDetector = 1,
    ShapePredictor = 2,
    DetectOperation = 3,
}

impl ModelKind {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::ObjectDetector),
            2 => Some(Self::ShapePredictor),
            3 => Some(Self::DetectOperation),
            _ => None,
        }
    }
}

/// A model that can be written with [`serialize`] and read back with [`deserialize`].
pub trait Persist: Serialize + DeserializeOwned {
    const KIND: ModelKind;

    /// Structural checks run after decoding.
    fn check(&self) -> Result<()> {
        Ok(())
    }
}

pub fn serialize<M: Persist>(model: &M) -> Result<Vec<u8>> {
    encode(M::KIND, model)
}

/// Decode a model and run its structural checks. Any failure is reported
/// as [`Error::CorruptModel`].
pub fn deserialize<M: Persist>(bytes: &[u8]) -> Result<M> {
    let model: M = decode(M::KIND, bytes)?;
    model
        .check()
        .map_err(|e| Error::CorruptModel(e.to_string()))?;
    Ok(model)
}

pub fn encode<T: Serialize>(kind: ModelKind, value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + DIGEST_LEN);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.push(kind as u8);
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&payload);

    let digest = blake3::hash(&bytes);
    bytes.extend_from_slice(digest.as_bytes());
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(kind: ModelKind, bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN + DIGEST_LEN {
        return Err(Error::CorruptModel(format!(
            "{} bytes is too short for a model",
            bytes.len()
        )));
    }
    if &bytes[..4] != MAGIC {
        return Err(Error::CorruptModel("not a hog-landmark model".into()));
    }

    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
    if blake3::hash(body).as_bytes() != digest {
        return Err(Error::CorruptModel("checksum mismatch".into()));
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(Error::CorruptModel(format!(
            "unsupported format version {}",
            version
        )));
    }

    let found = ModelKind::from_u8(bytes[6])
        .ok_or_else(|| Error::CorruptModel(format!("unknown model kind {}", bytes[6])))?;
    if found != kind {
        return Err(Error::CorruptModel(format!(
            "expected {:?}, found {:?}",
            kind, found
        )));
    }

    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[7..HEADER_LEN]);
    let payload = &body[HEADER_LEN..];
    if u64::from_le_bytes(len) != payload.len() as u64 {
        return Err(Error::CorruptModel("payload length mismatch".into()));
    }

    bincode::deserialize(payload).map_err(|e| Error::CorruptModel(e.to_string()))
}
