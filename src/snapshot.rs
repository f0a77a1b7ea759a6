//! Snapshot codec.
//!
//! Every index persists through the same framing: a 4-byte magic, a `u16`
//! format version, a 1-byte index-kind tag, then a postcard payload holding
//! the index's state struct. Tree indexes flatten their node graphs into
//! arrays with integer child indices before encoding, so the payload never
//! contains deep recursive structures.
//!
//! The format is not a cross-version or cross-implementation contract;
//! magic/version/kind checks exist to fail fast on the wrong file, not to
//! support migration.

use crate::error::{IndexError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

const MAGIC: &[u8; 4] = b"VNTG";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 7;

/// Tag identifying which index wrote a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum IndexKind {
    Brute = 1,
    Kd = 2,
    Ball = 3,
    Vp = 4,
    Cover = 5,
    Lsh = 6,
    Pq = 7,
}

impl IndexKind {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Brute),
            2 => Some(Self::Kd),
            3 => Some(Self::Ball),
            4 => Some(Self::Vp),
            5 => Some(Self::Cover),
            6 => Some(Self::Lsh),
            7 => Some(Self::Pq),
            _ => None,
        }
    }
}

/// Encode `state` and write it to `path`.
///
/// The file handle is scoped to this call; it is closed on every exit path.
pub(crate) fn save<T: Serialize>(path: &Path, kind: IndexKind, state: &T) -> Result<()> {
    let payload = postcard::to_stdvec(state)?;

    let mut file = fs::File::create(path)?;
    file.write_all(MAGIC)?;
    file.write_all(&VERSION.to_le_bytes())?;
    file.write_all(&[kind as u8])?;
    file.write_all(&payload)?;
    file.flush()?;

    tracing::debug!(path = %path.display(), ?kind, bytes = payload.len(), "snapshot written");
    Ok(())
}

/// Read a snapshot from `path`, validate its header, and decode the payload.
pub(crate) fn load<T: DeserializeOwned>(path: &Path, kind: IndexKind) -> Result<T> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    if buf.len() < HEADER_LEN {
        return Err(IndexError::Codec("snapshot file is truncated".to_string()));
    }
    if &buf[..4] != MAGIC {
        return Err(IndexError::Codec("bad magic bytes".to_string()));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != VERSION {
        return Err(IndexError::Codec(format!(
            "unsupported snapshot version {version}"
        )));
    }
    match IndexKind::from_u8(buf[6]) {
        Some(found) if found == kind => {}
        Some(found) => {
            return Err(IndexError::Codec(format!(
                "snapshot holds a {found:?} index, expected {kind:?}"
            )));
        }
        None => {
            return Err(IndexError::Codec(format!(
                "unknown index kind tag {}",
                buf[6]
            )));
        }
    }

    let state = postcard::from_bytes(&buf[HEADER_LEN..])?;
    tracing::debug!(path = %path.display(), ?kind, "snapshot loaded");
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.snap");

        let state = vec![(1i64, 2.5f64), (-3, 0.0)];
        save(&path, IndexKind::Brute, &state).unwrap();
        let loaded: Vec<(i64, f64)> = load(&path, IndexKind::Brute).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn rejects_wrong_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.snap");

        save(&path, IndexKind::Kd, &42u32).unwrap();
        let err = load::<u32>(&path, IndexKind::Ball).unwrap_err();
        assert!(matches!(err, IndexError::Codec(_)));
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.snap");
        fs::write(&path, b"XXXX\x01\x00\x01junk").unwrap();

        let err = load::<u32>(&path, IndexKind::Brute).unwrap_err();
        assert!(matches!(err, IndexError::Codec(_)));
    }

    #[test]
    fn missing_file_surfaces_io_error() {
        let err = load::<u32>(Path::new("/nonexistent/state.snap"), IndexKind::Brute).unwrap_err();
        assert!(matches!(err, IndexError::Io(_)));
    }
}
