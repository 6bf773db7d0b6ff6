//! On-disk snapshot of a persistent in-process engine.
//!
//! Format: header `[magic: 8B][version: 4B][algorithm: 1B][pad: 3B][count: 8B]`
//! followed by `count` records
//! `[checksum: 4B][container: 4B][key_len: 2B][value_len: 4B][key][value]`.
//! The checksum covers everything in the record after the checksum field.
//! Integers are little-endian.

use crate::checksum::ChecksumAlgorithm;
use crate::error::{AdapterError, Result};
use crate::types::{ContainerId, MAX_KEY_LEN, MAX_VALUE_LEN};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_MAGIC: &[u8; 8] = b"KVUDDSNP";
pub const SNAPSHOT_VERSION: u32 = 1;

const HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 14;

/// One key-value pair restored from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub container: ContainerId,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Accumulates records and writes them atomically.
pub struct SnapshotWriter {
    algorithm: ChecksumAlgorithm,
    body: Vec<u8>,
    count: u64,
}

impl SnapshotWriter {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self {
            algorithm,
            body: Vec::new(),
            count: 0,
        }
    }

    pub fn push(&mut self, container: ContainerId, key: &[u8], value: &[u8]) {
        let start = self.body.len();
        self.body.extend_from_slice(&[0u8; 4]);
        self.body.extend_from_slice(&container.to_le_bytes());
        self.body.extend_from_slice(&(key.len() as u16).to_le_bytes());
        self.body.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.body.extend_from_slice(key);
        self.body.extend_from_slice(value);

        let checksum = self.algorithm.compute(&self.body[start + 4..]);
        self.body[start..start + 4].copy_from_slice(&checksum.to_le_bytes());
        self.count += 1;
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Write to a temporary file, sync it, then rename over `path`.
    pub fn finish(self, path: &Path) -> Result<u64> {
        let tmp = temp_path(path);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(SNAPSHOT_MAGIC)?;
            file.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
            file.write_all(&[self.algorithm.as_u8(), 0, 0, 0])?;
            file.write_all(&self.count.to_le_bytes())?;
            file.write_all(&self.body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;

        tracing::debug!("Wrote snapshot {:?} with {} records", path, self.count);
        Ok(self.count)
    }
}

/// Read and verify every record of a snapshot file.
pub fn read_snapshot(path: &Path) -> Result<Vec<SnapshotRecord>> {
    let data = fs::read(path)?;
    let corrupted = |offset: usize| AdapterError::CorruptedSnapshot {
        path: path.to_path_buf(),
        offset: offset as u64,
    };

    if data.len() < HEADER_LEN || &data[..8] != SNAPSHOT_MAGIC {
        return Err(corrupted(0));
    }
    let version = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if version != SNAPSHOT_VERSION {
        return Err(corrupted(8));
    }
    let algorithm = ChecksumAlgorithm::from_u8(data[12]).ok_or_else(|| corrupted(12))?;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&data[16..24]);
    let count = u64::from_le_bytes(count_bytes);

    let mut records = Vec::new();
    let mut offset = HEADER_LEN;
    for _ in 0..count {
        if data.len() < offset + RECORD_HEADER_LEN {
            return Err(corrupted(offset));
        }
        let rec = &data[offset..];
        let checksum = u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]);
        let container = u32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]]);
        let key_len = u16::from_le_bytes([rec[8], rec[9]]) as usize;
        let value_len = u32::from_le_bytes([rec[10], rec[11], rec[12], rec[13]]) as usize;

        if key_len > MAX_KEY_LEN || value_len > MAX_VALUE_LEN {
            return Err(corrupted(offset));
        }
        let total = RECORD_HEADER_LEN + key_len + value_len;
        if rec.len() < total {
            return Err(corrupted(offset));
        }

        if let Err(e) = algorithm.verify(&rec[4..total], checksum) {
            tracing::warn!("Snapshot {:?} record at offset {} failed checksum", path, offset);
            return Err(e);
        }

        let key_start = RECORD_HEADER_LEN;
        let value_start = key_start + key_len;
        records.push(SnapshotRecord {
            container,
            key: rec[key_start..value_start].to_vec(),
            value: rec[value_start..total].to_vec(),
        });
        offset += total;
    }

    if offset != data.len() {
        return Err(corrupted(offset));
    }

    Ok(records)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.snap");

        let mut writer = SnapshotWriter::new(ChecksumAlgorithm::CRC32);
        writer.push(1, b"key1", b"value1");
        writer.push(2, b"key2", b"");
        assert_eq!(writer.len(), 2);
        assert_eq!(writer.finish(&path).unwrap(), 2);

        let records = read_snapshot(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].container, 1);
        assert_eq!(records[0].key, b"key1");
        assert_eq!(records[0].value, b"value1");
        assert_eq!(records[1].container, 2);
        assert!(records[1].value.is_empty());
        assert!(!dir.path().join("device.snap.tmp").exists());
    }

    #[test]
    fn test_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.snap");

        let writer = SnapshotWriter::new(ChecksumAlgorithm::XXH64);
        assert!(writer.is_empty());
        writer.finish(&path).unwrap();
        assert!(read_snapshot(&path).unwrap().is_empty());
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.snap");
        std::fs::write(&path, b"not a snapshot at all, clearly").unwrap();

        assert!(matches!(
            read_snapshot(&path),
            Err(AdapterError::CorruptedSnapshot { offset: 0, .. })
        ));
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flip.snap");

        let mut writer = SnapshotWriter::new(ChecksumAlgorithm::CRC32);
        writer.push(0, b"key1", b"value1");
        writer.finish(&path).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            read_snapshot(&path),
            Err(AdapterError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.snap");

        let mut writer = SnapshotWriter::new(ChecksumAlgorithm::CRC32);
        writer.push(0, b"key1", b"value1");
        writer.push(0, b"key2", b"value2");
        writer.finish(&path).unwrap();

        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 3]).unwrap();

        assert!(matches!(
            read_snapshot(&path),
            Err(AdapterError::CorruptedSnapshot { .. })
        ));
    }
}
