//! Record checksums for snapshot files.

use crate::error::{AdapterError, Result};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

/// Seed for XXH64 record checksums.
const XXH64_SEED: u64 = 0;

/// Checksum algorithm selected for snapshot records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    CRC32,
    /// Lower 32 bits of XXH64.
    XXH64,
}

impl ChecksumAlgorithm {
    pub fn compute(&self, data: &[u8]) -> u32 {
        match self {
            ChecksumAlgorithm::CRC32 => crc32fast::hash(data),
            ChecksumAlgorithm::XXH64 => (xxh64(data, XXH64_SEED) & 0xFFFF_FFFF) as u32,
        }
    }

    pub fn verify(&self, data: &[u8], expected: u32) -> Result<()> {
        let actual = self.compute(data);
        if actual == expected {
            Ok(())
        } else {
            Err(AdapterError::ChecksumMismatch { expected, actual })
        }
    }

    /// Tag byte stored in snapshot headers.
    pub fn as_u8(&self) -> u8 {
        match self {
            ChecksumAlgorithm::CRC32 => 1,
            ChecksumAlgorithm::XXH64 => 2,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ChecksumAlgorithm::CRC32),
            2 => Some(ChecksumAlgorithm::XXH64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_verify() {
        let algo = ChecksumAlgorithm::CRC32;
        let checksum = algo.compute(b"hello world");
        assert_eq!(checksum, algo.compute(b"hello world"));
        assert!(algo.verify(b"hello world", checksum).is_ok());
        assert!(algo.verify(b"hello world", 0x12345678).is_err());
    }

    #[test]
    fn test_xxh64_verify() {
        let algo = ChecksumAlgorithm::XXH64;
        let checksum = algo.compute(b"test data");
        assert!(algo.verify(b"test data", checksum).is_ok());
        assert!(matches!(
            algo.verify(b"test datA", checksum),
            Err(AdapterError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_algorithms_differ() {
        let data = b"test data";
        assert_ne!(
            ChecksumAlgorithm::CRC32.compute(data),
            ChecksumAlgorithm::XXH64.compute(data)
        );
    }

    #[test]
    fn test_tag_conversion() {
        for algo in [ChecksumAlgorithm::CRC32, ChecksumAlgorithm::XXH64] {
            assert_eq!(ChecksumAlgorithm::from_u8(algo.as_u8()), Some(algo));
        }
        assert_eq!(ChecksumAlgorithm::from_u8(0), None);
    }
}
