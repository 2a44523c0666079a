//! Chunk checksums (`Upload-Checksum`)
//!
//! The header carries `<algorithm> <digest>`, where the digest is either
//! base64 (as tus mandates) or lowercase/uppercase hex, which many clients
//! send instead. The two encodings never collide for the supported digest
//! lengths.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 3] = [Self::Sha1, Self::Sha256, Self::Md5];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        }
    }

    /// Raw digest length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Md5 => 16,
        }
    }

    /// Digest `data`
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Md5 => md5::compute(data).0.to_vec(),
        }
    }

    /// Comma-separated list for `Tus-Checksum-Algorithm`
    pub fn advertised() -> String {
        Self::ALL
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "md5" => Ok(Self::Md5),
            other => Err(format!("unsupported checksum algorithm: {}", other)),
        }
    }
}

/// Checksum announced for one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkChecksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: Vec<u8>,
}

impl ChunkChecksum {
    /// Parse an `Upload-Checksum` header value
    pub fn parse(header: &str) -> Result<Self, String> {
        let mut parts = header.split_whitespace();
        let (Some(algo), Some(encoded), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("malformed Upload-Checksum: {}", header));
        };

        let algorithm: ChecksumAlgorithm = algo.parse()?;
        let digest = decode_digest(algorithm, encoded)
            .ok_or_else(|| format!("undecodable {} digest", algorithm))?;

        Ok(Self { algorithm, digest })
    }

    /// Whether `data` hashes to the announced digest
    pub fn verify(&self, data: &[u8]) -> bool {
        self.algorithm.digest(data) == self.digest
    }

    /// Format as a header value (base64 digest)
    pub fn to_header(&self) -> String {
        format!("{} {}", self.algorithm, STANDARD.encode(&self.digest))
    }

    /// Checksum of `data` under `algorithm`
    pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            digest: algorithm.digest(data),
        }
    }
}

fn decode_digest(algorithm: ChecksumAlgorithm, encoded: &str) -> Option<Vec<u8>> {
    let len = algorithm.digest_len();

    if encoded.len() == len * 2 && encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
        return hex::decode(encoded).ok();
    }

    STANDARD
        .decode(encoded)
        .ok()
        .filter(|digest| digest.len() == len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_and_base64() {
        let data = b"hello world";
        let hex_digest = hex::encode(Sha1::digest(data));
        let b64_digest = STANDARD.encode(Sha1::digest(data));

        let from_hex = ChunkChecksum::parse(&format!("sha1 {}", hex_digest)).unwrap();
        let from_b64 = ChunkChecksum::parse(&format!("sha1 {}", b64_digest)).unwrap();

        assert_eq!(from_hex, from_b64);
        assert!(from_hex.verify(data));
        assert!(!from_hex.verify(b"hello world!"));
    }

    #[test]
    fn test_md5_and_sha256() {
        let data = b"chunk";
        for algorithm in ChecksumAlgorithm::ALL {
            let checksum = ChunkChecksum::compute(algorithm, data);
            let parsed = ChunkChecksum::parse(&checksum.to_header()).unwrap();
            assert!(parsed.verify(data), "{} failed", algorithm);
        }
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(ChunkChecksum::parse("sha1").is_err());
        assert!(ChunkChecksum::parse("crc32 AAAA").is_err());
        assert!(ChunkChecksum::parse("sha256 not-base64!").is_err());
        // valid base64 but wrong digest length
        assert!(ChunkChecksum::parse("md5 aGVsbG8=").is_err());
    }

    #[test]
    fn test_advertised() {
        assert_eq!(ChecksumAlgorithm::advertised(), "sha1,sha256,md5");
        assert_eq!("SHA-256".parse::<ChecksumAlgorithm>(), Ok(ChecksumAlgorithm::Sha256));
    }
}
