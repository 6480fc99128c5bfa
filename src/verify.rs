//! SHA-256 artifact verification

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Read size while hashing; files can be several gigabytes.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

const SHA256_HEX_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("malformed checksum `{0}`: expected 64 hexadecimal characters")]
    MalformedChecksum(String),

    #[error("unsupported checksum algorithm `{0}`")]
    UnsupportedAlgorithm(String),

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    Mismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("failed to hash {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            other => Err(VerifyError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// An algorithm tag plus a normalized lowercase hex digest.
///
/// Parses either a bare digest or `sha256:<digest>`. Only well-formed values
/// can be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactChecksum {
    algorithm: ChecksumAlgorithm,
    digest: String,
}

impl ArtifactChecksum {
    pub fn new(algorithm: ChecksumAlgorithm, digest: &str) -> Result<Self, VerifyError> {
        let normalized = digest.trim().to_ascii_lowercase();
        let valid = normalized.len() == SHA256_HEX_LEN
            && normalized.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(VerifyError::MalformedChecksum(digest.to_string()));
        }
        Ok(Self {
            algorithm,
            digest: normalized,
        })
    }

    pub fn sha256(digest: &str) -> Result<Self, VerifyError> {
        Self::new(ChecksumAlgorithm::Sha256, digest)
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl FromStr for ArtifactChecksum {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once(':') {
            Some((algorithm, digest)) => Self::new(algorithm.parse()?, digest),
            None => Self::sha256(s),
        }
    }
}

impl TryFrom<String> for ArtifactChecksum {
    type Error = VerifyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactChecksum> for String {
    fn from(value: ArtifactChecksum) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ArtifactChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.digest)
    }
}

pub fn checksum_bytes(bytes: &[u8], algorithm: ChecksumAlgorithm) -> String {
    match algorithm {
        ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
    }
}

/// Hash `path` on the blocking pool and return the lowercase hex digest.
pub async fn checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, VerifyError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&owned, algorithm))
        .await
        .map_err(|e| VerifyError::Io {
            path: path.to_path_buf(),
            source: io::Error::other(e),
        })?
}

/// Recompute the digest of `path` and compare it against `expected`.
pub async fn verify(path: &Path, expected: &ArtifactChecksum) -> Result<(), VerifyError> {
    let actual = checksum(path, expected.algorithm()).await?;
    if actual != expected.digest() {
        warn!(
            "checksum_mismatch: {} expected={} actual={}",
            path.display(),
            expected.digest(),
            actual
        );
        return Err(VerifyError::Mismatch {
            path: path.to_path_buf(),
            expected: expected.digest().to_string(),
            actual,
        });
    }
    debug!("checksum_ok: {} digest={}", path.display(), actual);
    Ok(())
}

fn hash_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, VerifyError> {
    let io_err = |source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    match algorithm {
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let read = match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(io_err(e)),
                };
                hasher.update(&buf[..read]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn abc_digest_matches_known_vector() {
        assert_eq!(checksum_bytes(b"abc", ChecksumAlgorithm::Sha256), ABC_SHA256);
    }

    #[test]
    fn uppercase_input_normalizes() {
        let upper = ArtifactChecksum::sha256(&format!("  {}\n", ABC_SHA256.to_uppercase())).unwrap();
        assert_eq!(upper, ArtifactChecksum::sha256(ABC_SHA256).unwrap());
        assert_eq!(upper.digest(), ABC_SHA256);
    }

    #[test]
    fn malformed_checksums_are_rejected() {
        assert!(matches!(
            ArtifactChecksum::sha256(&ABC_SHA256[..63]),
            Err(VerifyError::MalformedChecksum(_))
        ));
        let non_hex = format!("{}g", &ABC_SHA256[..63]);
        assert!(matches!(
            ArtifactChecksum::sha256(&non_hex),
            Err(VerifyError::MalformedChecksum(_))
        ));
        assert!(matches!(
            "md5:abc".parse::<ArtifactChecksum>(),
            Err(VerifyError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn prefixed_form_round_trips_through_serde() {
        let parsed: ArtifactChecksum = format!("SHA256:{ABC_SHA256}").parse().unwrap();
        let json = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, format!("\"sha256:{ABC_SHA256}\""));
        assert!(serde_json::from_str::<ArtifactChecksum>("\"sha256:xyz\"").is_err());
    }

    #[tokio::test]
    async fn file_digest_spans_multiple_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.bin");
        let data: Vec<u8> = (0..(HASH_CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let digest = checksum(&path, ChecksumAlgorithm::Sha256).await.unwrap();
        assert_eq!(digest, checksum_bytes(&data, ChecksumAlgorithm::Sha256));
    }

    #[tokio::test]
    async fn mismatch_carries_both_digests() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abd").unwrap();

        let expected = ArtifactChecksum::sha256(ABC_SHA256).unwrap();
        match verify(&path, &expected).await {
            Err(VerifyError::Mismatch {
                expected: e,
                actual,
                ..
            }) => {
                assert_eq!(e, ABC_SHA256);
                assert_eq!(actual, checksum_bytes(b"abd", ChecksumAlgorithm::Sha256));
            }
            other => panic!("unexpected {other:?}"),
        }

        std::fs::write(&path, b"abc").unwrap();
        verify(&path, &expected).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let err = checksum(&dir.path().join("nope"), ChecksumAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Io { .. }));
    }
}
