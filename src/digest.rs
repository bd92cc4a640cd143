//! Content-addressable digests, shared by the blob model (§4.B) and the
//! descriptor/resource model (§4.E).

use std::str::FromStr;

use color_eyre::eyre::{bail, eyre};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Result;

/// A content-addressable digest in the format `algorithm:hex`.
///
/// ```
/// # use std::str::FromStr;
/// let digest = ocm_core::digest::Digest::from_str("sha256:68656c6c6f").expect("parse digest");
/// assert_eq!(digest.algorithm, "sha256");
/// assert_eq!(digest.as_hex(), "68656c6c6f");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    /// The hashing algorithm used (e.g. "sha256").
    pub algorithm: String,
    /// The raw hash bytes.
    pub hash: Vec<u8>,
}

impl Digest {
    /// The SHA256 algorithm identifier.
    pub const SHA256: &'static str = "sha256";

    /// Compute the SHA256 digest of the given bytes.
    pub fn sha256(bytes: &[u8]) -> Self {
        use sha2::{Digest as _, Sha256};
        let hash = Sha256::digest(bytes).to_vec();
        Self {
            algorithm: Self::SHA256.to_string(),
            hash,
        }
    }

    /// Returns the hash as a lowercase hex string.
    pub fn as_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

impl FromStr for Digest {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, hex_str) = s
            .split_once(':')
            .ok_or_else(|| eyre!("invalid digest format: missing algorithm separator ':'"))?;
        if algorithm.is_empty() {
            bail!("algorithm cannot be empty");
        }
        if hex_str.is_empty() {
            bail!("hex cannot be empty");
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            hash: hex::decode(hex_str).map_err(|e| eyre!("invalid hex string: {e}"))?,
        })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.as_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip() {
        let digest = Digest::sha256(b"hello world!");
        let parsed = Digest::from_str(&digest.to_string()).expect("parse");
        assert_eq!(digest, parsed);
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(Digest::from_str("deadbeef").is_err());
    }

    #[test]
    fn rejects_empty_algorithm() {
        assert!(Digest::from_str(":deadbeef").is_err());
    }
}
