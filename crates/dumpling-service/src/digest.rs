use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

/// A SHA-1 content digest, stored as 40 lowercase hex characters.
///
/// Parsing accepts either case, so digests declared by clients compare equal to computed ones
/// regardless of how they were spelled.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha1Digest(String);

/// A string that is not a valid SHA-1 hex digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid SHA-1 digest: {0:?}")]
pub struct InvalidDigest(pub String);

impl Sha1Digest {
    pub const HEX_LEN: usize = 40;

    pub fn from_hasher(hasher: Sha1) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// Computes the digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Sha1Digest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == Self::HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(InvalidDigest(s.to_owned()))
        }
    }
}

impl TryFrom<String> for Sha1Digest {
    type Error = InvalidDigest;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Sha1Digest> for String {
    fn from(value: Sha1Digest) -> Self {
        value.0
    }
}

impl AsRef<str> for Sha1Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Digest({})", self.0)
    }
}
