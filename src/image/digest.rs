use crate::errors::ImageError;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::{
    cmp::{Ord, Ordering, PartialOrd},
    fmt,
    hash::{Hash, Hasher},
    str,
    str::FromStr,
};

/// A digest securely identifies the specific contents of a binary object
///
/// Digests include the hash algorithm, which is currently always `sha256`.
/// The canonical string form is `sha256:<hex>`.
#[derive(Clone)]
pub struct ContentDigest {
    serialized: String,
    colon: usize,
}

impl ContentDigest {
    /// Returns a reference to the existing string representation of a
    /// [ContentDigest]
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Create a new ContentDigest from an algorithm name and raw hash bytes
    pub fn from_hash_bytes(algorithm: &str, hash: &[u8]) -> Result<Self, ImageError> {
        ContentDigest::parse(&format!("{}:{}", algorithm, hex::encode(hash)))
    }

    /// Create a new ContentDigest by hashing content data with `sha256`
    pub fn from_content(content_bytes: &[u8]) -> Self {
        ContentDigest {
            serialized: format!("sha256:{}", hex::encode(Sha256::digest(content_bytes))),
            colon: "sha256".len(),
        }
    }

    /// Parse a [prim@str] as a [ContentDigest]
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        lazy_static! {
            static ref RE: Regex = Regex::new(concat!(
                "^",
                "(?P<dig_a>",                 // algorithm group
                /*  */ "[a-zA-Z][a-zA-Z0-9]*",
                /*  */ "(?:[-_+.][a-zA-Z][a-zA-Z0-9]*)*",
                ")",
                "[:]",
                "(?P<dig_h>",                 // hex group
                /*  */ "[a-f0-9]{32,}",
                ")",
                "$",
            ))
            .unwrap();
        }
        match RE.captures(s) {
            None => Err(ImageError::InvalidReferenceFormat(s.to_owned())),
            Some(captures) => Ok(ContentDigest {
                serialized: s.to_owned(),
                colon: captures.name("dig_a").unwrap().end(),
            }),
        }
    }

    /// Return a reference to the algorithm portion of this digest,
    /// currently always `sha256`
    pub fn algorithm_str(&self) -> &str {
        &self.serialized[..self.colon]
    }

    /// Return a reference to the hexadecimal portion of this digest
    pub fn hex_str(&self) -> &str {
        &self.serialized[self.colon + 1..]
    }
}

impl Eq for ContentDigest {}

impl PartialEq for ContentDigest {
    fn eq(&self, other: &Self) -> bool {
        self.serialized.eq(&other.serialized)
    }
}

impl FromStr for ContentDigest {
    type Err = ImageError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentDigest::parse(s)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Hash for ContentDigest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl Ord for ContentDigest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.serialized.cmp(&other.serialized)
    }
}

impl PartialOrd for ContentDigest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentDigest::parse(&s).map_err(de::Error::custom)
    }
}
