use crate::{errors::ImageError, image::ContentDigest};
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    cmp::{Ord, Ordering, PartialOrd},
    fmt,
    hash::{Hash, Hasher},
    str,
    str::FromStr,
};

/// Parsed Docker-style image reference
///
/// A reference is `registry/repository[:tag|@digest]`, where only the
/// repository is mandatory. Parsing tries to be format-compatible with
/// Docker including its quirks: the first path section is taken as a
/// registry server only if it contains a dot or a colon, or if it is
/// exactly `localhost`.
///
/// References are canonicalized on parse: an empty registry becomes
/// `registry-1.docker.io`, a single-segment repository on the default
/// registry gains the `library/` prefix, and a reference with neither tag
/// nor digest gains the tag `latest`. The canonical string is what
/// [ImageName::as_str] returns, and it is the key under which manifests
/// are stored locally.
#[derive(Clone)]
pub struct ImageName {
    serialized: String,
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<ContentDigest>,
}

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
const DEFAULT_LIBRARY: &str = "library";
const DEFAULT_TAG: &str = "latest";

impl ImageName {
    /// Returns a reference to the canonical string representation of this
    /// [ImageName]
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Parse a [prim@str] as an [ImageName], canonicalizing it
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        lazy_static! {
            static ref REPOSITORY: Regex = Regex::new(concat!(
                "^",
                "[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*",
                "(?:/[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*)*",
                "$",
            ))
            .unwrap();
            static ref TAG: Regex = Regex::new("^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap();
            static ref REGISTRY: Regex = Regex::new(concat!(
                "^",
                "(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])",
                "(?:\\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*",
                "(?::[0-9]+)?",
                "$",
            ))
            .unwrap();
        }

        let bad = || ImageError::InvalidReferenceFormat(s.to_owned());

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(ContentDigest::parse(digest)?)),
            None => (s, None),
        };

        // The first path section is a registry server only if it could not
        // be a repository component: it has a dot, a port, or is localhost.
        let (registry, rest) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                if !REGISTRY.is_match(first) {
                    return Err(bad());
                }
                (Some(first), rest)
            }
            _ => (None, name),
        };

        let (repository, tag) = match rest.split_once(':') {
            Some((repository, tag)) => {
                if !TAG.is_match(tag) {
                    return Err(bad());
                }
                (repository, Some(tag.to_owned()))
            }
            None => (rest, None),
        };
        if !REPOSITORY.is_match(repository) {
            return Err(bad());
        }

        let (registry, repository) = match registry {
            Some(registry) => (registry.to_owned(), repository.to_owned()),
            None => {
                let repository = if repository.contains('/') {
                    repository.to_owned()
                } else {
                    format!("{}/{}", DEFAULT_LIBRARY, repository)
                };
                (DEFAULT_REGISTRY.to_owned(), repository)
            }
        };
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_owned()),
            _ => tag,
        };

        let mut serialized = format!("{}/{}", registry, repository);
        if let Some(tag) = &tag {
            serialized.push(':');
            serialized.push_str(tag);
        }
        if let Some(digest) = &digest {
            serialized.push('@');
            serialized.push_str(digest.as_str());
        }

        Ok(ImageName {
            serialized,
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The registry server holding this image
    pub fn registry_str(&self) -> &str {
        &self.registry
    }

    /// The repository path within the registry
    pub fn repository_str(&self) -> &str {
        &self.repository
    }

    /// The tag, if the reference carries one
    pub fn tag_str(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The content digest, if the reference pins one
    pub fn content_digest(&self) -> Option<&ContentDigest> {
        self.digest.as_ref()
    }

    /// The most specific version component, used in registry API paths
    ///
    /// A pinned digest wins over a tag.
    pub fn version_str(&self) -> &str {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.as_str(),
            (None, Some(tag)) => tag,
            (None, None) => DEFAULT_TAG,
        }
    }

    /// The tag or digest string identifying this reference within its
    /// repository
    pub fn identifier(&self) -> &str {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => tag,
            (None, Some(digest)) => digest.as_str(),
            (None, None) => DEFAULT_TAG,
        }
    }
}

impl Eq for ImageName {}

impl PartialEq for ImageName {
    fn eq(&self, other: &Self) -> bool {
        self.serialized.eq(&other.serialized)
    }
}

impl FromStr for ImageName {
    type Err = ImageError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageName::parse(s)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Hash for ImageName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl Ord for ImageName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.serialized.cmp(&other.serialized)
    }
}

impl PartialOrd for ImageName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ImageName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ImageName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ImageName::parse(&s).map_err(de::Error::custom)
    }
}
