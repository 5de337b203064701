//! Image reference parsing.
//!
//! References have the short form `name[:tag]` or `name@digest`. The string
//! is split on the **first** `:`; everything after it is the tag. There is
//! no registry host component; the registry comes from configuration.

use crate::constants::{DEFAULT_TAG, IMAGE_REF_VALID_CHARS, MAX_IMAGE_REF_LEN, MAX_TAG_LEN};
use crate::error::{Error, Result};

/// A parsed `(name, tag)` image reference.
///
/// `tag` holds either a tag or, for `name@sha256:...` references, the digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    name: String,
    tag: String,
}

impl ImageReference {
    /// Parses and validates a reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(&format!("exceeds {} bytes", MAX_IMAGE_REF_LEN)));
        }
        if !reference.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
            return Err(invalid("contains invalid characters"));
        }

        let (name, tag) = if let Some((name, digest)) = reference.split_once('@') {
            (name, digest)
        } else {
            match reference.split_once(':') {
                Some((name, tag)) => (name, tag),
                None => (reference, DEFAULT_TAG),
            }
        };

        if name.is_empty() {
            return Err(invalid("empty image name"));
        }
        if tag.is_empty() {
            return Err(invalid("empty tag"));
        }
        if reference.contains('@') {
            let valid_digest = tag
                .strip_prefix("sha256:")
                .is_some_and(|hex| !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()));
            if !valid_digest {
                return Err(invalid("digest must be sha256:<hex>"));
            }
        } else if tag.len() > MAX_TAG_LEN
            || tag.contains('/')
            || !tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        {
            // the tag lands in the manifest URL path and the cache key
            return Err(invalid("malformed tag"));
        }
        if name.contains(':')
            || name.starts_with('/')
            || name.ends_with('/')
            || name.split('/').any(|c| c.is_empty() || c == "." || c == "..")
        {
            return Err(invalid("malformed repository path"));
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Image name as given (e.g. `alpine` or `bitnami/redis`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag or digest.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns true when the reference pins a digest rather than a tag.
    pub fn is_digest(&self) -> bool {
        self.tag.starts_with("sha256:")
    }

    /// Filesystem-safe directory name for the image cache.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.name.replace('/', "+"), self.tag.replace('/', "+"))
    }
}

impl std::str::FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_digest() {
            write!(f, "{}@{}", self.name, self.tag)
        } else {
            write!(f, "{}:{}", self.name, self.tag)
        }
    }
}
