//! Remote image references (`registry.example.com/repo/name:tag`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A reference to a VM image in an OCI-compatible registry.
///
/// Pulling and storing images is the image subsystem's concern; the engine
/// only needs to recognize references in disk specs and map them onto the
/// local cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// Registry host, e.g. `ghcr.io`.
    pub registry: String,
    /// Repository path, e.g. `org/ubuntu`.
    pub repository: String,
    /// Tag or digest, `latest` when omitted.
    pub reference: String,
}

impl ImageRef {
    /// Parses an image reference, or `None` when `s` does not look like one.
    ///
    /// The grammar is intentionally strict because disk locations fall back
    /// to local paths: the first path segment must name a registry host
    /// (contains a dot or a port), there must be a repository, and the
    /// string must not look like a filesystem path.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || s.starts_with(['/', '.', '~']) || s.contains("://") {
            return None;
        }
        let (registry, rest) = s.split_once('/')?;
        if !(registry.contains('.') || registry.contains(':')) || rest.is_empty() {
            return None;
        }

        // The tag separator is the last colon after the last slash; a colon
        // inside the repository path would be an invalid reference anyway.
        let (repository, reference) = match rest.rfind(':') {
            Some(idx) if idx > rest.rfind('/').unwrap_or(0) => {
                (&rest[..idx], &rest[idx + 1..])
            }
            _ => (rest, "latest"),
        };
        if repository.is_empty() || reference.is_empty() {
            return None;
        }
        if !repository
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'))
        {
            return None;
        }

        Some(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference: reference.to_string(),
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_reference() {
        let image = ImageRef::parse("ghcr.io/org/img:tag").unwrap();
        assert_eq!(image.registry, "ghcr.io");
        assert_eq!(image.repository, "org/img");
        assert_eq!(image.reference, "tag");
        assert_eq!(image.to_string(), "ghcr.io/org/img:tag");
    }

    #[test]
    fn test_parse_defaults_to_latest() {
        let image = ImageRef::parse("ghcr.io/org/img").unwrap();
        assert_eq!(image.reference, "latest");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let image = ImageRef::parse("localhost:5000/img:v1").unwrap();
        assert_eq!(image.registry, "localhost:5000");
        assert_eq!(image.repository, "img");
        assert_eq!(image.reference, "v1");
    }

    #[test]
    fn test_rejects_paths_and_urls() {
        assert!(ImageRef::parse("disk.img").is_none());
        assert!(ImageRef::parse("./extra.img").is_none());
        assert!(ImageRef::parse("/dev/disk4").is_none());
        assert!(ImageRef::parse("~/images/a.img").is_none());
        assert!(ImageRef::parse("nbd://host:1/x").is_none());
        assert!(ImageRef::parse("images/a.img").is_none()); // no registry host
    }

    #[test]
    fn test_rejects_empty_parts() {
        assert!(ImageRef::parse("ghcr.io/").is_none());
        assert!(ImageRef::parse("ghcr.io/img:").is_none());
        assert!(ImageRef::parse("").is_none());
    }
}
