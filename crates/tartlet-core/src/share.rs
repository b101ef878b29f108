//! Directory share specs.
//!
//! One `--dir` argument has the shape `[<name>:]<source>[:<opt>[,<opt>]*]`
//! with options `ro` and `tag=<mount tag>`. The source is either a host
//! path or an `http(s)://` archive URL (the archive is fetched and unpacked
//! before attach; the name prefix is meaningless for archives and ignored).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tartlet_constants::shares;

use crate::error::{EngineError, Result};

/// Where a directory share's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareSource {
    /// Host directory.
    Path(PathBuf),
    /// Remote archive URL, unpacked into an engine-owned directory.
    Url(String),
}

impl fmt::Display for ShareSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => write!(f, "{url}"),
        }
    }
}

/// One parsed `--dir` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirShareSpec {
    /// Name under which the guest sees this share inside its mount tag.
    pub name: Option<String>,
    /// Share content source.
    pub source: ShareSource,
    /// Guest gets read-only access.
    pub read_only: bool,
    /// Mount tag grouping shares into one device.
    pub mount_tag: String,
}

#[derive(Default)]
struct ShareOptions {
    read_only: bool,
    mount_tag: Option<String>,
}

/// Parses `segment` as a share option list; `None` when it is not
/// option-shaped (and therefore part of the source).
fn parse_option_segment(segment: &str) -> Option<Result<ShareOptions>> {
    let mut options = ShareOptions::default();
    for token in segment.split(',') {
        if token == "ro" {
            options.read_only = true;
        } else if let Some(value) = token.strip_prefix("tag=") {
            if value.is_empty() {
                return Some(Err(EngineError::InvalidSpec(
                    "empty mount tag in directory share".into(),
                )));
            }
            options.mount_tag = Some(value.to_string());
        } else {
            return None;
        }
    }
    Some(Ok(options))
}

fn is_archive_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

impl DirShareSpec {
    /// Parses one `--dir` argument.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.is_empty() {
            return Err(EngineError::InvalidSpec("empty directory share".into()));
        }

        // Split the option segment off the tail first, exactly like disk
        // specs, so `tag=` never collides with colons inside the source.
        let (head, options) = match spec.rsplit_once(':') {
            Some((head, candidate)) if !head.is_empty() && !candidate.is_empty() => {
                match parse_option_segment(candidate) {
                    Some(parsed) => (head, parsed?),
                    None => (spec, ShareOptions::default()),
                }
            }
            _ => (spec, ShareOptions::default()),
        };

        // `name:` prefix. Archive URLs carry their own colon, so test the
        // remainder for a scheme before committing to a name.
        let (name, source) = if is_archive_url(head) {
            (None, ShareSource::Url(head.to_string()))
        } else {
            match head.split_once(':') {
                Some((name, rest)) if !name.contains('/') && !rest.is_empty() => {
                    if is_archive_url(rest) {
                        // The name is ignored for remote archives.
                        (None, ShareSource::Url(rest.to_string()))
                    } else {
                        (
                            Some(name.to_string()),
                            ShareSource::Path(PathBuf::from(rest)),
                        )
                    }
                }
                _ => (None, ShareSource::Path(PathBuf::from(head))),
            }
        };

        if let Some(name) = &name {
            if name.is_empty() {
                return Err(EngineError::InvalidSpec(format!(
                    "empty share name in \"{spec}\""
                )));
            }
        }

        Ok(Self {
            name,
            source,
            read_only: options.read_only,
            mount_tag: options
                .mount_tag
                .unwrap_or_else(|| shares::DEFAULT_MOUNT_TAG.to_string()),
        })
    }
}

impl FromStr for DirShareSpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Validates the cross-share mount-tag invariant.
///
/// A tag carrying a single share may stay unnamed; as soon as two shares
/// meet under one tag, each needs a distinct name so the guest can tell the
/// subdirectories apart.
pub fn validate_mount_tags(shares: &[DirShareSpec]) -> Result<()> {
    let mut by_tag: HashMap<&str, Vec<&DirShareSpec>> = HashMap::new();
    for share in shares {
        by_tag.entry(&share.mount_tag).or_default().push(share);
    }

    for (tag, group) in &by_tag {
        if group.len() < 2 {
            continue;
        }
        let mut seen = std::collections::HashSet::new();
        for share in group {
            let Some(name) = &share.name else {
                return Err(EngineError::InvalidSpec(format!(
                    "directory share \"{}\" needs a name: tag \"{tag}\" has {} shares",
                    share.source,
                    group.len()
                )));
            };
            if !seen.insert(name.as_str()) {
                return Err(EngineError::InvalidSpec(format!(
                    "duplicate share name \"{name}\" under tag \"{tag}\""
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_path() {
        let share = DirShareSpec::parse("/Users/ci/project").unwrap();
        assert_eq!(share.name, None);
        assert_eq!(share.source, ShareSource::Path("/Users/ci/project".into()));
        assert!(!share.read_only);
        assert_eq!(share.mount_tag, shares::DEFAULT_MOUNT_TAG);
    }

    #[test]
    fn test_named_path_with_options() {
        let share = DirShareSpec::parse("project:/Users/ci/project:ro,tag=build").unwrap();
        assert_eq!(share.name.as_deref(), Some("project"));
        assert_eq!(share.source, ShareSource::Path("/Users/ci/project".into()));
        assert!(share.read_only);
        assert_eq!(share.mount_tag, "build");
    }

    #[test]
    fn test_archive_urls() {
        let share = DirShareSpec::parse("https://example.com/fixtures.tar.gz").unwrap();
        assert_eq!(
            share.source,
            ShareSource::Url("https://example.com/fixtures.tar.gz".into())
        );
        assert_eq!(share.name, None);

        // Plain HTTP is accepted for LAN-internal archives.
        let share = DirShareSpec::parse("http://10.0.0.1/seed.tgz:ro").unwrap();
        assert_eq!(share.source, ShareSource::Url("http://10.0.0.1/seed.tgz".into()));
        assert!(share.read_only);

        // A name prefix on an archive is ignored.
        let share = DirShareSpec::parse("seed:https://example.com/seed.tgz").unwrap();
        assert_eq!(share.name, None);
        assert!(matches!(share.source, ShareSource::Url(_)));
    }

    #[test]
    fn test_path_with_colon_stays_intact() {
        // "b/c" contains a slash, so it cannot be a name prefix.
        let share = DirShareSpec::parse("weird:dir/name").unwrap();
        assert_eq!(share.name.as_deref(), Some("weird"));
        assert_eq!(share.source, ShareSource::Path("dir/name".into()));

        let share = DirShareSpec::parse("a/b:c").unwrap();
        assert_eq!(share.name, None);
        assert_eq!(share.source, ShareSource::Path("a/b:c".into()));
    }

    #[test]
    fn test_empty_tag_rejected() {
        assert!(matches!(
            DirShareSpec::parse("/tmp/x:tag="),
            Err(EngineError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_two_unnamed_shares_same_tag_rejected() {
        let shares = vec![
            DirShareSpec::parse("/tmp/a").unwrap(),
            DirShareSpec::parse("/tmp/b").unwrap(),
        ];
        assert!(matches!(
            validate_mount_tags(&shares),
            Err(EngineError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_single_unnamed_share_per_tag_allowed() {
        let shares = vec![
            DirShareSpec::parse("/tmp/a").unwrap(),
            DirShareSpec::parse("/tmp/b:tag=other").unwrap(),
        ];
        assert!(validate_mount_tags(&shares).is_ok());
    }

    #[test]
    fn test_named_shares_same_tag_allowed() {
        let shares = vec![
            DirShareSpec::parse("a:/tmp/a").unwrap(),
            DirShareSpec::parse("b:/tmp/b").unwrap(),
        ];
        assert!(validate_mount_tags(&shares).is_ok());
    }

    #[test]
    fn test_duplicate_names_same_tag_rejected() {
        let shares = vec![
            DirShareSpec::parse("a:/tmp/a").unwrap(),
            DirShareSpec::parse("a:/tmp/b").unwrap(),
        ];
        assert!(matches!(
            validate_mount_tags(&shares),
            Err(EngineError::InvalidSpec(_))
        ));
    }
}
