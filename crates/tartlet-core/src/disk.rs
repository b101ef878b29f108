//! Disk attachment specs.
//!
//! One `--disk` argument has the shape `<location>[:<opt>[,<opt>]*]`.
//! Recognized options are `ro`, `sync=none|fsync|full` and
//! `caching=automatic|cached|uncached`. The final colon-separated segment is
//! treated as options only when every comma-separated token in it is
//! option-shaped, so colons inside paths and URLs survive
//! (`nbd://host:10809/export` stays one location).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{EngineError, Result};
use crate::reference::ImageRef;

/// Host-side write synchronization of a disk attachment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// No synchronization; fastest, unsafe across host crashes.
    None,
    /// `fsync` on flush.
    Fsync,
    /// Full barrier semantics.
    #[default]
    Full,
}

impl FromStr for SyncMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "fsync" => Ok(Self::Fsync),
            "full" => Ok(Self::Full),
            other => Err(EngineError::InvalidSpec(format!(
                "unsupported sync mode \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Fsync => write!(f, "fsync"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// Host-side caching of a disk attachment.
///
/// Write caching is never enabled unless the spec asks for it; `Automatic`
/// leaves the choice to the virtualization framework.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachingMode {
    /// Framework decides.
    #[default]
    Automatic,
    /// Host page cache enabled.
    Cached,
    /// Host page cache bypassed.
    Uncached,
}

impl FromStr for CachingMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "automatic" => Ok(Self::Automatic),
            "cached" => Ok(Self::Cached),
            "uncached" => Ok(Self::Uncached),
            other => Err(EngineError::InvalidSpec(format!(
                "unsupported caching mode \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for CachingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Automatic => write!(f, "automatic"),
            Self::Cached => write!(f, "cached"),
            Self::Uncached => write!(f, "uncached"),
        }
    }
}

/// Where the disk's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    /// Local disk image file.
    Image(PathBuf),
    /// Character or block special file.
    BlockDevice(PathBuf),
    /// Network block device URL (`nbd`, `nbds`, `nbd+unix`, `nbds+unix`).
    Nbd(String),
    /// Remote image reference; the image is cloned locally before attach.
    Remote(ImageRef),
}

/// One parsed `--disk` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    /// Attachment source.
    pub source: DiskSource,
    /// Attach read-only.
    pub read_only: bool,
    /// Write synchronization mode.
    pub sync: SyncMode,
    /// Host caching mode.
    pub caching: CachingMode,
}

/// Options shared by disk specs and `--root-disk-opts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskOptions {
    pub read_only: bool,
    pub sync: SyncMode,
    pub caching: CachingMode,
}

impl DiskOptions {
    /// Parses a bare option list (`ro,sync=none`). Empty input keeps every
    /// default. Unknown tokens are `InvalidSpec`.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        match parse_option_segment(s) {
            Some(result) => result,
            None => Err(EngineError::InvalidSpec(format!(
                "unknown disk option in \"{s}\""
            ))),
        }
    }
}

impl fmt::Display for DiskOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens = Vec::new();
        if self.read_only {
            tokens.push("ro".to_string());
        }
        if self.sync != SyncMode::default() {
            tokens.push(format!("sync={}", self.sync));
        }
        if self.caching != CachingMode::default() {
            tokens.push(format!("caching={}", self.caching));
        }
        write!(f, "{}", tokens.join(","))
    }
}

/// Parses `segment` as an option list.
///
/// `None` means the segment is not option-shaped at all (and is therefore
/// part of the location); `Some(Err(_))` means it is option-shaped but
/// carries an invalid value, which is a hard error.
fn parse_option_segment(segment: &str) -> Option<Result<DiskOptions>> {
    let mut options = DiskOptions::default();
    for token in segment.split(',') {
        if token == "ro" {
            options.read_only = true;
        } else if let Some(value) = token.strip_prefix("sync=") {
            match value.parse() {
                Ok(mode) => options.sync = mode,
                Err(err) => return Some(Err(err)),
            }
        } else if let Some(value) = token.strip_prefix("caching=") {
            match value.parse() {
                Ok(mode) => options.caching = mode,
                Err(err) => return Some(Err(err)),
            }
        } else {
            return None;
        }
    }
    Some(Ok(options))
}

/// Splits `spec` into (location, options) under the last-segment rule.
pub(crate) fn split_location_and_options(spec: &str) -> Result<(&str, DiskOptions)> {
    if let Some((location, candidate)) = spec.rsplit_once(':') {
        if !location.is_empty() && !candidate.is_empty() {
            if let Some(parsed) = parse_option_segment(candidate) {
                return Ok((location, parsed?));
            }
        }
    }
    Ok((spec, DiskOptions::default()))
}

const NBD_SCHEMES: &[&str] = &["nbd", "nbds", "nbd+unix", "nbds+unix"];

impl DiskSpec {
    /// Parses one `--disk` argument.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.is_empty() {
            return Err(EngineError::InvalidSpec("empty disk spec".into()));
        }
        let (location, options) = split_location_and_options(spec)?;

        // Media for the wrong architecture fails early instead of producing
        // an unbootable guest.
        if file_name_of(location).ends_with("-amd64.iso") {
            return Err(EngineError::ArchMismatch(format!(
                "\"{location}\" is an Intel image, this host runs arm64 guests"
            )));
        }

        let source = classify_location(location)?;
        Ok(Self {
            source,
            read_only: options.read_only,
            sync: options.sync,
            caching: options.caching,
        })
    }

    /// The options in canonical token form (defaults omitted).
    #[must_use]
    pub fn options(&self) -> DiskOptions {
        DiskOptions {
            read_only: self.read_only,
            sync: self.sync,
            caching: self.caching,
        }
    }
}

impl FromStr for DiskSpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn classify_location(location: &str) -> Result<DiskSource> {
    if let Some((scheme, _)) = location.split_once("://") {
        if NBD_SCHEMES.contains(&scheme) {
            return Ok(DiskSource::Nbd(location.to_string()));
        }
    }
    if is_device_node(Path::new(location)) {
        return Ok(DiskSource::BlockDevice(PathBuf::from(location)));
    }
    if let Some(image) = ImageRef::parse(location) {
        return Ok(DiskSource::Remote(image));
    }
    Ok(DiskSource::Image(PathBuf::from(location)))
}

fn is_device_node(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_block_device() || meta.file_type().is_char_device())
        .unwrap_or(false)
}

fn file_name_of(location: &str) -> &str {
    location.rsplit('/').next().unwrap_or(location)
}
