//! The VM home directory and the storage index over it.

use std::path::{Path, PathBuf};

use tartlet_constants::{env as env_names, layout};
use tracing::debug;

use crate::config::normalize_mac;
use crate::directory::VmDirectory;
use crate::error::{EngineError, Result};
use crate::reference::ImageRef;

/// Resolves the VM home directory.
///
/// `TART_HOME` wins when set and non-empty; otherwise the default lives
/// under the user's home directory.
pub fn home_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(env_names::VM_HOME) {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    let user_home = std::env::var_os("HOME")
        .ok_or_else(|| EngineError::internal("HOME is not set and TART_HOME is empty"))?;
    Ok(PathBuf::from(user_home).join(layout::DEFAULT_HOME_DIR))
}

/// Index over the local VM directories under one home directory.
#[derive(Debug, Clone)]
pub struct StorageIndex {
    root: PathBuf,
}

impl StorageIndex {
    /// Creates an index rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates an index over the resolved VM home directory.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(home_dir()?))
    }

    /// The home directory this index covers.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Handle for the named VM (which may or may not exist yet).
    #[must_use]
    pub fn vm(&self, name: &str) -> VmDirectory {
        VmDirectory::named(&self.root, name)
    }

    /// Lists local VM directories, sorted by name.
    ///
    /// Entries without a configuration document are skipped with a debug
    /// log; a missing home directory is an empty fleet, not an error.
    pub fn list(&self) -> Result<Vec<VmDirectory>> {
        let mut vms = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vms),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let dir = self.vm(&name);
            if dir.config_path().is_file() {
                vms.push(dir);
            } else {
                debug!(path = %entry.path().display(), "skipping non-VM directory");
            }
        }
        vms.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(vms)
    }

    /// Names of currently running VMs, excluding `exclude`. Best-effort:
    /// enumeration failures yield an empty list.
    #[must_use]
    pub fn running_peer_names(&self, exclude: &str) -> Vec<String> {
        self.list()
            .unwrap_or_default()
            .into_iter()
            .filter(|dir| dir.name() != exclude && dir.running())
            .map(|dir| dir.name().to_string())
            .collect()
    }

    /// The name of a *running* peer whose MAC equals `mac`, if any.
    ///
    /// Peers whose configuration cannot be read are skipped; a stopped peer
    /// with the same MAC is not a collision.
    pub fn running_peer_with_mac(&self, mac: &str, exclude: &str) -> Result<Option<String>> {
        let wanted = normalize_mac(mac);
        for dir in self.list()? {
            if dir.name() == exclude || !dir.running() {
                continue;
            }
            match dir.mac_address() {
                Ok(peer_mac) if peer_mac == wanted => {
                    return Ok(Some(dir.name().to_string()));
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(vm = dir.name(), error = %err, "skipping unreadable peer config");
                }
            }
        }
        Ok(None)
    }

    /// Directory of a locally cached VM image pulled from a registry.
    ///
    /// Pulling is the image subsystem's job; the engine only consumes the
    /// cache layout.
    #[must_use]
    pub fn cached_image_dir(&self, image: &ImageRef) -> PathBuf {
        self.root
            .join("cache")
            .join("images")
            .join(&image.registry)
            .join(&image.repository)
            .join(&image.reference)
    }
}
