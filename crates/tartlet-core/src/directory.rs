//! A single VM's on-disk directory.

use std::fs::File;
use std::path::{Path, PathBuf};

use tartlet_constants::layout;

use crate::config::VmConfig;
use crate::error::{EngineError, Result};
use crate::lock;

/// Handle to one VM directory under the VM home.
///
/// The directory is created and destroyed by the image subsystem; the engine
/// only reads it, locks it, and mutates it while locked.
#[derive(Debug, Clone)]
pub struct VmDirectory {
    name: String,
    path: PathBuf,
}

impl VmDirectory {
    /// Wraps the directory for VM `name` under `home`.
    #[must_use]
    pub fn named(home: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: home.join(name),
        }
    }

    /// The VM name (the directory's file name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the configuration document (also the VM lock target).
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.path.join(layout::CONFIG_FILE)
    }

    /// Path of the root disk image.
    #[must_use]
    pub fn disk_path(&self) -> PathBuf {
        self.path.join(layout::DISK_FILE)
    }

    /// Path of the NVRAM blob.
    #[must_use]
    pub fn nvram_path(&self) -> PathBuf {
        self.path.join(layout::NVRAM_FILE)
    }

    /// Path of the saved machine state blob.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.path.join(layout::STATE_FILE)
    }

    /// Path of the control socket.
    #[must_use]
    pub fn control_socket_path(&self) -> PathBuf {
        self.path.join(layout::CONTROL_SOCKET)
    }

    /// Fails with `VmNotFound` unless the directory looks like a VM.
    pub fn validate(&self) -> Result<()> {
        if self.path.is_dir() && self.config_path().is_file() {
            Ok(())
        } else {
            Err(EngineError::VmNotFound(self.name.clone()))
        }
    }

    /// Reads the configuration document.
    pub fn config(&self) -> Result<VmConfig> {
        VmConfig::load(&self.config_path())
    }

    /// Persists the configuration document. Callers must hold the VM lock.
    pub fn save_config(&self, config: &VmConfig) -> Result<()> {
        config.save(&self.config_path())
    }

    /// Opens the configuration document for locking.
    ///
    /// The returned file must stay open for as long as the lock is needed;
    /// callers read the document *before* locking (see [`crate::lock`]).
    pub fn open_config_for_lock(&self) -> Result<File> {
        File::open(self.config_path()).map_err(Into::into)
    }

    /// Whether another process currently runs this VM.
    #[must_use]
    pub fn running(&self) -> bool {
        lock::is_locked_elsewhere(&self.config_path())
    }

    /// Whether the VM has saved machine state on disk.
    #[must_use]
    pub fn suspended(&self) -> bool {
        self.state_path().is_file()
    }

    /// Removes the saved machine state blob.
    pub fn remove_saved_state(&self) -> Result<()> {
        std::fs::remove_file(self.state_path())?;
        Ok(())
    }

    /// The configured MAC address, in comparison form.
    pub fn mac_address(&self) -> Result<String> {
        Ok(self.config()?.normalized_mac())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{DiskFormat, DisplayGeometry, GuestOs, VmConfig};
    use crate::lock::FileLock;

    pub(crate) fn write_vm(home: &Path, name: &str, mac: &str) -> VmDirectory {
        let dir = VmDirectory::named(home, name);
        std::fs::create_dir_all(dir.path()).unwrap();
        let config = VmConfig {
            version: 1,
            os: GuestOs::Linux,
            arch: crate::config::Arch::Arm64,
            cpu_count: 2,
            memory_size: 1024 * 1024 * 1024,
            display: DisplayGeometry::default(),
            mac_address: mac.into(),
            disk_format: DiskFormat::Raw,
            hardware_model: None,
            ecid: None,
        };
        dir.save_config(&config).unwrap();
        dir
    }

    #[test]
    fn test_layout_paths() {
        let home = tempfile::tempdir().unwrap();
        let dir = VmDirectory::named(home.path(), "jammy");
        assert!(dir.config_path().ends_with("jammy/config.json"));
        assert!(dir.disk_path().ends_with("jammy/disk.img"));
        assert!(dir.nvram_path().ends_with("jammy/nvram.bin"));
        assert!(dir.state_path().ends_with("jammy/state.bin"));
        assert!(dir.control_socket_path().ends_with("jammy/sock"));
    }

    #[test]
    fn test_validate_missing_vm() {
        let home = tempfile::tempdir().unwrap();
        let dir = VmDirectory::named(home.path(), "ghost");
        assert!(matches!(dir.validate(), Err(EngineError::VmNotFound(name)) if name == "ghost"));
    }

    #[test]
    fn test_suspended_tracks_state_file() {
        let home = tempfile::tempdir().unwrap();
        let dir = write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:01");
        assert!(!dir.suspended());

        std::fs::write(dir.state_path(), b"state").unwrap();
        assert!(dir.suspended());

        dir.remove_saved_state().unwrap();
        assert!(!dir.suspended());
    }

    #[test]
    fn test_running_tracks_config_lock() {
        let home = tempfile::tempdir().unwrap();
        let dir = write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:02");
        assert!(!dir.running());

        let _lock = FileLock::try_exclusive(dir.open_config_for_lock().unwrap())
            .unwrap()
            .unwrap();
        assert!(dir.running());
    }

    #[test]
    fn test_mac_address_normalized() {
        let home = tempfile::tempdir().unwrap();
        let dir = write_vm(home.path(), "vm", "AA:BB:CC:DD:EE:03");
        assert_eq!(dir.mac_address().unwrap(), "aa:bb:cc:dd:ee:03");
    }
}
