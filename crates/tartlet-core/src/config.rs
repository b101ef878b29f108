//! The VM configuration document (`config.json`).
//!
//! The document is written by the image subsystem when a VM is created or
//! cloned and mutated by the engine only while the VM directory is locked.
//! Field names are part of the on-disk contract with the rest of the fleet.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Guest operating system class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestOs {
    /// A macOS guest.
    Darwin,
    /// A Linux guest.
    Linux,
}

impl fmt::Display for GuestOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Darwin => write!(f, "darwin"),
            Self::Linux => write!(f, "linux"),
        }
    }
}

/// Guest CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 64-bit ARM, the only architecture this engine can execute.
    Arm64,
    /// 64-bit x86; present in configs written on other hosts.
    Amd64,
}

/// On-disk format of the root disk image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// Flat raw image.
    #[default]
    Raw,
    /// Apple sparse image format.
    Asif,
}

impl DiskFormat {
    /// Whether the current host can back this format.
    #[must_use]
    pub fn supported_on_host(self) -> bool {
        match self {
            Self::Raw => true,
            Self::Asif => cfg!(target_os = "macos"),
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::Asif => write!(f, "asif"),
        }
    }
}

/// Display geometry in points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayGeometry {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplayGeometry {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
        }
    }
}

/// The persisted VM configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    /// Document schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Guest OS class.
    pub os: GuestOs,
    /// Guest CPU architecture.
    #[serde(default = "default_arch")]
    pub arch: Arch,
    /// Number of virtual CPUs.
    pub cpu_count: u32,
    /// Memory size in bytes.
    pub memory_size: u64,
    /// Display geometry.
    #[serde(default)]
    pub display: DisplayGeometry,
    /// Virtual NIC MAC address, lowercase `aa:bb:cc:dd:ee:ff`.
    pub mac_address: String,
    /// Root disk image format tag.
    #[serde(default)]
    pub disk_format: DiskFormat,
    /// Base64-encoded hardware model blob (macOS guests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_model: Option<String>,
    /// Base64-encoded machine identifier blob (macOS guests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecid: Option<String>,
}

fn default_version() -> u32 {
    1
}

fn default_arch() -> Arch {
    Arch::Arm64
}

impl VmConfig {
    /// Reads a configuration document from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Writes the document to `path`, pretty-printed for hand inspection.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Validates values the engine cannot run with, before any resource is
    /// acquired.
    pub fn validate_for_host(&self) -> Result<()> {
        if self.cpu_count == 0 {
            return Err(EngineError::VmConfiguration("cpuCount must be > 0".into()));
        }
        if self.memory_size == 0 {
            return Err(EngineError::VmConfiguration(
                "memorySize must be > 0".into(),
            ));
        }
        if self.arch != Arch::Arm64 {
            return Err(EngineError::ArchMismatch(format!(
                "VM is {:?}, this host only executes arm64 guests",
                self.arch
            )));
        }
        if !self.disk_format.supported_on_host() {
            return Err(EngineError::VmConfiguration(format!(
                "disk format \"{}\" is not supported on this host",
                self.disk_format
            )));
        }
        Ok(())
    }

    /// Replaces the MAC address with a freshly generated one.
    ///
    /// Used when another running VM already owns this address.
    pub fn regenerate_mac_address(&mut self) {
        self.mac_address = generate_mac_address();
    }

    /// The MAC address in comparison form (lowercased).
    #[must_use]
    pub fn normalized_mac(&self) -> String {
        normalize_mac(&self.mac_address)
    }
}

/// Lowercases a MAC address for comparison.
#[must_use]
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

/// Generates a random locally-administered, unicast MAC address.
#[must_use]
pub fn generate_mac_address() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    // Locally administered, unicast: set bit 1 of the first octet, clear bit 0.
    let b0 = 0x02 | (bytes[0] & 0xfe);
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b0, bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VmConfig {
        VmConfig {
            version: 1,
            os: GuestOs::Linux,
            arch: Arch::Arm64,
            cpu_count: 4,
            memory_size: 4 * 1024 * 1024 * 1024,
            display: DisplayGeometry::default(),
            mac_address: "52:54:00:12:34:56".into(),
            disk_format: DiskFormat::Raw,
            hardware_model: None,
            ecid: None,
        }
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        sample().save(&path).unwrap();
        let loaded = VmConfig::load(&path).unwrap();
        assert_eq!(loaded.os, GuestOs::Linux);
        assert_eq!(loaded.cpu_count, 4);
        assert_eq!(loaded.mac_address, "52:54:00:12:34:56");
    }

    #[test]
    fn test_camel_case_field_names() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"cpuCount\""));
        assert!(json.contains("\"memorySize\""));
        assert!(json.contains("\"macAddress\""));
        assert!(json.contains("\"diskFormat\""));
    }

    #[test]
    fn test_defaults_applied_on_load() {
        let json = r#"{
            "os": "darwin",
            "cpuCount": 2,
            "memorySize": 2147483648,
            "macAddress": "aa:bb:cc:dd:ee:ff"
        }"#;
        let config: VmConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.arch, Arch::Arm64);
        assert_eq!(config.disk_format, DiskFormat::Raw);
        assert_eq!(config.display.width, 1024);
    }

    #[test]
    fn test_unknown_disk_format_rejected() {
        let json = r#"{
            "os": "linux",
            "cpuCount": 2,
            "memorySize": 1024,
            "macAddress": "aa:bb:cc:dd:ee:ff",
            "diskFormat": "qcow7"
        }"#;
        assert!(serde_json::from_str::<VmConfig>(json).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_cpu() {
        let mut config = sample();
        config.cpu_count = 0;
        assert!(config.validate_for_host().is_err());
    }

    #[test]
    fn test_validate_rejects_amd64() {
        let mut config = sample();
        config.arch = Arch::Amd64;
        assert!(matches!(
            config.validate_for_host(),
            Err(EngineError::ArchMismatch(_))
        ));
    }

    #[test]
    fn test_generated_mac_is_local_unicast() {
        for _ in 0..32 {
            let mac = generate_mac_address();
            let first = u8::from_str_radix(&mac[0..2], 16).unwrap();
            assert_eq!(first & 0x01, 0, "must be unicast: {mac}");
            assert_eq!(first & 0x02, 0x02, "must be locally administered: {mac}");
        }
    }

    #[test]
    fn test_regenerate_changes_mac() {
        let mut config = sample();
        let before = config.mac_address.clone();
        config.regenerate_mac_address();
        assert_ne!(config.mac_address, before);
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac(" AA:BB:CC:DD:EE:FF "), "aa:bb:cc:dd:ee:ff");
    }
}
