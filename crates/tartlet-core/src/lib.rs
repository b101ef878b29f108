//! Platform-independent core of the tartlet run engine.
//!
//! Everything in this crate works on any Unix host: the VM configuration
//! document and directory layout, the storage index over the VM home
//! directory, advisory file locks, the disk and directory-share spec
//! grammars, network plan selection, and the packet-filter helper
//! subprocess. Driving an actual virtual machine is the `tartlet-vz`
//! crate's job and is macOS-only.

pub mod archive;
pub mod config;
pub mod directory;
pub mod disk;
pub mod error;
pub mod home;
pub mod lock;
pub mod net;
pub mod reference;
pub mod share;
pub mod softnet;

pub use config::{Arch, DiskFormat, GuestOs, VmConfig};
pub use directory::VmDirectory;
pub use disk::{CachingMode, DiskSource, DiskSpec, SyncMode};
pub use error::{EngineError, Result};
pub use home::{StorageIndex, home_dir};
pub use lock::FileLock;
pub use net::{NetworkOptions, NetworkPlan, NetworkSelection};
pub use reference::ImageRef;
pub use share::{DirShareSpec, ShareSource};
