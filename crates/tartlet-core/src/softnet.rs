//! The isolating packet-filter helper subprocess.
//!
//! For the softnet and host-only network plans the engine spawns an
//! external helper that enforces packet-level isolation for the VM's NIC.
//! The data plane is an anonymous `SOCK_DGRAM` socketpair: the helper
//! receives its end on a fixed descriptor number, the engine's end is
//! handed to the network device attachment.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::unistd::Pid;
use tartlet_constants::{env as env_names, helper};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// A running packet-filter helper and the engine's end of its data plane.
pub struct FilterHelper {
    child: Child,
    data_fd: Option<OwnedFd>,
}

impl FilterHelper {
    /// Spawns the helper for the VM with MAC `mac`.
    ///
    /// `extra_args` come from the network plan (`--allow`, `--expose`,
    /// `--host-only`). The child is killed if the handle is dropped without
    /// [`terminate`](Self::terminate), so helper lifetime can never exceed
    /// engine lifetime.
    pub fn spawn(binary: &Path, mac: &str, extra_args: &[String]) -> Result<Self> {
        let (engine_fd, helper_fd) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .map_err(|errno| EngineError::internal(format!("socketpair failed: {errno}")))?;

        let helper_raw = helper_fd.as_raw_fd();
        let mut command = Command::new(binary);
        command
            .arg("--vm-mac")
            .arg(mac)
            .args(extra_args)
            .kill_on_drop(true);
        // The helper finds its socketpair end on a fixed descriptor.
        unsafe {
            command.pre_exec(move || {
                nix::unistd::dup2(helper_raw, helper::DATA_PLANE_FD)
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let child = command.spawn().map_err(|err| {
            EngineError::internal(format!(
                "failed to spawn filter helper {}: {err}",
                binary.display()
            ))
        })?;
        // The child owns its end now.
        drop(helper_fd);

        debug!(helper = %binary.display(), pid = ?child.id(), "filter helper started");
        Ok(Self {
            child,
            data_fd: Some(engine_fd),
        })
    }

    /// Takes the engine's end of the data-plane socketpair.
    ///
    /// Returns `None` after the first call; the descriptor's ownership moves
    /// into the network device attachment.
    pub fn take_data_fd(&mut self) -> Option<OwnedFd> {
        self.data_fd.take()
    }

    /// Process id of the helper, if it is still running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Terminates the helper: SIGTERM, bounded wait, then SIGKILL.
    pub async fn terminate(mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        #[allow(clippy::cast_possible_wrap)]
        if let Err(errno) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %errno, "failed to signal filter helper");
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!(pid, %status, "filter helper exited"),
            Ok(Err(err)) => warn!(pid, error = %err, "waiting for filter helper failed"),
            Err(_) => {
                warn!(pid, "filter helper ignored SIGTERM, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Resolves the helper binary: environment override first, then `PATH`.
pub fn resolve_binary() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(env_names::SOFTNET_BINARY) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(helper::SOFTNET_BINARY_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(EngineError::Common(tartlet_error::CommonError::not_found(
        format!(
            "filter helper \"{}\" (install it or set {})",
            helper::SOFTNET_BINARY_NAME,
            env_names::SOFTNET_BINARY
        ),
    )))
}

/// Repairs the helper's setuid bit on interactive sessions.
///
/// The helper needs root to attach to the host network stack. On a terminal
/// the engine asks once via sudo; non-interactive sessions are expected to
/// have provisioned the bit already. Failures are logged and spawning
/// proceeds, the helper itself reports missing privileges.
pub fn ensure_setuid(binary: &Path, interactive: bool) {
    let Ok(metadata) = std::fs::metadata(binary) else {
        return;
    };
    if metadata.permissions().mode() & 0o4000 != 0 {
        return;
    }
    if !interactive {
        warn!(
            helper = %binary.display(),
            "filter helper is not setuid and the session is non-interactive"
        );
        return;
    }
    eprintln!(
        "{} needs elevated privileges, asking sudo to set the setuid bit",
        binary.display()
    );
    let status = std::process::Command::new("sudo")
        .arg("chmod")
        .arg("+s")
        .arg(binary)
        .status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%status, "sudo chmod +s failed"),
        Err(err) => warn!(error = %err, "could not run sudo"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_and_terminate() {
        // `cat` blocks on stdin forever, standing in for a long-lived helper.
        let mut helper =
            FilterHelper::spawn(Path::new("/bin/cat"), "aa:bb:cc:dd:ee:ff", &[]).unwrap();
        assert!(helper.pid().is_some());

        let fd = helper.take_data_fd().expect("data fd available once");
        assert!(fd.as_raw_fd() >= 0);
        assert!(helper.take_data_fd().is_none());

        helper.terminate().await;
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let result = FilterHelper::spawn(Path::new("/nonexistent/softnet"), "aa:bb:cc:dd:ee:ff", &[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_binary_env_override() {
        // Only exercises the PATH-scan fallback shape; the environment
        // override is covered by the run command's integration path.
        let result = resolve_binary();
        // The helper is usually absent on development hosts.
        if let Err(err) = result {
            assert!(err.to_string().contains("softnet"));
        }
    }
}
