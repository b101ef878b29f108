//! The chrome bridge: display mode selection, remote-display URL
//! publication and window-event conversion.
//!
//! Exactly one of three display modes drives the run: the native UI
//! window, the integrated remote-display (VNC-style) server, or headless.
//! The native window host is an external collaborator; its window-closed
//! event re-enters the engine as the `window-closed` control command, so
//! UI, signal and socket sources all share one event queue.

#[cfg(target_os = "macos")]
use std::io::IsTerminal;

#[cfg(target_os = "macos")]
use tracing::debug;
use tracing::warn;

use tartlet_core::error::{EngineError, Result};

/// How the VM's screen is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Native UI window.
    Native,
    /// Integrated remote-display server.
    Vnc {
        /// Use the experimental server implementation.
        experimental: bool,
    },
    /// No display at all.
    Headless,
}

/// Picks the display mode, enforcing the mutual exclusions.
pub fn select_display_mode(
    graphics: bool,
    no_graphics: bool,
    vnc: bool,
    vnc_experimental: bool,
    captures_system_keys: bool,
) -> Result<DisplayMode> {
    if graphics && no_graphics {
        return Err(EngineError::InvalidOptions(
            "--graphics and --no-graphics are mutually exclusive".into(),
        ));
    }
    if vnc && vnc_experimental {
        return Err(EngineError::InvalidOptions(
            "--vnc and --vnc-experimental are mutually exclusive".into(),
        ));
    }
    let remote = vnc || vnc_experimental;
    if graphics && remote {
        return Err(EngineError::InvalidOptions(
            "--graphics cannot be combined with a remote display".into(),
        ));
    }
    if captures_system_keys && (no_graphics || remote) {
        return Err(EngineError::InvalidOptions(
            "--captures-system-keys requires the native UI".into(),
        ));
    }

    if remote {
        Ok(DisplayMode::Vnc {
            experimental: vnc_experimental,
        })
    } else if no_graphics {
        Ok(DisplayMode::Headless)
    } else {
        Ok(DisplayMode::Native)
    }
}

/// Derives the published remote-display URL.
#[must_use]
pub fn vnc_url(host: &str, port: u16, password: Option<&str>) -> String {
    match password {
        Some(password) => format!("vnc://:{password}@{host}:{port}"),
        None => format!("vnc://{host}:{port}"),
    }
}

/// The host component peers should dial.
///
/// Loopback works for the shared-NAT default; on a bridged network the VM's
/// screen is served from the host's own address, so the URL carries the
/// host name instead.
#[must_use]
pub fn reachable_host(bridged: bool) -> String {
    if bridged {
        match nix::unistd::gethostname() {
            Ok(name) if !name.is_empty() => return name.to_string_lossy().into_owned(),
            _ => warn!("could not resolve the host name, publishing loopback"),
        }
    }
    "127.0.0.1".to_string()
}

/// Publishes the remote-display URL: prints it, and on interactive
/// sessions also opens it locally. All failures are swallowed; publication
/// never influences the run.
pub fn publish_vnc_url(url: &str) {
    println!("VNC server is running at {url}");
    #[cfg(target_os = "macos")]
    if std::io::stdout().is_terminal() {
        match std::process::Command::new("open").arg(url).status() {
            Ok(status) if status.success() => {}
            Ok(status) => debug!(%status, "open exited non-zero"),
            Err(err) => debug!(error = %err, "could not open the display URL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_native() {
        let mode = select_display_mode(false, false, false, false, false).unwrap();
        assert_eq!(mode, DisplayMode::Native);
    }

    #[test]
    fn test_no_graphics_is_headless() {
        let mode = select_display_mode(false, true, false, false, false).unwrap();
        assert_eq!(mode, DisplayMode::Headless);
    }

    #[test]
    fn test_vnc_modes() {
        assert_eq!(
            select_display_mode(false, false, true, false, false).unwrap(),
            DisplayMode::Vnc { experimental: false }
        );
        assert_eq!(
            select_display_mode(false, true, false, true, false).unwrap(),
            DisplayMode::Vnc { experimental: true }
        );
    }

    #[test]
    fn test_graphics_exclusions() {
        assert!(select_display_mode(true, true, false, false, false).is_err());
        assert!(select_display_mode(true, false, true, false, false).is_err());
        assert!(select_display_mode(false, false, true, true, false).is_err());
    }

    #[test]
    fn test_captures_system_keys_requires_native_ui() {
        assert!(select_display_mode(false, true, false, false, true).is_err());
        assert!(select_display_mode(false, false, true, false, true).is_err());
        assert!(select_display_mode(false, false, false, true, true).is_err());
        assert!(select_display_mode(true, false, false, false, true).is_ok());
    }

    #[test]
    fn test_vnc_url_shapes() {
        assert_eq!(
            vnc_url("127.0.0.1", 5900, Some("s3cret")),
            "vnc://:s3cret@127.0.0.1:5900"
        );
        assert_eq!(vnc_url("mac-mini.local", 5901, None), "vnc://mac-mini.local:5901");
    }

    #[test]
    fn test_reachable_host() {
        assert_eq!(reachable_host(false), "127.0.0.1");
        // Bridged host naming depends on the machine; it only has to differ
        // from loopback when a hostname exists.
        let bridged = reachable_host(true);
        assert!(!bridged.is_empty());
    }

}
