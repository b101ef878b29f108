//! Network subsystem selection.
//!
//! Exactly one network plan backs the VM's NIC. The bridged, softnet and
//! host-only options are mutually exclusive; any softnet sub-option implies
//! softnet itself. `--net-bridged list` is informational: the engine prints
//! the host interfaces and exits without starting a VM.

use crate::error::{EngineError, Result};

/// Raw network-related options from the CLI record.
#[derive(Debug, Clone, Default)]
pub struct NetworkOptions {
    /// `--net-bridged <iface|"list">`, repeatable.
    pub bridged: Vec<String>,
    /// `--net-softnet`.
    pub softnet: bool,
    /// `--net-softnet-allow <CIDRs>`.
    pub softnet_allow: Option<String>,
    /// `--net-softnet-expose <port specs>`.
    pub softnet_expose: Option<String>,
    /// `--net-host`.
    pub host: bool,
}

impl NetworkOptions {
    fn softnet_requested(&self) -> bool {
        self.softnet || self.softnet_allow.is_some() || self.softnet_expose.is_some()
    }
}

/// The chosen network subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPlan {
    /// Framework NAT; the default.
    Shared,
    /// Bridge onto the named host interfaces, one device per interface.
    Bridged(Vec<String>),
    /// Isolating packet-filter helper with the given extra arguments.
    Softnet(Vec<String>),
    /// Host-only networking, also backed by the filter helper.
    Host(Vec<String>),
}

impl NetworkPlan {
    /// Whether this plan needs the packet-filter helper subprocess.
    #[must_use]
    pub fn needs_filter_helper(&self) -> bool {
        matches!(self, Self::Softnet(_) | Self::Host(_))
    }
}

/// Outcome of the selection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkSelection {
    /// Run the VM with this plan.
    Plan(NetworkPlan),
    /// Print the bridgeable host interfaces and exit informationally.
    ListBridgedInterfaces,
}

/// Validates the option record and picks exactly one network plan.
pub fn select(options: &NetworkOptions) -> Result<NetworkSelection> {
    let softnet = options.softnet_requested();
    let bridged = !options.bridged.is_empty();

    let picked = [bridged, softnet, options.host]
        .iter()
        .filter(|&&flag| flag)
        .count();
    if picked > 1 {
        return Err(EngineError::InvalidOptions(
            "--net-bridged, --net-softnet and --net-host are mutually exclusive".into(),
        ));
    }

    if bridged {
        if options.bridged.iter().any(|iface| iface == "list") {
            return Ok(NetworkSelection::ListBridgedInterfaces);
        }
        return Ok(NetworkSelection::Plan(NetworkPlan::Bridged(
            options.bridged.clone(),
        )));
    }

    if softnet {
        return Ok(NetworkSelection::Plan(NetworkPlan::Softnet(
            softnet_args(options),
        )));
    }

    if options.host {
        return Ok(NetworkSelection::Plan(NetworkPlan::Host(vec![
            "--host-only".into(),
        ])));
    }

    Ok(NetworkSelection::Plan(NetworkPlan::Shared))
}

fn softnet_args(options: &NetworkOptions) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(allow) = &options.softnet_allow {
        args.push("--allow".into());
        args.push(allow.clone());
    }
    if let Some(expose) = &options.softnet_expose {
        args.push("--expose".into());
        args.push(expose.clone());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_shared_nat() {
        let selection = select(&NetworkOptions::default()).unwrap();
        assert_eq!(selection, NetworkSelection::Plan(NetworkPlan::Shared));
    }

    #[test]
    fn test_bridged() {
        let options = NetworkOptions {
            bridged: vec!["en0".into()],
            ..Default::default()
        };
        assert_eq!(
            select(&options).unwrap(),
            NetworkSelection::Plan(NetworkPlan::Bridged(vec!["en0".into()]))
        );
    }

    #[test]
    fn test_bridged_list_is_informational() {
        let options = NetworkOptions {
            bridged: vec!["list".into()],
            ..Default::default()
        };
        assert_eq!(
            select(&options).unwrap(),
            NetworkSelection::ListBridgedInterfaces
        );
    }

    #[test]
    fn test_softnet_sub_option_implies_softnet() {
        let options = NetworkOptions {
            softnet_allow: Some("192.168.0.0/24".into()),
            ..Default::default()
        };
        match select(&options).unwrap() {
            NetworkSelection::Plan(NetworkPlan::Softnet(args)) => {
                assert_eq!(args, vec!["--allow", "192.168.0.0/24"]);
            }
            other => panic!("expected softnet, got {other:?}"),
        }
    }

    #[test]
    fn test_softnet_expose_args() {
        let options = NetworkOptions {
            softnet: true,
            softnet_expose: Some("8080:80".into()),
            ..Default::default()
        };
        match select(&options).unwrap() {
            NetworkSelection::Plan(NetworkPlan::Softnet(args)) => {
                assert_eq!(args, vec!["--expose", "8080:80"]);
            }
            other => panic!("expected softnet, got {other:?}"),
        }
    }

    #[test]
    fn test_host_only_uses_helper() {
        let options = NetworkOptions {
            host: true,
            ..Default::default()
        };
        let NetworkSelection::Plan(plan) = select(&options).unwrap() else {
            panic!("expected a plan");
        };
        assert!(plan.needs_filter_helper());
    }

    #[test]
    fn test_mutual_exclusion() {
        let combos = [
            NetworkOptions {
                bridged: vec!["en0".into()],
                softnet: true,
                ..Default::default()
            },
            NetworkOptions {
                bridged: vec!["en0".into()],
                host: true,
                ..Default::default()
            },
            NetworkOptions {
                softnet: true,
                host: true,
                ..Default::default()
            },
            NetworkOptions {
                // Implied softnet conflicts too.
                softnet_expose: Some("22".into()),
                host: true,
                ..Default::default()
            },
        ];
        for options in combos {
            assert!(
                matches!(select(&options), Err(EngineError::InvalidOptions(_))),
                "expected InvalidOptions for {options:?}"
            );
        }
    }
}
