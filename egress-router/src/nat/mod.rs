//! Translation of allowed destinations into DNAT rules plus the SNAT rule
//! that hides the pod's source address.
//!
//! A destination entry is one of:
//!
//! - `<address>`: redirect all traffic arriving on the pod's primary
//!   interface to `address`.
//! - `<local-port> <tcp|udp|sctp> <address>`: redirect traffic for that
//!   port and protocol to `address`.
//! - `<local-port> <tcp|udp|sctp> <address> <remote-port>`: as above,
//!   rewriting the destination port too. A fourth token that is not a
//!   valid port is ignored with a warning.

mod iptables;

pub use iptables::Iptables;

use itertools::Itertools;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{Error, KernelError, Result};
use crate::netlink::IpFamily;

pub const NAT_TABLE: &str = "nat";
pub const PREROUTING: &str = "PREROUTING";
pub const POSTROUTING: &str = "POSTROUTING";

/// Transport protocol a port-scoped destination applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "sctp" => Ok(Self::Sctp),
            _ => Err(format!("incorrect protocol {:?}", s)),
        }
    }
}

/// One parsed destination entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationSpec {
    Address(IpAddr),
    Port {
        local_port: u16,
        protocol: Protocol,
        address: IpAddr,
        remote_port: Option<u16>,
    },
}

fn parse_port(raw: &str) -> std::result::Result<u16, String> {
    let port: i64 = raw
        .parse()
        .map_err(|e| format!("incorrect port number {:?}: {}", raw, e))?;
    u16::try_from(port).map_err(|_| format!("port number out of range {}", port))
}

fn parse_address(raw: &str) -> std::result::Result<IpAddr, String> {
    let host = raw.split_once('/').map_or(raw, |(host, _)| host);
    host.parse()
        .map_err(|e| format!("incorrect address {:?}: {}", raw, e))
}

impl FromStr for DestinationSpec {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidDestination {
            spec: raw.to_string(),
            reason,
        };
        let tokens = raw.split_whitespace().collect_vec();

        match tokens.as_slice() {
            [address] => Ok(Self::Address(parse_address(address).map_err(invalid)?)),
            [local_port, protocol, address, rest @ ..] if rest.len() <= 1 => {
                let local_port = parse_port(local_port).map_err(&invalid)?;
                let protocol = protocol.parse().map_err(&invalid)?;
                let address = parse_address(address).map_err(&invalid)?;
                let remote_port = rest.first().and_then(|remote| match parse_port(remote) {
                    Ok(port) => Some(port),
                    Err(reason) => {
                        warn!("Ignoring remote port of destination {:?}: {}", raw, reason);
                        None
                    }
                });
                Ok(Self::Port {
                    local_port,
                    protocol,
                    address,
                    remote_port,
                })
            }
            _ => Err(invalid(format!(
                "expected 1, 3 or 4 fields, found {}",
                tokens.len()
            ))),
        }
    }
}

impl DestinationSpec {
    pub fn address(&self) -> IpAddr {
        match self {
            Self::Address(address) | Self::Port { address, .. } => *address,
        }
    }

    /// Value for `--to-destination`.
    pub fn to_destination(&self) -> String {
        match self {
            Self::Port {
                address: IpAddr::V6(v6),
                remote_port: Some(port),
                ..
            } => format!("[{}]:{}", v6, port),
            Self::Port {
                address,
                remote_port: Some(port),
                ..
            } => format!("{}:{}", address, port),
            _ => self.address().to_string(),
        }
    }
}

/// A rule in the `nat` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatRule {
    Dnat {
        in_iface: String,
        protocol: Option<Protocol>,
        dport: Option<u16>,
        to_destination: String,
    },
    Snat {
        out_iface: String,
        to_source: IpAddr,
    },
}

impl NatRule {
    pub fn chain(&self) -> &'static str {
        match self {
            Self::Dnat { .. } => PREROUTING,
            Self::Snat { .. } => POSTROUTING,
        }
    }

    /// Match and target arguments, without table or chain.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            Self::Dnat {
                in_iface,
                protocol,
                dport,
                to_destination,
            } => {
                args.extend(["-i".to_string(), in_iface.clone()]);
                if let Some(protocol) = protocol {
                    args.extend(["-p".to_string(), protocol.to_string()]);
                }
                if let Some(dport) = dport {
                    args.extend(["--dport".to_string(), dport.to_string()]);
                }
                args.extend(["-j", "DNAT", "--to-destination"].map(String::from));
                args.push(to_destination.clone());
            }
            Self::Snat {
                out_iface,
                to_source,
            } => {
                args.extend(["-o".to_string(), out_iface.clone()]);
                args.extend(["-j", "SNAT", "--to-source"].map(String::from));
                args.push(to_source.to_string());
            }
        }
        args
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} -A {} {}", NAT_TABLE, self.chain(), self.args().join(" "))
    }
}

/// DNAT rules for every destination, in order, on `ingress`, followed by a
/// single SNAT rule on `egress` rewriting the source to `source`.
pub fn generate_rules(
    destinations: &[DestinationSpec],
    ingress: &str,
    egress: &str,
    source: IpAddr,
) -> Vec<NatRule> {
    if destinations.is_empty() {
        debug!("No destination information has been provided");
    }

    let mut rules = destinations
        .iter()
        .map(|destination| match destination {
            DestinationSpec::Address(_) => NatRule::Dnat {
                in_iface: ingress.to_string(),
                protocol: None,
                dport: None,
                to_destination: destination.to_destination(),
            },
            DestinationSpec::Port {
                local_port,
                protocol,
                ..
            } => NatRule::Dnat {
                in_iface: ingress.to_string(),
                protocol: Some(*protocol),
                dport: Some(*local_port),
                to_destination: destination.to_destination(),
            },
        })
        .collect_vec();

    rules.push(NatRule::Snat {
        out_iface: egress.to_string(),
        to_source: source,
    });
    rules
}

/// Firewall rule manipulation.
pub trait Firewall {
    /// Append `rule` to `table`/`chain` unless an identical rule exists.
    fn append_unique(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> std::result::Result<(), KernelError>;
}

/// The `nat` table of one address family.
pub struct NatTable<'a> {
    firewall: &'a dyn Firewall,
    family: IpFamily,
}

impl<'a> NatTable<'a> {
    pub fn new(firewall: &'a dyn Firewall, family: IpFamily) -> Self {
        Self { firewall, family }
    }

    /// Install `rules` in order; the first failure aborts.
    pub fn install(&self, rules: &[NatRule]) -> Result<()> {
        for rule in rules {
            self.firewall
                .append_unique(self.family, NAT_TABLE, rule.chain(), &rule.args())
                .map_err(|e| Error::Nat(format!("{} ({}): {}", rule, self.family, e)))?;
            debug!("Added {} rule: {}", self.family, rule);
        }
        Ok(())
    }
}
