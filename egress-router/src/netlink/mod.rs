//! Narrow capability interface over kernel link, address, route and
//! neighbor state.
//!
//! Every call reflects live kernel state; nothing is cached. Production code
//! uses [`IpRoute2`], tests substitute an in-memory implementation.

mod iproute2;

pub use iproute2::IpRoute2;

use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;

use crate::error::KernelError;

/// Address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn of_network(net: &IpNetwork) -> Self {
        Self::of(&net.ip())
    }

    /// Host prefix length (`/32` or `/128`).
    pub fn host_prefix(self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }

    /// Version string used in CNI results.
    pub fn version(self) -> &'static str {
        match self {
            Self::V4 => "4",
            Self::V6 => "6",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("ipv4"),
            Self::V6 => f.write_str("ipv6"),
        }
    }
}

/// Macvlan operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacvlanMode {
    #[default]
    Bridge,
    Private,
    Vepa,
    Passthru,
}

impl MacvlanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Private => "private",
            Self::Vepa => "vepa",
            Self::Passthru => "passthru",
        }
    }
}

impl fmt::Display for MacvlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MacvlanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bridge" => Ok(Self::Bridge),
            "private" => Ok(Self::Private),
            "vepa" => Ok(Self::Vepa),
            "passthru" => Ok(Self::Passthru),
            other => Err(format!("unknown macvlan mode: {:?}", other)),
        }
    }
}

/// A network interface as seen by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    pub hardware_addr: Option<String>,
    pub up: bool,
}

/// Virtual interface kinds the plugin knows how to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Macvlan { mode: MacvlanMode },
}

/// Attributes of a link to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub name: String,
    pub parent_index: u32,
    pub mtu: u32,
    pub kind: LinkKind,
    /// Namespace the link is created in; the caller's namespace when `None`.
    pub netns: Option<PathBuf>,
}

/// An address assigned to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    pub network: IpNetwork,
    /// Still undergoing duplicate address detection.
    pub tentative: bool,
    /// Duplicate address detection failed.
    pub dad_failed: bool,
}

impl Addr {
    pub fn new(network: IpNetwork) -> Self {
        Self {
            network,
            tentative: false,
            dad_failed: false,
        }
    }
}

/// A routing table entry. A `dst` of `None` is the default route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub family: IpFamily,
    pub dst: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    pub link_index: u32,
}

impl Route {
    pub fn is_default(&self) -> bool {
        self.dst.is_none()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dst {
            Some(dst) => write!(f, "{}", dst)?,
            None => f.write_str("default")?,
        }
        if let Some(gw) = &self.gateway {
            write!(f, " via {}", gw)?;
        }
        write!(f, " dev #{}", self.link_index)
    }
}

/// Filter applied by [`Netlink::route_list_filtered`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteFilter {
    /// Only routes leaving through this link.
    pub link_index: Option<u32>,
    /// Only routes without a destination prefix.
    pub default_only: bool,
}

impl RouteFilter {
    pub fn matches(&self, route: &Route) -> bool {
        if let Some(index) = self.link_index {
            if route.link_index != index {
                return false;
            }
        }
        !self.default_only || route.is_default()
    }
}

/// A neighbor table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub ip: IpAddr,
    pub lladdr: Option<String>,
    pub state: Vec<String>,
}

/// Link, address, route and neighbor operations.
///
/// Each call either succeeds or fails with [`KernelError::NotFound`],
/// [`KernelError::AlreadyExists`] or an opaque [`KernelError::Other`].
pub trait Netlink {
    fn link_by_name(&self, name: &str) -> Result<Link, KernelError>;
    fn link_by_index(&self, index: u32) -> Result<Link, KernelError>;
    fn link_add(&self, spec: &LinkSpec) -> Result<(), KernelError>;
    fn link_set_up(&self, link: &Link) -> Result<(), KernelError>;
    fn link_set_name(&self, link: &Link, name: &str) -> Result<(), KernelError>;
    fn link_del(&self, link: &Link) -> Result<(), KernelError>;

    /// Addresses on `link`; all families when `family` is `None`.
    fn addr_list(&self, link: &Link, family: Option<IpFamily>) -> Result<Vec<Addr>, KernelError>;
    fn addr_add(&self, link: &Link, addr: &IpNetwork) -> Result<(), KernelError>;
    fn addr_del(&self, link: &Link, addr: &IpNetwork) -> Result<(), KernelError>;

    fn route_add(&self, route: &Route) -> Result<(), KernelError>;
    fn route_del(&self, route: &Route) -> Result<(), KernelError>;
    /// Main-table routes; all families when `family` is `None`.
    fn route_list_filtered(
        &self,
        family: Option<IpFamily>,
        filter: &RouteFilter,
    ) -> Result<Vec<Route>, KernelError>;

    fn route_list(&self, link: &Link, family: IpFamily) -> Result<Vec<Route>, KernelError> {
        let filter = RouteFilter {
            link_index: Some(link.index),
            ..Default::default()
        };
        self.route_list_filtered(Some(family), &filter)
    }

    fn neigh_list(&self, link: &Link, family: Option<IpFamily>) -> Result<Vec<Neighbor>, KernelError>;
    /// Announce `addr` on `link` (gratuitous ARP or unsolicited neighbor
    /// advertisement).
    fn neigh_announce(&self, link: &Link, addr: IpAddr) -> Result<(), KernelError>;
}

/// Convenience lookup-then-delete that reports a missing link as `NotFound`.
pub fn del_link_by_name(netlink: &dyn Netlink, name: &str) -> Result<(), KernelError> {
    let link = netlink.link_by_name(name)?;
    netlink.link_del(&link)
}

/// Run an external networking tool, classifying its failure.
pub(crate) fn run_tool(program: &str, args: &[String]) -> Result<String, KernelError> {
    let op = format!("{} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| KernelError::Other(format!("failed to execute {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(classify_failure(&op, &String::from_utf8_lossy(&output.stderr)));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) fn classify_failure(op: &str, stderr: &str) -> KernelError {
    let stderr = stderr.trim();
    if stderr.contains("File exists") {
        return KernelError::AlreadyExists(op.to_string());
    }
    const MISSING: [&str; 6] = [
        "Cannot find device",
        "does not exist",
        "No such device",
        "No such process",
        "No such file or directory",
        "ENOENT",
    ];
    if MISSING.iter().any(|marker| stderr.contains(marker)) {
        return KernelError::NotFound(op.to_string());
    }
    KernelError::Other(format!("{} failed: {}", op, stderr))
}
