use ipnetwork::IpNetwork;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::debug;

pub mod overrides;

use crate::error::{Error, KernelError, Result};
use crate::nat::DestinationSpec;
use crate::netlink::{IpFamily, MacvlanMode, Netlink, RouteFilter};
use crate::types::DNS;

/// Cluster-wide settings supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cloud provider the cluster runs on; empty on bare metal
    #[serde(rename = "cloudProvider", default)]
    pub cloud_provider: String,
}

/// Kind of interface attached to the pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfaceType {
    #[default]
    Macvlan,
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Macvlan => f.write_str("macvlan"),
        }
    }
}

impl FromStr for InterfaceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "macvlan" => Ok(Self::Macvlan),
            other => Err(format!("unsupported interfaceType {:?}", other)),
        }
    }
}

/// Arguments for the attached interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceArgs {
    /// Host interface the macvlan is stacked on
    #[serde(default, deserialize_with = "parse_opt", skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    /// Macvlan mode
    #[serde(
        default,
        deserialize_with = "parse_opt",
        serialize_with = "display_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub mode: Option<MacvlanMode>,
    /// Interface MTU
    #[serde(
        default,
        deserialize_with = "mtu_opt",
        serialize_with = "display_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub mtu: Option<u32>,
}

/// Macvlan arguments after defaulting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMacvlan {
    pub master: String,
    pub mode: MacvlanMode,
    pub mtu: u32,
}

impl InterfaceArgs {
    pub fn resolved(&self) -> Result<ResolvedMacvlan> {
        let missing = |key: &str| Error::Config(format!("interfaceArgs.{} is not set", key));
        Ok(ResolvedMacvlan {
            master: self.master.clone().ok_or_else(|| missing("master"))?,
            mode: self.mode.ok_or_else(|| missing("mode"))?,
            mtu: self.mtu.ok_or_else(|| missing("mtu"))?,
        })
    }
}

/// Egress addressing and allowed destinations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressConfig {
    /// Addresses (CIDR) assigned to the egress interface; the first is primary
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Next hop for all egress traffic
    #[serde(default)]
    pub gateway: String,
    /// Destination specs, see [`DestinationSpec`]
    #[serde(default)]
    pub destinations: Vec<String>,
}

/// Reference to a ConfigMap carrying IP overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfigRef {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<EgressConfig>,
}

/// Network configuration for the egress router CNI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Name of the network
    #[serde(default)]
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Interface kind; defaulted during resolution
    #[serde(
        rename = "interfaceType",
        default,
        deserialize_with = "parse_opt",
        serialize_with = "display_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub interface_type: Option<InterfaceType>,
    /// Interface arguments; defaulted during resolution
    #[serde(rename = "interfaceArgs", default)]
    pub interface_args: InterfaceArgs,
    /// Egress addressing
    #[serde(rename = "ip", alias = "egress", default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<EgressConfig>,
    /// Per-pod egress addressing keyed by `namespace/name`
    #[serde(rename = "podIP", default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<HashMap<String, EgressConfig>>,
    /// ConfigMap reference for IP overrides
    #[serde(rename = "ipConfig", alias = "ipConfigRef", default, skip_serializing_if = "Option::is_none")]
    pub ip_config: Option<IpConfigRef>,
    /// DNS settings passed through to the result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
    /// Log destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    /// Log level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Egress addressing after validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEgress {
    pub addresses: Vec<IpNetwork>,
    pub gateway: IpAddr,
    pub destinations: Vec<DestinationSpec>,
}

impl ResolvedEgress {
    /// The first configured address; it selects the address family and
    /// the SNAT source.
    pub fn primary(&self) -> IpNetwork {
        self.addresses[0]
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of_network(&self.primary())
    }
}

impl EgressConfig {
    pub fn resolve(&self) -> Result<ResolvedEgress> {
        if self.addresses.is_empty() {
            return Err(Error::Config("no egress addresses configured".to_string()));
        }

        let addresses = self
            .addresses
            .iter()
            .map(|a| {
                a.trim()
                    .parse::<IpNetwork>()
                    .map_err(|e| Error::Config(format!("unable to parse IP address {:?}: {}", a, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        let family = IpFamily::of_network(&addresses[0]);

        let gateway: IpAddr = self
            .gateway
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("unable to parse gateway {:?}: {}", self.gateway, e)))?;
        if IpFamily::of(&gateway) != family {
            return Err(Error::Config(format!(
                "gateway {} is not an {} address like {}",
                gateway, family, addresses[0]
            )));
        }

        let mut destinations = Vec::with_capacity(self.destinations.len());
        for raw in &self.destinations {
            let spec: DestinationSpec = raw.parse()?;
            if IpFamily::of(&spec.address()) != family {
                return Err(Error::InvalidDestination {
                    spec: raw.clone(),
                    reason: format!("address family does not match {}", addresses[0]),
                });
            }
            destinations.push(spec);
        }

        Ok(ResolvedEgress {
            addresses,
            gateway,
            destinations,
        })
    }
}

impl NetConf {
    /// Decode configuration without touching host state
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Config(format!("failed to load netconf: {}", e)))
    }

    /// Decode configuration and fill defaults from host state
    pub fn load(bytes: &[u8], cluster: &ClusterConfig, netlink: &dyn Netlink) -> Result<Self> {
        let mut conf = Self::parse(bytes)?;
        conf.fill_defaults(cluster, netlink)?;
        Ok(conf)
    }

    /// Fill in interface type and interface arguments that were left out.
    /// Fields already set are never touched.
    pub fn fill_defaults(&mut self, cluster: &ClusterConfig, netlink: &dyn Netlink) -> Result<()> {
        let interface_type = match self.interface_type {
            Some(interface_type) => interface_type,
            None if cluster.cloud_provider.is_empty() => InterfaceType::Macvlan,
            None => {
                return Err(Error::Resolution(format!(
                    "must specify explicit interfaceType for cloud provider {:?}",
                    cluster.cloud_provider
                )))
            }
        };
        self.interface_type = Some(interface_type);

        match interface_type {
            InterfaceType::Macvlan => {
                let args = &mut self.interface_args;
                if args.master.is_none() {
                    let master = default_route_interface(netlink).map_err(|e| {
                        Error::Resolution(format!("unable to get default route interface name: {}", e))
                    })?;
                    debug!("Defaulted master interface to {}", master);
                    args.master = Some(master);
                }
                if args.mode.is_none() {
                    args.mode = Some(MacvlanMode::Bridge);
                }
                if args.mtu.is_none() {
                    let master = args.master.as_deref().unwrap_or_default();
                    let link = netlink.link_by_name(master).map_err(|e| {
                        Error::Resolution(format!("unable to get MTU on master interface: {}", e))
                    })?;
                    debug!("Defaulted MTU to {} from {}", link.mtu, master);
                    args.mtu = Some(link.mtu);
                }
            }
        }

        Ok(())
    }

    /// Validated egress section
    pub fn egress(&self) -> Result<ResolvedEgress> {
        self.egress
            .as_ref()
            .ok_or_else(|| Error::Config("missing \"ip\" section".to_string()))?
            .resolve()
    }
}

/// Name of the interface carrying the first default route of any family.
pub fn default_route_interface(netlink: &dyn Netlink) -> std::result::Result<String, KernelError> {
    let filter = RouteFilter {
        default_only: true,
        ..Default::default()
    };
    let route = netlink
        .route_list_filtered(None, &filter)?
        .into_iter()
        .next()
        .ok_or_else(|| KernelError::Other("no default route interface found".to_string()))?;
    Ok(netlink.link_by_index(route.link_index)?.name)
}

fn parse_opt<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(de::Error::custom),
    }
}

fn mtu_opt<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Mtu {
        Number(u32),
        Text(String),
    }

    match Option::<Mtu>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Mtu::Number(mtu)) => Ok(Some(mtu)),
        Some(Mtu::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Mtu::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| de::Error::custom(format!("invalid mtu {:?}: {}", text, e))),
    }
}

fn display_opt<S, T>(value: &Option<T>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    T: fmt::Display,
{
    match value {
        Some(value) => serializer.collect_str(value),
        None => serializer.serialize_none(),
    }
}
