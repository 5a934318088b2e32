use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// CNI command arguments
#[derive(Debug, Clone, Default)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path; empty once the namespace is gone
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Arguments
    pub args: HashMap<String, String>,
    /// Path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

impl CmdArgs {
    /// `namespace/name` of the pod, when the runtime passed Kubernetes
    /// arguments.
    pub fn pod_key(&self) -> Option<String> {
        let namespace = self.args.get("K8S_POD_NAMESPACE")?;
        let name = self.args.get("K8S_POD_NAME")?;
        Some(format!("{}/{}", namespace, name))
    }

    pub fn pod_namespace(&self) -> Option<&str> {
        self.args.get("K8S_POD_NAMESPACE").map(String::as_str)
    }
}

/// Current result format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IPConfig>>,
    /// Routes to configure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,
    /// DNS configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
}

/// Interface information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IPConfig {
    /// Address family, "4" or "6"
    pub version: String,
    /// IP address with prefix length
    pub address: String,
    /// Gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Interface index this IP is assigned to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// DNS configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DNS {
    /// DNS nameservers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    /// DNS domain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// DNS search domains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    /// DNS options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Route configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// Error reported to the runtime on failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default)]
    pub details: String,
}

impl Result {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: None,
            ips: None,
            routes: None,
            dns: None,
        }
    }

    /// Add an interface to the result, returning its index
    pub fn add_interface(&mut self, interface: Interface) -> usize {
        let interfaces = self.interfaces.get_or_insert_with(Vec::new);
        interfaces.push(interface);
        interfaces.len() - 1
    }

    /// Add an IP configuration to the result
    pub fn add_ip(&mut self, ip: IPConfig) {
        self.ips.get_or_insert_with(Vec::new).push(ip);
    }

    /// Add a route to the result
    pub fn add_route(&mut self, route: Route) {
        self.routes.get_or_insert_with(Vec::new).push(route);
    }

    /// Set DNS configuration
    pub fn set_dns(&mut self, dns: DNS) {
        self.dns = Some(dns);
    }

    pub fn interfaces(&self) -> &[Interface] {
        self.interfaces.as_deref().unwrap_or_default()
    }

    pub fn ips(&self) -> &[IPConfig] {
        self.ips.as_deref().unwrap_or_default()
    }

    pub fn routes(&self) -> &[Route] {
        self.routes.as_deref().unwrap_or_default()
    }

    /// Print result as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        println!("{}", json);
        Ok(())
    }
}
