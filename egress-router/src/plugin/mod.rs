//! The egress router plugin: wires a macvlan into the pod, moves the pod's
//! default route onto it and installs the NAT rules that restrict where
//! traffic may go.

pub mod iface;
pub mod macvlan;

use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::config::{ClusterConfig, NetConf, ResolvedEgress};
use crate::error::{Error, Result};
use crate::nat::{self, Firewall, Iptables, NatRule, NatTable};
use crate::netlink::{del_link_by_name, IpFamily, IpRoute2, Netlink};
use crate::netns::{with_netns, Namespaces, NetNs, SystemNamespaces};
use crate::sysctl::{ProcSysctl, Sysctl};
use crate::types::{CmdArgs, IPConfig, Interface, Result as CniResult};

/// The pod's cluster-facing interface. Its default routes are replaced and
/// inbound traffic on it is redirected.
pub const PRIMARY_INTERFACE: &str = "eth0";

/// Host facilities the plugin acts through.
pub struct Kernel {
    pub netlink: Box<dyn Netlink>,
    pub sysctl: Box<dyn Sysctl>,
    pub firewall: Box<dyn Firewall>,
    pub namespaces: Box<dyn Namespaces>,
}

impl Kernel {
    /// The real host: `ip`, `/proc/sys`, `iptables` and `setns(2)`.
    pub fn system() -> Self {
        Self {
            netlink: Box::new(IpRoute2::default()),
            sysctl: Box::new(ProcSysctl::default()),
            firewall: Box::new(Iptables),
            namespaces: Box::new(SystemNamespaces),
        }
    }
}

pub struct EgressRouter {
    kernel: Kernel,
    cluster: ClusterConfig,
}

impl EgressRouter {
    pub fn new(kernel: Kernel, cluster: ClusterConfig) -> Self {
        Self { kernel, cluster }
    }

    /// Attach the egress interface to the pod.
    ///
    /// Configuration and destinations are validated before anything is
    /// created. Once the interface exists, any failure removes it again.
    pub fn add(&self, args: &CmdArgs) -> Result<CniResult> {
        info!(
            "Called CNI ADD for container {} ({} in {})",
            args.container_id, args.ifname, args.netns
        );

        let conf = NetConf::load(&args.stdin_data, &self.cluster, self.kernel.netlink.as_ref())?;
        let macvlan_args = conf.interface_args.resolved()?;
        let egress = conf.egress()?;
        debug!("Gateway: {}", egress.gateway);
        debug!("IP source addresses: {:?}", egress.addresses);
        debug!("Destinations: {:?}", egress.destinations);

        // Parse destinations up front so a bad entry creates nothing
        let rules = nat::generate_rules(
            &egress.destinations,
            PRIMARY_INTERFACE,
            &args.ifname,
            egress.primary().ip(),
        );

        if args.netns.is_empty() {
            return Err(Error::Config("CNI_NETNS is required for ADD".to_string()));
        }
        let netns = self.open_netns(&args.netns)?;

        // Create the macvlan inside the pod namespace
        let interface = macvlan::create_macvlan(&self.kernel, &macvlan_args, &args.ifname, &netns)?;
        let mut result = build_result(&conf.cni_version, interface, &egress);

        // Configure addressing, routing and NAT inside the pod namespace
        let configured = with_netns(self.kernel.namespaces.as_ref(), &netns, || {
            self.configure(&args.ifname, &result, &egress, &rules)
        });
        if let Err(e) = configured {
            self.rollback(&netns, &args.ifname);
            return Err(e);
        }

        if let Some(dns) = &conf.dns {
            result.set_dns(dns.clone());
        }
        info!("Egress router interface {} ready in {}", args.ifname, args.netns);
        Ok(result)
    }

    fn configure(
        &self,
        ifname: &str,
        result: &CniResult,
        egress: &ResolvedEgress,
        rules: &[NatRule],
    ) -> Result<()> {
        iface::configure_iface(&self.kernel, ifname, result)?;

        // Steer all egress through the new interface

        let link = self
            .kernel
            .netlink
            .link_by_name(ifname)
            .map_err(|e| Error::configuration(ifname, format!("could not get interface: {}", e)))?;
        iface::install_egress_routes(&self.kernel, &link, egress, PRIMARY_INTERFACE)?;
        iface::announce_addresses(self.kernel.netlink.as_ref(), &link, &egress.addresses);

        // Rewrite traffic in both directions
        NatTable::new(self.kernel.firewall.as_ref(), egress.family()).install(rules)
    }

    fn rollback(&self, netns: &NetNs, ifname: &str) {
        warn!("Removing {} from {} after failed ADD", ifname, netns.path().display());
        let removed = with_netns(self.kernel.namespaces.as_ref(), netns, || {
            macvlan::discard(&self.kernel, ifname);
            Ok(())
        });
        if let Err(e) = removed {
            error!("Failed to roll back {}: {}", ifname, e);
        }
    }

    /// Nothing is verified beyond the arguments being well formed.
    pub fn check(&self, args: &CmdArgs) -> Result<()> {
        debug!("Called CNI CHECK for container {}", args.container_id);
        Ok(())
    }

    /// Remove the egress interface. Succeeds when the namespace or the
    /// interface is already gone.
    pub fn del(&self, args: &CmdArgs) -> Result<()> {
        if args.netns.is_empty() {
            debug!("No network namespace for {}, nothing to clean up", args.container_id);
            return Ok(());
        }
        info!(
            "Called CNI DEL for container {} ({} in {})",
            args.container_id, args.ifname, args.netns
        );

        let netns = match self.kernel.namespaces.open(Path::new(&args.netns)) {
            Ok(netns) => netns,
            Err(e) if e.is_not_found() => {
                info!("Network namespace {} is gone, nothing to clean up", args.netns);
                return Ok(());
            }
            Err(source) => {
                return Err(Error::Namespace {
                    path: args.netns.clone(),
                    source,
                })
            }
        };

        // Delete the interface inside the pod namespace
        with_netns(self.kernel.namespaces.as_ref(), &netns, || {
            match del_link_by_name(self.kernel.netlink.as_ref(), &args.ifname) {
                Ok(()) => {
                    debug!("Deleted interface {}", args.ifname);
                    Ok(())
                }
                Err(e) if e.is_not_found() => {
                    debug!("Interface {} already removed", args.ifname);
                    Ok(())
                }
                Err(e) => Err(Error::configuration(
                    &args.ifname,
                    format!("failed to delete link: {}", e),
                )),
            }
        })
    }

    fn open_netns(&self, path: &str) -> Result<NetNs> {
        self.kernel
            .namespaces
            .open(Path::new(path))
            .map_err(|source| Error::Namespace {
                path: path.to_string(),
                source,
            })
    }
}

/// One IP entry per egress address, all on interface 0. The gateway is
/// only attached to addresses of its own family.
fn build_result(cni_version: &str, interface: Interface, egress: &ResolvedEgress) -> CniResult {
    let mut result = CniResult::new(cni_version);
    let index = result.add_interface(interface);
    let gateway_family = IpFamily::of(&egress.gateway);

    for address in &egress.addresses {
        let family = IpFamily::of_network(address);
        result.add_ip(IPConfig {
            version: family.version().to_string(),
            address: address.to_string(),
            gateway: (family == gateway_family).then(|| egress.gateway.to_string()),
            interface: Some(index),
        });
    }
    result
}
