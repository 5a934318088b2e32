//! Address and route programming inside the pod's network namespace.

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::Kernel;
use crate::config::ResolvedEgress;
use crate::error::{Error, Result};
use crate::netlink::{IpFamily, Link, Netlink, Route};
use crate::sysctl::{disable_ipv6_key, forwarding_key, Sysctl};
use crate::types::Result as CniResult;

const LOOPBACK: &str = "lo";

/// How long IPv6 addresses may stay tentative before routes are added anyway.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Apply the addresses and routes of `result` to `ifname`.
///
/// Only IPs whose interface index points at `ifname` are accepted. Routes
/// without a gateway use the first gateway seen for their family. A route
/// that already exists is kept.
pub fn configure_iface(kernel: &Kernel, ifname: &str, result: &CniResult) -> Result<()> {
    let netlink = kernel.netlink.as_ref();

    if result.interfaces().is_empty() {
        return Err(Error::configuration(ifname, "no interfaces to configure"));
    }

    let link = netlink
        .link_by_name(ifname)
        .map_err(|e| Error::configuration(ifname, format!("failed to lookup {:?}: {}", ifname, e)))?;
    netlink
        .link_set_up(&link)
        .map_err(|e| Error::configuration(ifname, format!("failed to set {:?} UP: {}", ifname, e)))?;

    let mut v4_gateway: Option<IpAddr> = None;
    let mut v6_gateway: Option<IpAddr> = None;
    let mut ipv6_enabled = false;

    for ipc in result.ips() {
        let Some(index) = ipc.interface else { continue };
        if result.interfaces().get(index).map(|i| i.name.as_str()) != Some(ifname) {
            return Err(Error::configuration(
                ifname,
                format!("failed to add IP addr {}: invalid interface index {}", ipc.address, index),
            ));
        }

        let address: IpNetwork = ipc.address.parse().map_err(|e| {
            Error::configuration(ifname, format!("invalid address {:?}: {}", ipc.address, e))
        })?;

        if !ipv6_enabled && address.is_ipv6() {
            enable_ipv6(kernel.sysctl.as_ref(), ifname)?;
            ipv6_enabled = true;
        }

        netlink.addr_add(&link, &address).map_err(|e| {
            Error::configuration(ifname, format!("failed to add IP addr {}: {}", address, e))
        })?;
        debug!("Added address {} to {}", address, ifname);

        if let Some(gateway) = ipc.gateway.as_deref() {
            let gateway: IpAddr = gateway.parse().map_err(|e| {
                Error::configuration(ifname, format!("invalid gateway {:?}: {}", gateway, e))
            })?;
            let slot = match gateway {
                IpAddr::V4(_) => &mut v4_gateway,
                IpAddr::V6(_) => &mut v6_gateway,
            };
            slot.get_or_insert(gateway);
        }
    }

    if v6_gateway.is_some() && !settle_addresses(netlink, &link, SETTLE_TIMEOUT)? {
        warn!("IPv6 addresses on {} still tentative after {:?}", ifname, SETTLE_TIMEOUT);
    }

    for r in result.routes() {
        let dst: IpNetwork = r.dst.parse().map_err(|e| {
            Error::configuration(ifname, format!("invalid route destination {:?}: {}", r.dst, e))
        })?;
        let family = IpFamily::of_network(&dst);
        let gateway = match r.gw.as_deref() {
            Some(gw) => Some(gw.parse::<IpAddr>().map_err(|e| {
                Error::configuration(ifname, format!("invalid route gateway {:?}: {}", gw, e))
            })?),
            None => match family {
                IpFamily::V4 => v4_gateway,
                IpFamily::V6 => v6_gateway,
            },
        };

        let route = Route {
            family,
            dst: Some(dst),
            gateway,
            link_index: link.index,
        };
        match netlink.route_add(&route) {
            Ok(()) => debug!("Added route {}", route),
            Err(e) if e.is_already_exists() => debug!("Route {} already present, keeping it", route),
            Err(e) => {
                return Err(Error::configuration(
                    ifname,
                    format!("failed to add route '{}': {}", route, e),
                ))
            }
        }
    }

    Ok(())
}

/// Clear `disable_ipv6` on loopback and `ifname` where it is set.
fn enable_ipv6(sysctl: &dyn Sysctl, ifname: &str) -> Result<()> {
    for iface in [LOOPBACK, ifname] {
        let key = disable_ipv6_key(iface);
        let value = match sysctl.get(&key) {
            Ok(value) => value,
            Err(e) => {
                warn!("Unable to read sysctl value {}: {}", key, e);
                continue;
            }
        };
        if value == "0" {
            continue;
        }

        sysctl.set(&key, "0").map_err(|e| {
            Error::configuration(
                iface,
                format!("failed to enable IPv6 ({}={}): {}", key, value, e),
            )
        })?;
        debug!("Enabled IPv6 on {}", iface);
    }
    Ok(())
}

/// Wait until no global IPv6 address on `link` is tentative. Returns
/// `false` on timeout; an address that failed duplicate address detection
/// is an error. Link-local addresses are not waited for.
pub fn settle_addresses(netlink: &dyn Netlink, link: &Link, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let addrs: Vec<_> = netlink
            .addr_list(link, Some(IpFamily::V6))
            .map_err(|e| {
                Error::configuration(&link.name, format!("failed to list addresses: {}", e))
            })?
            .into_iter()
            .filter(|a| !is_link_local(a.network.ip()))
            .collect();

        if let Some(failed) = addrs.iter().find(|a| a.dad_failed) {
            return Err(Error::configuration(
                &link.name,
                format!("{} failed duplicate address detection", failed.network),
            ));
        }
        if !addrs.iter().any(|a| a.tentative) {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        thread::sleep(SETTLE_POLL_INTERVAL);
    }
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        // fe80::/10
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
        IpAddr::V4(v4) => v4.is_link_local(),
    }
}

/// Point all egress traffic of the namespace at the egress gateway through
/// `link`: host route to the gateway, forwarding on, default routes on
/// `primary_iface` removed, new default route via the gateway.
pub fn install_egress_routes(
    kernel: &Kernel,
    link: &Link,
    egress: &ResolvedEgress,
    primary_iface: &str,
) -> Result<()> {
    let netlink = kernel.netlink.as_ref();
    let family = egress.family();
    let gateway = egress.gateway;

    // Host route so the gateway is reachable on-link
    let host = IpNetwork::new(gateway, family.host_prefix())
        .map_err(|e| Error::configuration(&link.name, format!("invalid gateway {}: {}", gateway, e)))?;
    let gateway_route = Route {
        family,
        dst: Some(host),
        gateway: None,
        link_index: link.index,
    };
    netlink.route_add(&gateway_route).map_err(|e| {
        Error::configuration(&link.name, format!("failed to add route to gateway {}: {}", gateway, e))
    })?;
    debug!("Added {} route to gateway {} on {}", family, gateway, link.name);

    kernel.sysctl.set(forwarding_key(family), "1").map_err(|e| {
        Error::configuration(&link.name, format!("failed to enable {} forwarding: {}", family, e))
    })?;

    // Drop the pod's own default routes
    let existing = netlink.link_by_name(primary_iface).map_err(|e| {
        Error::configuration(primary_iface, format!("couldn't get interface: {}", e))
    })?;
    let defaults = netlink.route_list(&existing, family).map_err(|e| {
        Error::configuration(primary_iface, format!("failed to list routes: {}", e))
    })?;
    for route in defaults.into_iter().filter(Route::is_default) {
        netlink.route_del(&route).map_err(|e| {
            Error::configuration(
                primary_iface,
                format!("failed to delete existing default route {}: {}", route, e),
            )
        })?;
        debug!("Deleted default route {}", route);
    }

    let default_route = Route {
        family,
        dst: None,
        gateway: Some(gateway),
        link_index: link.index,
    };
    match netlink.route_add(&default_route) {
        Ok(()) => debug!("Added new default route with gateway {}", gateway),
        Err(e) if e.is_already_exists() => debug!("Use existing route with gateway {}", gateway),
        Err(e) => {
            return Err(Error::configuration(
                &link.name,
                format!("failed to add new default route, gw {}: {}", gateway, e),
            ))
        }
    }

    Ok(())
}

/// Send a gratuitous ARP for each IPv4 address on `link`. Best-effort.
/// IPv6 neighbors learn the address from the router's own solicitations.
pub fn announce_addresses(netlink: &dyn Netlink, link: &Link, addresses: &[IpNetwork]) {
    for address in addresses {
        if address.is_ipv6() {
            debug!("Skipping announcement of {} on {}", address.ip(), link.name);
            continue;
        }
        if let Err(e) = netlink.neigh_announce(link, address.ip()) {
            warn!("Failed to announce {} on {}: {}", address.ip(), link.name, e);
        }
    }
}
