use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::debug;

use super::{
    run_tool, Addr, IpFamily, Link, LinkKind, LinkSpec, Neighbor, Netlink, Route, RouteFilter,
};
use crate::error::KernelError;

/// [`Netlink`] backed by the iproute2 `ip` tool and its JSON output.
///
/// `ip` runs as a child of the calling thread and therefore operates in
/// whichever network namespace that thread has entered.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    binary: String,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            binary: "ip".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpLinkJson {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpAddrJson {
    #[serde(default)]
    addr_info: Vec<AddrInfoJson>,
}

#[derive(Debug, Deserialize)]
struct AddrInfoJson {
    #[serde(default)]
    local: Option<IpAddr>,
    #[serde(default)]
    prefixlen: u8,
    #[serde(default)]
    tentative: bool,
    #[serde(default)]
    dadfailed: bool,
}

#[derive(Debug, Deserialize)]
struct IpRouteJson {
    dst: String,
    #[serde(default)]
    gateway: Option<IpAddr>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpNeighJson {
    dst: IpAddr,
    #[serde(default)]
    lladdr: Option<String>,
    #[serde(default)]
    state: Vec<String>,
}

fn decode<T: for<'de> Deserialize<'de>>(op: &str, json: &str) -> Result<Vec<T>, KernelError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json)
        .map_err(|e| KernelError::Other(format!("failed to decode output of {}: {}", op, e)))
}

pub(crate) fn parse_links(json: &str) -> Result<Vec<Link>, KernelError> {
    let links: Vec<IpLinkJson> = decode("ip link show", json)?;
    Ok(links
        .into_iter()
        .map(|l| Link {
            index: l.ifindex,
            up: l.flags.iter().any(|f| f == "UP"),
            name: l.ifname,
            mtu: l.mtu,
            hardware_addr: l.address,
        })
        .collect())
}

pub(crate) fn parse_addrs(json: &str) -> Result<Vec<Addr>, KernelError> {
    let entries: Vec<IpAddrJson> = decode("ip addr show", json)?;
    let mut addrs = Vec::new();
    for info in entries.into_iter().flat_map(|e| e.addr_info) {
        let Some(local) = info.local else { continue };
        let network = IpNetwork::new(local, info.prefixlen)
            .map_err(|e| KernelError::Other(format!("invalid address {}/{}: {}", local, info.prefixlen, e)))?;
        addrs.push(Addr {
            network,
            tentative: info.tentative,
            dad_failed: info.dadfailed,
        });
    }
    Ok(addrs)
}

pub(crate) fn parse_route_dst(dst: &str, family: IpFamily) -> Result<Option<IpNetwork>, KernelError> {
    if dst == "default" {
        return Ok(None);
    }
    let invalid = |e: &dyn std::fmt::Display| KernelError::Other(format!("invalid route destination {:?}: {}", dst, e));
    if dst.contains('/') {
        return dst.parse::<IpNetwork>().map(Some).map_err(|e| invalid(&e));
    }
    let ip: IpAddr = dst.parse().map_err(|e| invalid(&e))?;
    IpNetwork::new(ip, family.host_prefix())
        .map(Some)
        .map_err(|e| invalid(&e))
}

/// Decode `ip -j route show`, resolving device names through `indexes`.
/// Routes without an output device and non-unicast routes are skipped.
pub(crate) fn parse_routes(
    json: &str,
    family: IpFamily,
    indexes: &HashMap<String, u32>,
) -> Result<Vec<Route>, KernelError> {
    let entries: Vec<IpRouteJson> = decode("ip route show", json)?;
    let mut routes = Vec::new();
    for entry in entries {
        if entry.kind.as_deref().is_some_and(|k| k != "unicast") {
            continue;
        }
        let Some(link_index) = entry.dev.as_ref().and_then(|dev| indexes.get(dev)) else {
            continue;
        };
        routes.push(Route {
            family,
            dst: parse_route_dst(&entry.dst, family)?,
            gateway: entry.gateway,
            link_index: *link_index,
        });
    }
    Ok(routes)
}

pub(crate) fn parse_neighbors(json: &str) -> Result<Vec<Neighbor>, KernelError> {
    let entries: Vec<IpNeighJson> = decode("ip neigh show", json)?;
    Ok(entries
        .into_iter()
        .map(|n| Neighbor {
            ip: n.dst,
            lladdr: n.lladdr,
            state: n.state,
        })
        .collect())
}

fn family_flag(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "-4",
        IpFamily::V6 => "-6",
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

impl IpRoute2 {
    fn ip(&self, args: Vec<String>) -> Result<String, KernelError> {
        debug!("{} {}", self.binary, args.join(" "));
        run_tool(&self.binary, &args)
    }

    fn links(&self) -> Result<Vec<Link>, KernelError> {
        parse_links(&self.ip(strings(&["-j", "link", "show"]))?)
    }

    fn route_args(&self, action: &str, route: &Route) -> Result<Vec<String>, KernelError> {
        let dev = self.link_by_index(route.link_index)?;
        let mut args = strings(&[family_flag(route.family), "route", action]);
        args.push(match &route.dst {
            Some(dst) => dst.to_string(),
            None => "default".to_string(),
        });
        if let Some(gw) = &route.gateway {
            args.push("via".to_string());
            args.push(gw.to_string());
        }
        args.push("dev".to_string());
        args.push(dev.name);
        Ok(args)
    }
}

impl Netlink for IpRoute2 {
    fn link_by_name(&self, name: &str) -> Result<Link, KernelError> {
        let out = self.ip(strings(&["-j", "link", "show", "dev", name]))?;
        parse_links(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| KernelError::NotFound(format!("link {}", name)))
    }

    fn link_by_index(&self, index: u32) -> Result<Link, KernelError> {
        self.links()?
            .into_iter()
            .find(|l| l.index == index)
            .ok_or_else(|| KernelError::NotFound(format!("link #{}", index)))
    }

    fn link_add(&self, spec: &LinkSpec) -> Result<(), KernelError> {
        let parent = self.link_by_index(spec.parent_index)?;
        let mut args = strings(&["link", "add", "link", &parent.name, "name", &spec.name]);
        args.push("mtu".to_string());
        args.push(spec.mtu.to_string());
        if let Some(netns) = &spec.netns {
            args.push("netns".to_string());
            args.push(netns.display().to_string());
        }
        match &spec.kind {
            LinkKind::Macvlan { mode } => {
                args.extend(strings(&["type", "macvlan", "mode", mode.as_str()]));
            }
        }
        self.ip(args).map(drop)
    }

    fn link_set_up(&self, link: &Link) -> Result<(), KernelError> {
        self.ip(strings(&["link", "set", "dev", &link.name, "up"])).map(drop)
    }

    fn link_set_name(&self, link: &Link, name: &str) -> Result<(), KernelError> {
        self.ip(strings(&["link", "set", "dev", &link.name, "name", name]))
            .map(drop)
    }

    fn link_del(&self, link: &Link) -> Result<(), KernelError> {
        self.ip(strings(&["link", "del", "dev", &link.name])).map(drop)
    }

    fn addr_list(&self, link: &Link, family: Option<IpFamily>) -> Result<Vec<Addr>, KernelError> {
        let mut args = strings(&["-j"]);
        if let Some(family) = family {
            args.push(family_flag(family).to_string());
        }
        args.extend(strings(&["addr", "show", "dev", &link.name]));
        parse_addrs(&self.ip(args)?)
    }

    fn addr_add(&self, link: &Link, addr: &IpNetwork) -> Result<(), KernelError> {
        self.ip(strings(&["addr", "add", &addr.to_string(), "dev", &link.name]))
            .map(drop)
    }

    fn addr_del(&self, link: &Link, addr: &IpNetwork) -> Result<(), KernelError> {
        self.ip(strings(&["addr", "del", &addr.to_string(), "dev", &link.name]))
            .map(drop)
    }

    fn route_add(&self, route: &Route) -> Result<(), KernelError> {
        let args = self.route_args("add", route)?;
        self.ip(args).map(drop)
    }

    fn route_del(&self, route: &Route) -> Result<(), KernelError> {
        let args = self.route_args("del", route)?;
        self.ip(args).map(drop)
    }

    fn route_list_filtered(
        &self,
        family: Option<IpFamily>,
        filter: &RouteFilter,
    ) -> Result<Vec<Route>, KernelError> {
        let indexes: HashMap<String, u32> = self
            .links()?
            .into_iter()
            .map(|l| (l.name, l.index))
            .collect();
        let families = match family {
            Some(family) => vec![family],
            None => vec![IpFamily::V4, IpFamily::V6],
        };

        let mut routes = Vec::new();
        for family in families {
            let out = self.ip(strings(&["-j", family_flag(family), "route", "show"]))?;
            routes.extend(
                parse_routes(&out, family, &indexes)?
                    .into_iter()
                    .filter(|r| filter.matches(r)),
            );
        }
        Ok(routes)
    }

    fn neigh_list(&self, link: &Link, family: Option<IpFamily>) -> Result<Vec<Neighbor>, KernelError> {
        let mut args = strings(&["-j"]);
        if let Some(family) = family {
            args.push(family_flag(family).to_string());
        }
        args.extend(strings(&["neigh", "show", "dev", &link.name]));
        parse_neighbors(&self.ip(args)?)
    }

    fn neigh_announce(&self, link: &Link, addr: IpAddr) -> Result<(), KernelError> {
        match addr {
            IpAddr::V4(v4) => run_tool(
                "arping",
                &strings(&["-q", "-U", "-c", "1", "-I", &link.name, &v4.to_string()]),
            ),
            IpAddr::V6(v6) => Err(KernelError::Other(format!(
                "unsolicited neighbor advertisement for {} is not supported",
                v6
            ))),
        }
        .map(drop)
    }
}
