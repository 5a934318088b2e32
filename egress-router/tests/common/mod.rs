//! In-memory kernel shared by the integration tests.
//!
//! Every namespace has its own links, routes, sysctls and firewall rules.
//! Calls are recorded as strings, and any call whose string starts with an
//! injected prefix fails with the injected error.

#![allow(dead_code)]

use ipnetwork::IpNetwork;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use egress_router::nat::Firewall;
use egress_router::netlink::{Addr, IpFamily, Link, LinkSpec, Neighbor, Netlink, Route, RouteFilter};
use egress_router::netns::{Namespaces, NetNs};
use egress_router::sysctl::Sysctl;
use egress_router::{Kernel, KernelError};

pub const HOST_NS: &str = "/proc/1/ns/net";
pub const POD_NS: &str = "/var/run/netns/egress-pod";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    pub link: Link,
    pub addrs: Vec<Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub family: IpFamily,
    pub table: String,
    pub chain: String,
    pub rule: Vec<String>,
}

impl FirewallRule {
    pub fn line(&self) -> String {
        format!("-t {} -A {} {}", self.table, self.chain, self.rule.join(" "))
    }
}

#[derive(Debug, Default)]
pub struct NsState {
    pub links: Vec<FakeLink>,
    pub routes: Vec<Route>,
    pub sysctls: HashMap<String, String>,
    pub rules: Vec<FirewallRule>,
    pub announced: Vec<IpAddr>,
}

impl NsState {
    pub fn link(&self, name: &str) -> Option<&FakeLink> {
        self.links.iter().find(|l| l.link.name == name)
    }

    pub fn link_names(&self) -> Vec<String> {
        self.links.iter().map(|l| l.link.name.clone()).collect()
    }

    pub fn default_routes(&self, family: IpFamily) -> Vec<Route> {
        self.routes
            .iter()
            .filter(|r| r.family == family && r.is_default())
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
pub struct FakeState {
    pub namespaces: HashMap<PathBuf, NsState>,
    pub current: PathBuf,
    pub calls: Vec<String>,
    pub failures: Vec<(String, KernelError)>,
    /// IPv6 addresses fail duplicate address detection when added.
    pub dad_fail: bool,
    next_index: u32,
}

impl FakeState {
    fn ns(&self) -> &NsState {
        &self.namespaces[&self.current]
    }

    fn ns_mut(&mut self) -> &mut NsState {
        let current = self.current.clone();
        self.namespaces.entry(current).or_default()
    }

    /// Record `call` and return the injected error for it, if any.
    fn record(&mut self, call: String) -> Result<(), KernelError> {
        let injected = self
            .failures
            .iter()
            .find(|(prefix, _)| call.starts_with(prefix.as_str()))
            .map(|(_, err)| err.clone());
        self.calls.push(call);
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn find_by_name(&self, name: &str) -> Result<Link, KernelError> {
        self.ns()
            .link(name)
            .map(|l| l.link.clone())
            .ok_or_else(|| KernelError::NotFound(format!("link {}", name)))
    }

    fn find_mut(&mut self, index: u32) -> Result<&mut FakeLink, KernelError> {
        self.ns_mut()
            .links
            .iter_mut()
            .find(|l| l.link.index == index)
            .ok_or_else(|| KernelError::NotFound(format!("link #{}", index)))
    }

    fn new_link(&mut self, name: &str, mtu: u32) -> Link {
        self.next_index += 1;
        Link {
            index: self.next_index,
            name: name.to_string(),
            mtu,
            hardware_addr: Some(format!("0a:58:00:00:00:{:02x}", self.next_index)),
            up: false,
        }
    }
}

/// Handle to the shared fake kernel; clones share state.
#[derive(Debug, Clone)]
pub struct FakeKernel(Rc<RefCell<FakeState>>);

impl FakeKernel {
    pub fn new() -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(PathBuf::from(HOST_NS), NsState::default());
        Self(Rc::new(RefCell::new(FakeState {
            namespaces,
            current: PathBuf::from(HOST_NS),
            calls: Vec::new(),
            failures: Vec::new(),
            dad_fail: false,
            next_index: 0,
        })))
    }

    /// Host with `eth0` (MTU 1500) carrying the default route, and a pod
    /// namespace with its own `eth0` and default routes for both families.
    pub fn standard() -> Self {
        let kernel = Self::new();
        let host_eth0 = kernel.add_link(HOST_NS, "eth0", 1500);
        kernel.add_route(
            HOST_NS,
            Route {
                family: IpFamily::V4,
                dst: None,
                gateway: Some("192.168.12.1".parse().unwrap()),
                link_index: host_eth0,
            },
        );

        kernel.add_netns(POD_NS);
        kernel.add_link(POD_NS, "lo", 65536);
        let pod_eth0 = kernel.add_link(POD_NS, "eth0", 1450);
        kernel.add_route(
            POD_NS,
            Route {
                family: IpFamily::V4,
                dst: None,
                gateway: Some("10.128.0.1".parse().unwrap()),
                link_index: pod_eth0,
            },
        );
        kernel.add_route(
            POD_NS,
            Route {
                family: IpFamily::V4,
                dst: Some("10.128.0.0/23".parse().unwrap()),
                gateway: None,
                link_index: pod_eth0,
            },
        );
        kernel.add_route(
            POD_NS,
            Route {
                family: IpFamily::V6,
                dst: None,
                gateway: Some("fd01::1".parse().unwrap()),
                link_index: pod_eth0,
            },
        );
        kernel
    }

    pub fn kernel(&self) -> Kernel {
        Kernel {
            netlink: Box::new(self.clone()),
            sysctl: Box::new(self.clone()),
            firewall: Box::new(self.clone()),
            namespaces: Box::new(self.clone()),
        }
    }

    pub fn add_netns(&self, path: &str) {
        self.0
            .borrow_mut()
            .namespaces
            .insert(PathBuf::from(path), NsState::default());
    }

    pub fn remove_netns(&self, path: &str) {
        self.0.borrow_mut().namespaces.remove(Path::new(path));
    }

    pub fn add_link(&self, ns: &str, name: &str, mtu: u32) -> u32 {
        let mut state = self.0.borrow_mut();
        let mut link = state.new_link(name, mtu);
        link.up = true;
        let index = link.index;
        state
            .namespaces
            .get_mut(Path::new(ns))
            .expect("namespace exists")
            .links
            .push(FakeLink {
                link,
                addrs: Vec::new(),
            });
        index
    }

    pub fn add_route(&self, ns: &str, route: Route) {
        self.0
            .borrow_mut()
            .namespaces
            .get_mut(Path::new(ns))
            .expect("namespace exists")
            .routes
            .push(route);
    }

    pub fn set_sysctl(&self, ns: &str, key: &str, value: &str) {
        self.0
            .borrow_mut()
            .namespaces
            .get_mut(Path::new(ns))
            .expect("namespace exists")
            .sysctls
            .insert(key.to_string(), value.to_string());
    }

    /// Fail every call whose recorded form starts with `prefix`.
    pub fn fail_on(&self, prefix: &str, err: KernelError) {
        self.0.borrow_mut().failures.push((prefix.to_string(), err));
    }

    pub fn set_dad_fail(&self, fail: bool) {
        self.0.borrow_mut().dad_fail = fail;
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.borrow().calls.clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.0.borrow().calls.iter().any(|c| c.starts_with(prefix))
    }

    pub fn current_ns(&self) -> PathBuf {
        self.0.borrow().current.clone()
    }

    /// Inspect one namespace.
    pub fn with_ns<T>(&self, ns: &str, f: impl FnOnce(&NsState) -> T) -> T {
        let state = self.0.borrow();
        f(&state.namespaces[Path::new(ns)])
    }
}

impl Netlink for FakeKernel {
    fn link_by_name(&self, name: &str) -> Result<Link, KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("link_by_name {}", name))?;
        state.find_by_name(name)
    }

    fn link_by_index(&self, index: u32) -> Result<Link, KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("link_by_index {}", index))?;
        state
            .ns()
            .links
            .iter()
            .find(|l| l.link.index == index)
            .map(|l| l.link.clone())
            .ok_or_else(|| KernelError::NotFound(format!("link #{}", index)))
    }

    fn link_add(&self, spec: &LinkSpec) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("link_add {}", spec.name))?;
        if !state.ns().links.iter().any(|l| l.link.index == spec.parent_index) {
            return Err(KernelError::NotFound(format!("parent #{}", spec.parent_index)));
        }

        let target = spec.netns.clone().unwrap_or_else(|| state.current.clone());
        let exists = state
            .namespaces
            .get(&target)
            .ok_or_else(|| KernelError::NotFound(format!("netns {}", target.display())))?
            .link(&spec.name)
            .is_some();
        if exists {
            return Err(KernelError::AlreadyExists(format!("link {}", spec.name)));
        }

        let link = state.new_link(&spec.name, spec.mtu);
        if let Some(ns) = state.namespaces.get_mut(&target) {
            ns.links.push(FakeLink {
                link,
                addrs: Vec::new(),
            });
        }
        Ok(())
    }

    fn link_set_up(&self, link: &Link) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("link_set_up {}", link.name))?;
        state.find_mut(link.index)?.link.up = true;
        Ok(())
    }

    fn link_set_name(&self, link: &Link, name: &str) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("link_set_name {} {}", link.name, name))?;
        if state.ns().link(name).is_some() {
            return Err(KernelError::AlreadyExists(format!("link {}", name)));
        }
        state.find_mut(link.index)?.link.name = name.to_string();
        Ok(())
    }

    fn link_del(&self, link: &Link) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("link_del {}", link.name))?;
        let ns = state.ns_mut();
        let before = ns.links.len();
        ns.links.retain(|l| l.link.index != link.index);
        if ns.links.len() == before {
            return Err(KernelError::NotFound(format!("link {}", link.name)));
        }
        ns.routes.retain(|r| r.link_index != link.index);
        Ok(())
    }

    fn addr_list(&self, link: &Link, family: Option<IpFamily>) -> Result<Vec<Addr>, KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("addr_list {}", link.name))?;
        let addrs = state.find_mut(link.index)?.addrs.clone();
        Ok(addrs
            .into_iter()
            .filter(|a| family.map_or(true, |f| IpFamily::of_network(&a.network) == f))
            .collect())
    }

    fn addr_add(&self, link: &Link, addr: &IpNetwork) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("addr_add {} {}", link.name, addr))?;
        let dad_failed = state.dad_fail && addr.is_ipv6();
        let fake = state.find_mut(link.index)?;
        if fake.addrs.iter().any(|a| a.network == *addr) {
            return Err(KernelError::AlreadyExists(format!("address {}", addr)));
        }
        let mut entry = Addr::new(*addr);
        entry.dad_failed = dad_failed;
        entry.tentative = dad_failed;
        fake.addrs.push(entry);
        Ok(())
    }

    fn addr_del(&self, link: &Link, addr: &IpNetwork) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("addr_del {} {}", link.name, addr))?;
        let fake = state.find_mut(link.index)?;
        let before = fake.addrs.len();
        fake.addrs.retain(|a| a.network != *addr);
        if fake.addrs.len() == before {
            return Err(KernelError::NotFound(format!("address {}", addr)));
        }
        Ok(())
    }

    fn route_add(&self, route: &Route) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("route_add {}", route))?;
        let ns = state.ns_mut();
        if ns
            .routes
            .iter()
            .any(|r| r.family == route.family && r.dst == route.dst)
        {
            return Err(KernelError::AlreadyExists(format!("route {}", route)));
        }
        ns.routes.push(route.clone());
        Ok(())
    }

    fn route_del(&self, route: &Route) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("route_del {}", route))?;
        let ns = state.ns_mut();
        let before = ns.routes.len();
        ns.routes.retain(|r| r != route);
        if ns.routes.len() == before {
            return Err(KernelError::NotFound(format!("route {}", route)));
        }
        Ok(())
    }

    fn route_list_filtered(
        &self,
        family: Option<IpFamily>,
        filter: &RouteFilter,
    ) -> Result<Vec<Route>, KernelError> {
        let mut state = self.0.borrow_mut();
        state.record("route_list".to_string())?;
        Ok(state
            .ns()
            .routes
            .iter()
            .filter(|r| family.map_or(true, |f| r.family == f) && filter.matches(r))
            .cloned()
            .collect())
    }

    fn neigh_list(&self, link: &Link, _family: Option<IpFamily>) -> Result<Vec<Neighbor>, KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("neigh_list {}", link.name))?;
        Ok(Vec::new())
    }

    fn neigh_announce(&self, link: &Link, addr: IpAddr) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("neigh_announce {} {}", link.name, addr))?;
        state.ns_mut().announced.push(addr);
        Ok(())
    }
}

impl Sysctl for FakeKernel {
    fn get(&self, key: &str) -> Result<String, KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("sysctl_get {}", key))?;
        state
            .ns()
            .sysctls
            .get(key)
            .cloned()
            .ok_or_else(|| KernelError::NotFound(format!("sysctl {}", key)))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("sysctl_set {} {}", key, value))?;
        state
            .ns_mut()
            .sysctls
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl Firewall for FakeKernel {
    fn append_unique(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("firewall {} -t {} -A {} {}", family, table, chain, rule.join(" ")))?;
        let entry = FirewallRule {
            family,
            table: table.to_string(),
            chain: chain.to_string(),
            rule: rule.to_vec(),
        };
        let ns = state.ns_mut();
        if !ns.rules.contains(&entry) {
            ns.rules.push(entry);
        }
        Ok(())
    }
}

impl Namespaces for FakeKernel {
    fn current(&self) -> Result<NetNs, KernelError> {
        let mut state = self.0.borrow_mut();
        state.record("ns_current".to_string())?;
        Ok(NetNs::unbacked(state.current.clone()))
    }

    fn open(&self, path: &Path) -> Result<NetNs, KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("ns_open {}", path.display()))?;
        if !state.namespaces.contains_key(path) {
            return Err(KernelError::NotFound(format!("netns {}", path.display())));
        }
        Ok(NetNs::unbacked(path))
    }

    fn enter(&self, ns: &NetNs) -> Result<(), KernelError> {
        let mut state = self.0.borrow_mut();
        state.record(format!("ns_enter {}", ns.path().display()))?;
        if !state.namespaces.contains_key(ns.path()) {
            return Err(KernelError::NotFound(format!("netns {}", ns.path().display())));
        }
        state.current = ns.path().to_path_buf();
        Ok(())
    }
}
