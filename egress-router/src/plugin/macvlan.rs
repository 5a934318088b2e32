use tracing::{debug, warn};
use uuid::Uuid;

use super::Kernel;
use crate::config::ResolvedMacvlan;
use crate::error::{Error, Result};
use crate::netlink::{del_link_by_name, LinkKind, LinkSpec};
use crate::netns::{with_netns, NetNs};
use crate::sysctl::proxy_arp_key;
use crate::types::Interface;

/// Random name the link carries until it is renamed inside the target
/// namespace, so it cannot collide with host interfaces.
pub fn transient_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("mv{}", &id[..8])
}

/// Remove a link after a failed step. Errors are logged only, since the
/// caller is already failing.
pub(crate) fn discard(kernel: &Kernel, name: &str) {
    match del_link_by_name(kernel.netlink.as_ref(), name) {
        Ok(()) => debug!("Removed interface {} after failure", name),
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!("Failed to remove interface {} after failure: {}", name, e),
    }
}

/// Create a macvlan on the configured master directly inside `netns`,
/// enable proxy ARP on it and rename it to `ifname`.
///
/// On error no link created here is left behind.
pub fn create_macvlan(
    kernel: &Kernel,
    args: &ResolvedMacvlan,
    ifname: &str,
    netns: &NetNs,
) -> Result<Interface> {
    // Get master interface
    let master = kernel.netlink.link_by_name(&args.master).map_err(|e| {
        Error::provisioning(ifname, format!("failed to lookup master {:?}: {}", args.master, e))
    })?;

    // Create the macvlan directly in the target namespace
    let tmp_name = transient_name();
    let spec = LinkSpec {
        name: tmp_name.clone(),
        parent_index: master.index,
        mtu: args.mtu,
        kind: LinkKind::Macvlan { mode: args.mode },
        netns: Some(netns.path().to_path_buf()),
    };
    kernel
        .netlink
        .link_add(&spec)
        .map_err(|e| Error::provisioning(ifname, format!("failed to create macvlan: {}", e)))?;
    debug!(
        "Created macvlan interface {} on {} (mode {}, mtu {})",
        tmp_name, args.master, args.mode, args.mtu
    );

    with_netns(kernel.namespaces.as_ref(), netns, || {
        let mut current = tmp_name.clone();
        let outcome = finish_in_netns(kernel, &tmp_name, ifname, &mut current);
        if outcome.is_err() {
            discard(kernel, &current);
        }
        let link = outcome?;

        Ok(Interface {
            name: link.name,
            mac: link.hardware_addr,
            sandbox: Some(netns.path().display().to_string()),
        })
    })
}

fn finish_in_netns(
    kernel: &Kernel,
    tmp_name: &str,
    ifname: &str,
    current: &mut String,
) -> Result<crate::netlink::Link> {
    kernel
        .sysctl
        .set(&proxy_arp_key(tmp_name), "1")
        .map_err(|e| {
            Error::provisioning(
                ifname,
                format!("failed to set proxy_arp on newly added interface {:?}: {}", tmp_name, e),
            )
        })?;

    // Rename interface to requested name
    let link = kernel
        .netlink
        .link_by_name(tmp_name)
        .map_err(|e| Error::provisioning(ifname, format!("failed to lookup {:?}: {}", tmp_name, e)))?;
    kernel
        .netlink
        .link_set_name(&link, ifname)
        .map_err(|e| Error::provisioning(ifname, format!("failed to rename macvlan to {:?}: {}", ifname, e)))?;
    *current = ifname.to_string();
    debug!("Renamed macvlan {} to {:?}", tmp_name, ifname);

    // Re-read for the final MAC address
    kernel
        .netlink
        .link_by_name(ifname)
        .map_err(|e| Error::provisioning(ifname, format!("failed to refetch macvlan {:?}: {}", ifname, e)))
}
