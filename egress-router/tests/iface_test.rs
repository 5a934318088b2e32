mod common;

use std::time::{Duration, Instant};

use common::{FakeKernel, HOST_NS};
use egress_router::netlink::Netlink;
use egress_router::plugin::iface::{configure_iface, settle_addresses};
use egress_router::types::{IPConfig, Interface, Result as CniResult, Route};
use egress_router::{Error, KernelError};

fn result_for(ifname: &str, ips: &[(&str, Option<&str>)], routes: &[(&str, Option<&str>)]) -> CniResult {
    let mut result = CniResult::new("0.4.0");
    let index = result.add_interface(Interface {
        name: ifname.to_string(),
        mac: None,
        sandbox: None,
    });
    for (address, gateway) in ips {
        result.add_ip(IPConfig {
            version: if address.contains(':') { "6" } else { "4" }.to_string(),
            address: address.to_string(),
            gateway: gateway.map(String::from),
            interface: Some(index),
        });
    }
    for (dst, gw) in routes {
        result.add_route(Route {
            dst: dst.to_string(),
            gw: gw.map(String::from),
        });
    }
    result
}

#[test]
fn test_routes_use_family_gateway_and_tolerate_duplicates() -> Result<(), Box<dyn std::error::Error>> {
    let fake = FakeKernel::new();
    let index = fake.add_link(HOST_NS, "net1", 1500);
    let result = result_for(
        "net1",
        &[("10.1.0.5/24", Some("10.1.0.1")), ("fd00:1::5/64", Some("fd00:1::1"))],
        &[
            ("10.20.0.0/16", None),
            ("10.20.0.0/16", Some("10.1.0.254")),
            ("fd00:20::/64", None),
            ("10.30.0.0/16", Some("10.1.0.254")),
        ],
    );

    configure_iface(&fake.kernel(), "net1", &result)?;

    fake.with_ns(HOST_NS, |state| {
        let link = state.link("net1").unwrap();
        assert!(link.link.up);
        assert_eq!(link.addrs.len(), 2);

        let gateway_of = |dst: &str| {
            state
                .routes
                .iter()
                .find(|r| r.dst == Some(dst.parse().unwrap()))
                .map(|r| (r.gateway, r.link_index))
        };
        // first route for a destination wins
        assert_eq!(gateway_of("10.20.0.0/16"), Some((Some("10.1.0.1".parse().unwrap()), index)));
        assert_eq!(gateway_of("fd00:20::/64"), Some((Some("fd00:1::1".parse().unwrap()), index)));
        assert_eq!(gateway_of("10.30.0.0/16"), Some((Some("10.1.0.254".parse().unwrap()), index)));
    });
    Ok(())
}

#[test]
fn test_route_failure_is_fatal() {
    let fake = FakeKernel::new();
    fake.add_link(HOST_NS, "net1", 1500);
    fake.fail_on("route_add 172.16.0.0/12", KernelError::Other("invalid argument".to_string()));
    let result = result_for("net1", &[("10.1.0.5/24", Some("10.1.0.1"))], &[("172.16.0.0/12", None)]);

    let err = configure_iface(&fake.kernel(), "net1", &result).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert!(err.to_string().contains("172.16.0.0/12"));
}

#[test]
fn test_invalid_route_destination_is_fatal() {
    let fake = FakeKernel::new();
    fake.add_link(HOST_NS, "net1", 1500);
    let result = result_for("net1", &[("10.1.0.5/24", None)], &[("not-a-prefix", None)]);

    let err = configure_iface(&fake.kernel(), "net1", &result).unwrap_err();
    assert!(err.to_string().contains("invalid route destination"));
    assert!(!fake.called("route_add"));
}

#[test]
fn test_interface_index_mismatch_is_fatal() {
    let fake = FakeKernel::new();
    fake.add_link(HOST_NS, "net1", 1500);
    fake.add_link(HOST_NS, "net2", 1500);
    let result = result_for("net2", &[("10.1.0.5/24", None)], &[]);

    let err = configure_iface(&fake.kernel(), "net1", &result).unwrap_err();
    assert!(err.to_string().contains("invalid interface index"));
    assert!(!fake.called("addr_add"));
}

#[test]
fn test_empty_result_is_rejected() {
    let fake = FakeKernel::new();
    fake.add_link(HOST_NS, "net1", 1500);

    let err = configure_iface(&fake.kernel(), "net1", &CniResult::new("0.4.0")).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[test]
fn test_ipv6_enable_tolerates_unreadable_toggle() -> Result<(), Box<dyn std::error::Error>> {
    let fake = FakeKernel::new();
    fake.add_link(HOST_NS, "net1", 1500);
    fake.set_sysctl(HOST_NS, "net/ipv6/conf/lo/disable_ipv6", "1");
    let result = result_for("net1", &[("fd00:1::5/64", None)], &[]);

    // net1 has no toggle to read; lo is still flipped
    configure_iface(&fake.kernel(), "net1", &result)?;
    fake.with_ns(HOST_NS, |state| {
        assert_eq!(state.sysctls["net/ipv6/conf/lo/disable_ipv6"], "0");
        assert!(!state.sysctls.contains_key("net/ipv6/conf/net1/disable_ipv6"));
    });
    Ok(())
}

#[test]
fn test_ipv6_enable_write_failure_is_fatal() {
    let fake = FakeKernel::new();
    fake.add_link(HOST_NS, "net1", 1500);
    fake.set_sysctl(HOST_NS, "net/ipv6/conf/lo/disable_ipv6", "1");
    fake.fail_on("sysctl_set net/ipv6/conf/lo", KernelError::Other("permission denied".to_string()));
    let result = result_for("net1", &[("fd00:1::5/64", None)], &[]);

    let err = configure_iface(&fake.kernel(), "net1", &result).unwrap_err();
    assert!(err.to_string().contains("failed to enable IPv6"));
    assert!(!fake.called("addr_add"));
}

#[test]
fn test_settle_addresses() -> Result<(), Box<dyn std::error::Error>> {
    let fake = FakeKernel::new();
    fake.add_link(HOST_NS, "net1", 1500);
    let link = fake.link_by_name("net1")?;

    fake.addr_add(&link, &"fd00:1::5/64".parse()?)?;
    assert!(settle_addresses(&fake, &link, Duration::from_millis(100))?);

    fake.set_dad_fail(true);
    fake.addr_add(&link, &"fd00:1::6/64".parse()?)?;
    let err = settle_addresses(&fake, &link, Duration::from_millis(100)).unwrap_err();
    assert!(err.to_string().contains("fd00:1::6/64 failed duplicate address detection"));
    Ok(())
}

#[test]
fn test_settle_addresses_ignores_link_local() -> Result<(), Box<dyn std::error::Error>> {
    let fake = FakeKernel::new();
    fake.add_link(HOST_NS, "net1", 1500);
    let link = fake.link_by_name("net1")?;

    fake.addr_add(&link, &"fd00:10::99/64".parse()?)?;
    fake.set_dad_fail(true);
    fake.addr_add(&link, &"fe80::1/64".parse()?)?;

    // a tentative or failed link-local address neither fails nor delays settling
    let started = Instant::now();
    assert!(settle_addresses(&fake, &link, Duration::from_secs(5))?);
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}
