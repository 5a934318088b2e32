use tracing::debug;

use super::Firewall;
use crate::error::KernelError;
use crate::netlink::{run_tool, IpFamily};

/// [`Firewall`] backed by the `iptables` and `ip6tables` tools.
#[derive(Debug, Clone, Default)]
pub struct Iptables;

impl Iptables {
    fn binary(family: IpFamily) -> &'static str {
        match family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    fn command(table: &str, action: &str, chain: &str, rule: &[String]) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            table.to_string(),
            action.to_string(),
            chain.to_string(),
        ];
        args.extend(rule.iter().cloned());
        args
    }
}

impl Firewall for Iptables {
    fn append_unique(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<(), KernelError> {
        let binary = Self::binary(family);

        // -C exits non-zero when the rule is absent
        if run_tool(binary, &Self::command(table, "-C", chain, rule)).is_ok() {
            debug!("{} rule already present in {}/{}: {}", binary, table, chain, rule.join(" "));
            return Ok(());
        }

        run_tool(binary, &Self::command(table, "-A", chain, rule)).map(drop)
    }
}
