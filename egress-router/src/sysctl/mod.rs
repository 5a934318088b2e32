//! Kernel parameter toggles.
//!
//! Keys use the slash form (`net/ipv4/conf/net1/proxy_arp`) so interface
//! names containing dots stay a single path component.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::KernelError;

pub fn proxy_arp_key(ifname: &str) -> String {
    format!("net/ipv4/conf/{}/proxy_arp", ifname)
}

pub fn disable_ipv6_key(ifname: &str) -> String {
    format!("net/ipv6/conf/{}/disable_ipv6", ifname)
}

pub fn forwarding_key(family: crate::netlink::IpFamily) -> &'static str {
    match family {
        crate::netlink::IpFamily::V4 => "net/ipv4/ip_forward",
        crate::netlink::IpFamily::V6 => "net/ipv6/conf/all/forwarding",
    }
}

/// Read and write kernel parameters.
pub trait Sysctl {
    fn get(&self, key: &str) -> Result<String, KernelError>;
    fn set(&self, key: &str, value: &str) -> Result<(), KernelError>;
}

/// [`Sysctl`] over `/proc/sys`. The files reflect the network namespace of
/// the calling thread.
#[derive(Debug, Clone)]
pub struct ProcSysctl {
    root: PathBuf,
}

impl Default for ProcSysctl {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc/sys"),
        }
    }
}

impl ProcSysctl {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

fn io_error(op: String, err: std::io::Error) -> KernelError {
    match err.kind() {
        ErrorKind::NotFound => KernelError::NotFound(op),
        _ => KernelError::Other(format!("{}: {}", op, err)),
    }
}

impl Sysctl for ProcSysctl {
    fn get(&self, key: &str) -> Result<String, KernelError> {
        fs::read_to_string(self.path(key))
            .map(|v| v.trim().to_string())
            .map_err(|e| io_error(format!("sysctl read {}", key), e))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KernelError> {
        let path = self.path(key);
        if !path.exists() {
            return Err(KernelError::NotFound(format!("sysctl {}", key)));
        }
        fs::write(&path, value).map_err(|e| io_error(format!("sysctl write {}={}", key, value), e))?;
        tracing::debug!("sysctl {}={}", key, value);
        Ok(())
    }
}
