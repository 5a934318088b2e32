//! IP overrides stored in a cluster ConfigMap.
//!
//! A ConfigMap referenced by `ipConfig` carries either an `ip` key (one
//! [`EgressConfig`] as JSON) or a `podIP` key (a JSON map from
//! `namespace/name` to [`EgressConfig`]), never both. ADD and DEL do not
//! consult it; it is exposed for callers that resolve addressing before
//! invoking the plugin.

use std::collections::HashMap;
use tracing::debug;

use super::{EgressConfig, IpConfigRef};
use crate::error::{Error, Result};

/// Read access to ConfigMap data.
pub trait ConfigMapSource {
    fn config_map(&self, namespace: &str, name: &str) -> Result<HashMap<String, String>>;
}

/// Addressing loaded from a ConfigMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpOverride {
    Ip(EgressConfig),
    PodIp(HashMap<String, EgressConfig>),
}

impl IpOverride {
    /// Egress settings that apply to the pod identified by `pod_key`.
    pub fn for_pod(&self, pod_key: &str) -> Option<&EgressConfig> {
        match self {
            Self::Ip(ip) => Some(ip),
            Self::PodIp(by_pod) => by_pod.get(pod_key),
        }
    }
}

impl EgressConfig {
    /// Replace every non-empty field of `overrides` into `self`.
    pub fn apply_overrides(&mut self, overrides: &EgressConfig) {
        if !overrides.addresses.is_empty() {
            self.addresses = overrides.addresses.clone();
        }
        if !overrides.gateway.is_empty() {
            self.gateway = overrides.gateway.clone();
        }
        if !overrides.destinations.is_empty() {
            self.destinations = overrides.destinations.clone();
        }
    }
}

/// Fetch and decode the ConfigMap named by `reference`. An empty namespace
/// falls back to `pod_namespace`.
pub fn load_ip_config(
    source: &dyn ConfigMapSource,
    reference: &IpConfigRef,
    pod_namespace: &str,
) -> Result<IpOverride> {
    let namespace = if reference.namespace.is_empty() {
        pod_namespace
    } else {
        reference.namespace.as_str()
    };
    let name = reference.name.as_str();
    debug!("Loading IP config from ConfigMap {}/{}", namespace, name);

    let data = source.config_map(namespace, name).map_err(|e| {
        Error::Config(format!(
            "failed to get ConfigMap on namespace {} with name {}: {}",
            namespace, name, e
        ))
    })?;
    let non_empty = |key: &str| data.get(key).filter(|v| !v.is_empty());

    let mut loaded = match (non_empty("ip"), non_empty("podIP")) {
        (Some(_), Some(_)) => {
            return Err(Error::Config(format!(
                "ConfigMap {}/{} contains both 'ip' and 'podIP'",
                namespace, name
            )))
        }
        (Some(ip), None) => IpOverride::Ip(serde_json::from_str(ip).map_err(|e| {
            Error::Config(format!("failed to parse 'ip' in ConfigMap {}/{}: {}", namespace, name, e))
        })?),
        (None, Some(pod_ip)) => IpOverride::PodIp(serde_json::from_str(pod_ip).map_err(|e| {
            Error::Config(format!(
                "failed to parse 'podIP' in ConfigMap {}/{}: {}",
                namespace, name, e
            ))
        })?),
        (None, None) => {
            return Err(Error::Config(format!(
                "ConfigMap {}/{} contains neither 'ip' nor 'podIP'",
                namespace, name
            )))
        }
    };

    if let Some(overrides) = &reference.overrides {
        match &mut loaded {
            IpOverride::Ip(ip) => ip.apply_overrides(overrides),
            IpOverride::PodIp(by_pod) => by_pod
                .values_mut()
                .for_each(|ip| ip.apply_overrides(overrides)),
        }
    }

    Ok(loaded)
}
