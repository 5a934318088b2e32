//! Egress router CNI plugin for Kubernetes
//!
//! Gives a pod a macvlan interface on a host network, routes all of the
//! pod's traffic through it and uses NAT so the pod can only reach the
//! configured destinations, always from the configured source address.

pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod nat;
pub mod netlink;
pub mod netns;
pub mod plugin;
pub mod sysctl;
pub mod types;

pub use commands::{cmd_add, cmd_check, cmd_del, run_cni};
pub use config::NetConf;
pub use error::{Error, KernelError};
pub use plugin::{EgressRouter, Kernel};
