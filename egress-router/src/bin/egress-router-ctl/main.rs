use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use egress_router::config::{ClusterConfig, EgressConfig, InterfaceArgs, InterfaceType, NetConf};
use egress_router::nat::{self, NatRule};
use egress_router::netlink::{IpRoute2, MacvlanMode};
use egress_router::plugin::PRIMARY_INTERFACE;

/// A command line tool to write and check egress router network configurations
#[derive(Parser)]
#[clap(name = "egress-router-ctl", author, version, about)]
struct Cli {
    /// Enable verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a network configuration and show the NAT rules ADD installs
    Validate {
        /// Configuration file
        file: PathBuf,

        /// Fill master, mode and MTU from this host
        #[clap(long)]
        resolve: bool,

        /// Interface name the plugin would be called with
        #[clap(long, default_value = "net1")]
        ifname: String,

        /// Cloud provider of the cluster, if any
        #[clap(long, default_value = "")]
        cloud_provider: String,
    },

    /// Generate a network configuration
    Generate {
        /// Egress address in CIDR notation; the first is the SNAT source
        #[clap(long = "address", required = true)]
        addresses: Vec<String>,

        /// Egress gateway
        #[clap(long)]
        gateway: String,

        /// Allowed destination, e.g. "80 tcp 203.0.113.25" or "203.0.113.26"
        #[clap(long = "destination")]
        destinations: Vec<String>,

        /// Master interface
        #[clap(long)]
        master: Option<String>,

        /// Macvlan mode
        #[clap(long)]
        mode: Option<MacvlanMode>,

        /// Interface MTU
        #[clap(long)]
        mtu: Option<u32>,

        /// Network name
        #[clap(long, default_value = "egress-router")]
        name: String,

        /// Output file path
        #[clap(long)]
        output: Option<PathBuf>,
    },
}

fn generate_network_config(
    name: &str,
    addresses: Vec<String>,
    gateway: String,
    destinations: Vec<String>,
    interface_args: InterfaceArgs,
) -> NetConf {
    NetConf {
        cni_version: "0.4.0".to_string(),
        name: name.to_string(),
        plugin_type: "egress-router".to_string(),
        interface_type: Some(InterfaceType::Macvlan),
        interface_args,
        egress: Some(EgressConfig {
            addresses,
            gateway,
            destinations,
        }),
        ..Default::default()
    }
}

fn iptables_command(rule: &NatRule, binary: &str) -> String {
    format!("{} {}", binary, rule)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    match cli.command {
        Commands::Validate {
            file,
            resolve,
            ifname,
            cloud_provider,
        } => {
            let raw = fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            let mut conf = NetConf::parse(&raw)?;
            if resolve {
                let cluster = ClusterConfig { cloud_provider };
                conf.fill_defaults(&cluster, &IpRoute2::default())?;
                debug!("Filled host defaults for {}", conf.name);
            }

            let egress = conf.egress()?;
            let rules = nat::generate_rules(
                &egress.destinations,
                PRIMARY_INTERFACE,
                &ifname,
                egress.primary().ip(),
            );
            let binary = match egress.family() {
                egress_router::netlink::IpFamily::V4 => "iptables",
                egress_router::netlink::IpFamily::V6 => "ip6tables",
            };

            info!("Configuration {} is valid", file.display());
            println!("{}", serde_json::to_string_pretty(&conf)?);
            println!();
            println!("NAT rules:");
            for rule in &rules {
                println!("  {}", iptables_command(rule, binary));
            }
        }

        Commands::Generate {
            addresses,
            gateway,
            destinations,
            master,
            mode,
            mtu,
            name,
            output,
        } => {
            let config = generate_network_config(
                &name,
                addresses,
                gateway,
                destinations,
                InterfaceArgs { master, mode, mtu },
            );
            // refuse to write something ADD would reject
            config.egress()?;

            let config_json = serde_json::to_string_pretty(&config)?;
            if let Some(path) = output {
                fs::write(&path, config_json)?;
                println!("Network configuration written to {}", path.display());
            } else {
                println!("{}", config_json);
            }
        }
    }

    Ok(())
}
