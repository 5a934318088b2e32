use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};

use crate::config::ClusterConfig;
use crate::error::Error;
use crate::logging;
use crate::plugin::{EgressRouter, Kernel};
use crate::types::{self, CmdArgs};

pub const CURRENT_VERSION: &str = "1.0.0";
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    let container_id = env::var("CNI_CONTAINERID")
        .context("CNI_CONTAINERID not found in environment")?;

    // absent once the runtime has torn the namespace down
    let netns = env::var("CNI_NETNS").unwrap_or_default();

    let ifname = env::var("CNI_IFNAME")
        .context("CNI_IFNAME not found in environment")?;

    let path = env::var("CNI_PATH").unwrap_or_default();

    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Fields read ahead of the full configuration to set up logging.
#[derive(Debug, Default, Deserialize)]
struct LogSettings {
    #[serde(default)]
    log_file: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(rename = "cniVersion", default)]
    cni_version: Option<String>,
}

impl LogSettings {
    fn from_stdin(stdin_data: &[u8]) -> Self {
        serde_json::from_slice(stdin_data).unwrap_or_default()
    }
}

/// Execute the add command, printing the result
pub fn cmd_add(router: &EgressRouter, args: &CmdArgs) -> Result<()> {
    let result = router.add(args)?;
    result.print()?;
    Ok(())
}

/// Execute the delete command
pub fn cmd_del(router: &EgressRouter, args: &CmdArgs) -> Result<()> {
    router.del(args)?;
    Ok(())
}

/// Execute the check command
pub fn cmd_check(router: &EgressRouter, args: &CmdArgs) -> Result<()> {
    router.check(args)?;
    Ok(())
}

/// The VERSION reply.
pub fn version_info() -> serde_json::Value {
    serde_json::json!({
        "cniVersion": CURRENT_VERSION,
        "supportedVersions": SUPPORTED_VERSIONS,
    })
}

/// Render a failure as the CNI error object.
pub fn error_json(err: &anyhow::Error, cni_version: Option<&str>) -> types::Error {
    let code = err.downcast_ref::<Error>().map_or(100, Error::code);
    types::Error {
        cni_version: cni_version
            .filter(|v| !v.is_empty())
            .unwrap_or(CURRENT_VERSION)
            .to_string(),
        code,
        msg: err.to_string(),
        details: err
            .chain()
            .skip(1)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": "),
    }
}

/// Run one verb against `router`.
pub fn dispatch(router: &EgressRouter, command: &str, args: &CmdArgs) -> Result<()> {
    match command {
        "ADD" => cmd_add(router, args),
        "DEL" => cmd_del(router, args),
        "CHECK" => cmd_check(router, args),
        _ => bail!("Unknown CNI command: {}", command),
    }
}

/// Main entry point for the CNI plugin. Failures are returned as the CNI
/// error object the binary prints.
pub fn run_cni() -> std::result::Result<(), types::Error> {
    let command = match env::var("CNI_COMMAND") {
        Ok(command) => command,
        Err(e) => {
            let err = anyhow::Error::new(e).context("CNI_COMMAND not found in environment");
            return Err(error_json(&err, None));
        }
    };

    if command == "VERSION" {
        println!("{}", version_info());
        return Ok(());
    }

    let args = parse_args().map_err(|e| error_json(&e, None))?;
    let settings = LogSettings::from_stdin(&args.stdin_data);
    if let Err(e) = logging::init(settings.log_level.as_deref(), settings.log_file.as_deref()) {
        eprintln!("failed to set up logging: {}", e);
    }

    let router = EgressRouter::new(Kernel::system(), ClusterConfig::default());
    dispatch(&router, &command, &args).map_err(|e| {
        tracing::error!("CNI {} failed: {:#}", command, e);
        error_json(&e, settings.cni_version.as_deref())
    })
}
