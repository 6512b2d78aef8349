//! Swiftnet CNI plugin
//!
//! Acquires pod network identities from a node-local address manager or
//! from delegated IPAM plugins, assembles them into a CNI result, and
//! queues the host-side NAT programming. Implements CNI Spec 1.0.0.

mod client;
mod config;
mod error;
mod invoker;
mod iptables;
mod local;
mod remote;
mod result;
mod routes;
mod watcher;

use std::env;
use std::io::{self, Read};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use config::{CmdArgs, NetworkConfig};
use error::{CniError, CniErrorCode, InvokerError};
use invoker::{create_ipam_invoker, EndpointOptions, IpamAddConfig};
use result::VersionResult;

/// Maximum size of network config input (1 MB should be more than enough)
const MAX_INPUT_SIZE: u64 = 1024 * 1024;

/// CNI Spec version supported by this plugin
const CNI_VERSION: &str = "1.0.0";

/// Supported CNI versions
const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

fn main() {
    // stdout carries the CNI result; all diagnostics go to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run() {
        // Output error in CNI format to stderr
        let error_output = serde_json::json!({
            "cniVersion": CNI_VERSION,
            "code": e.code() as u32,
            "msg": e.message(),
            "details": e.details()
        });
        eprintln!(
            "{}",
            serde_json::to_string(&error_output).unwrap_or_else(|_| {
                format!(
                    r#"{{"cniVersion":"{}","code":{},"msg":"{}"}}"#,
                    CNI_VERSION,
                    e.code() as u32,
                    e.message()
                )
            })
        );
        std::process::exit(1);
    }
}

fn run() -> Result<(), CniError> {
    // Get CNI command from environment
    let command = env::var("CNI_COMMAND").map_err(|_| {
        CniError::new(
            CniErrorCode::InvalidEnvironmentVariables,
            "CNI_COMMAND not set",
        )
    })?;

    // Read network config from stdin (with size limit to prevent OOM)
    let mut input = String::new();
    io::stdin()
        .take(MAX_INPUT_SIZE)
        .read_to_string(&mut input)
        .map_err(|e| {
            CniError::new(CniErrorCode::IoFailure, "failed to read stdin")
                .with_details(&e.to_string())
        })?;

    match command.as_str() {
        "ADD" => cmd_add(&input),
        "DEL" => cmd_del(&input),
        "CHECK" => cmd_check(&input),
        "VERSION" => cmd_version(&input),
        _ => {
            // Truncate command for safety in error message (avoid log injection)
            let safe_command: String = command
                .chars()
                .take(32)
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            Err(CniError::new(
                CniErrorCode::InvalidEnvironmentVariables,
                &format!("unknown CNI_COMMAND: {}", safe_command),
            ))
        }
    }
}

fn parse_config(input: &str) -> Result<NetworkConfig, CniError> {
    serde_json::from_str(input).map_err(|e| {
        CniError::new(
            CniErrorCode::DecodingFailure,
            "failed to parse network config",
        )
        .with_details(&e.to_string())
    })
}

/// Handle ADD command - acquire addresses and emit the CNI result
fn cmd_add(input: &str) -> Result<(), CniError> {
    let nw_cfg = parse_config(input)?;
    let args = CmdArgs::from_env()?;

    info!(
        container_id = %args.container_id,
        netns = %args.netns,
        ifname = %args.ifname,
        network = %nw_cfg.name,
        "processing ADD"
    );

    let mut invoker = create_ipam_invoker(&nw_cfg, &args)?;
    let mut options = EndpointOptions::default();

    let add_result = match invoker.add(IpamAddConfig {
        nw_cfg: &nw_cfg,
        args: Some(&args),
        subnet_prefix: nw_cfg.ipam.subnet_prefix(),
        options: &mut options,
    }) {
        Ok(result) => result,
        Err(e) => {
            if let InvokerError::V6AddFailed { partial, .. } = &e {
                warn!(
                    ips = ?partial.default_interface_info.ip_result.ips,
                    "v4 allocation rolled back after v6 failure"
                );
            }
            return Err(e.into());
        }
    };

    info!(
        secondary_count = add_result.secondary_interfaces.len(),
        ipv6_enabled = add_result.ipv6_enabled,
        snat_ip = ?options.snat_ip,
        pod_routes = options.routes.len(),
        "addresses acquired"
    );
    for command in &options.iptables_commands {
        debug!(command = %command.render(), "queued NAT command");
    }

    let mut cni_result = add_result.default_interface_info.ip_result;
    cni_result.cni_version = nw_cfg.cni_version.clone();

    // Output result to stdout
    println!(
        "{}",
        serde_json::to_string(&cni_result).map_err(|e| {
            CniError::new(CniErrorCode::IoFailure, "failed to serialize result")
                .with_details(&e.to_string())
        })?
    );

    Ok(())
}

/// Handle DEL command - release addresses; must be idempotent
fn cmd_del(input: &str) -> Result<(), CniError> {
    let nw_cfg = parse_config(input)?;
    let args = CmdArgs::from_env()?;

    info!(
        container_id = %args.container_id,
        ifname = %args.ifname,
        "processing DEL"
    );

    let mut invoker = create_ipam_invoker(&nw_cfg, &args)?;
    let mut options = EndpointOptions::default();

    // no configured address releases whatever is bound to the pod
    // interface (remote backend only; the local invoker rejects it)
    let address = nw_cfg.ipam.parsed_address();
    invoker
        .delete(address, &nw_cfg, Some(&args), &mut options)
        .map_err(CniError::from)?;

    // DEL outputs nothing on success
    Ok(())
}

/// Handle CHECK command - verify the envelope is well-formed
fn cmd_check(input: &str) -> Result<(), CniError> {
    let nw_cfg = parse_config(input)?;
    let args = CmdArgs::from_env()?;

    if nw_cfg.prev_result.is_none() {
        warn!(
            container_id = %args.container_id,
            ifname = %args.ifname,
            "CHECK without prevResult in config"
        );
    }

    // CHECK outputs nothing on success
    Ok(())
}

/// Handle VERSION command - report supported CNI versions
fn cmd_version(_input: &str) -> Result<(), CniError> {
    let result = VersionResult {
        cni_version: CNI_VERSION.to_string(),
        supported_versions: SUPPORTED_VERSIONS.iter().map(|s| s.to_string()).collect(),
    };

    println!(
        "{}",
        serde_json::to_string(&result).map_err(|e| {
            CniError::new(CniErrorCode::IoFailure, "failed to serialize version")
                .with_details(&e.to_string())
        })?
    );

    Ok(())
}
