//! Local IPAM adapter
//!
//! Drives co-located IPAM plugins (v4 and optionally v6) through the
//! runtime's delegation mechanism: each delegated call executes the named
//! plugin binary with the CNI environment and the network config on
//! stdin, and reads a result or error JSON back.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use ipnet::IpNet;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::error::{CniError, CniErrorCode, InvokerError};
use crate::invoker::{EndpointOptions, IpamAddConfig, IpamInvoker};
use crate::result::{CniResult, IpamAddResult};

/// Default plugin search path when CNI_PATH is unset
const DEFAULT_PLUGIN_DIR: &str = "/opt/cni/bin";

/// Delegated CNI calls into a sibling IPAM plugin. Split out as a trait
/// so the adapter can be exercised against a mock.
pub trait DelegatePlugin {
    fn delegate_add(
        &mut self,
        plugin: &str,
        nw_cfg: &NetworkConfig,
    ) -> Result<CniResult, InvokerError>;

    fn delegate_del(&mut self, plugin: &str, nw_cfg: &NetworkConfig) -> Result<(), InvokerError>;
}

/// Error JSON a failing plugin prints per the CNI spec
#[derive(Debug, Deserialize)]
struct WireError {
    code: u32,
    msg: String,
    #[serde(default)]
    details: Option<String>,
}

/// Executes plugin binaries found on the CNI search path
pub struct ExecDelegate {
    paths: Vec<PathBuf>,
}

impl ExecDelegate {
    /// Build from a colon-separated CNI_PATH value
    pub fn new(cni_path: &str) -> Self {
        let mut paths: Vec<PathBuf> = cni_path
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        if paths.is_empty() {
            paths.push(PathBuf::from(DEFAULT_PLUGIN_DIR));
        }
        Self { paths }
    }

    fn find_plugin(&self, name: &str) -> Result<PathBuf, InvokerError> {
        self.paths
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| InvokerError::Delegate {
                plugin: name.to_string(),
                source: CniError::new(
                    CniErrorCode::IoFailure,
                    &format!("plugin {} not found on CNI_PATH", name),
                ),
            })
    }

    fn invoke(
        &self,
        plugin: &str,
        command: &str,
        nw_cfg: &NetworkConfig,
    ) -> Result<Vec<u8>, InvokerError> {
        let path = self.find_plugin(plugin)?;

        let config = serde_json::to_vec(nw_cfg).map_err(|e| InvokerError::Delegate {
            plugin: plugin.to_string(),
            source: CniError::new(CniErrorCode::DecodingFailure, "failed to serialize config")
                .with_details(&e.to_string()),
        })?;

        let io_err = |e: std::io::Error| InvokerError::Delegate {
            plugin: plugin.to_string(),
            source: CniError::new(CniErrorCode::IoFailure, "failed to execute plugin")
                .with_details(&e.to_string()),
        };

        let mut child = Command::new(&path)
            .env("CNI_COMMAND", command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(io_err)?;

        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(&config)
            .map_err(io_err)?;

        let output = child.wait_with_output().map_err(io_err)?;
        if output.status.success() {
            return Ok(output.stdout);
        }

        // a failing plugin reports a structured error on stdout
        Err(match serde_json::from_slice::<WireError>(&output.stdout) {
            Ok(wire) if wire.code == CniErrorCode::NoAvailableAddressPools as u32 => {
                InvokerError::PoolExhausted
            }
            Ok(wire) => {
                let mut source = CniError::new(CniErrorCode::IpamFailure, &wire.msg);
                if let Some(details) = wire.details.as_deref() {
                    source = source.with_details(details);
                }
                InvokerError::Delegate {
                    plugin: plugin.to_string(),
                    source,
                }
            }
            Err(_) => InvokerError::Delegate {
                plugin: plugin.to_string(),
                source: CniError::new(CniErrorCode::IpamFailure, "plugin exited with error")
                    .with_details(String::from_utf8_lossy(&output.stderr).trim()),
            },
        })
    }
}

impl DelegatePlugin for ExecDelegate {
    fn delegate_add(
        &mut self,
        plugin: &str,
        nw_cfg: &NetworkConfig,
    ) -> Result<CniResult, InvokerError> {
        let stdout = self.invoke(plugin, "ADD", nw_cfg)?;
        serde_json::from_slice(&stdout).map_err(|e| InvokerError::Delegate {
            plugin: plugin.to_string(),
            source: CniError::new(CniErrorCode::DecodingFailure, "failed to parse plugin result")
                .with_details(&e.to_string()),
        })
    }

    fn delegate_del(&mut self, plugin: &str, nw_cfg: &NetworkConfig) -> Result<(), InvokerError> {
        self.invoke(plugin, "DEL", nw_cfg).map(|_| ())
    }
}

/// Acquires addresses from delegated IPAM plugins
pub struct LocalIpamInvoker<P: DelegatePlugin> {
    plugin: P,
    v4_plugin: String,
    v6_plugin: String,
}

impl<P: DelegatePlugin> LocalIpamInvoker<P> {
    pub fn new(plugin: P, nw_cfg: &NetworkConfig) -> Self {
        let v4_plugin = nw_cfg.ipam.plugin_type.clone();
        let v6_plugin = nw_cfg
            .ipam
            .ipv6_type
            .clone()
            .unwrap_or_else(|| format!("{}v6", v4_plugin));

        Self {
            plugin,
            v4_plugin,
            v6_plugin,
        }
    }

    fn append_result(result: &mut IpamAddResult, delegated: CniResult) {
        if let Some(ips) = delegated.ips {
            for ip in ips {
                result.push_default_ip(ip);
            }
        }
        if let Some(routes) = delegated.routes {
            result.push_default_routes(routes);
        }
    }
}

impl<P: DelegatePlugin> IpamInvoker for LocalIpamInvoker<P> {
    fn add(&mut self, config: IpamAddConfig<'_>) -> Result<IpamAddResult, InvokerError> {
        // a v4 pool-exhaustion sentinel passes through untouched so the
        // caller can wipe its cached IPAM state; v6 is never attempted
        let v4 = self.plugin.delegate_add(&self.v4_plugin, config.nw_cfg)?;

        let mut result = IpamAddResult::default();
        Self::append_result(&mut result, v4);
        result.host_subnet_prefix = config.subnet_prefix;

        if config.nw_cfg.ipv6_enabled() {
            match self.plugin.delegate_add(&self.v6_plugin, config.nw_cfg) {
                Ok(v6) => {
                    Self::append_result(&mut result, v6);
                    result.ipv6_enabled = true;
                }
                Err(e) => {
                    if let Err(rollback) =
                        self.plugin.delegate_del(&self.v4_plugin, config.nw_cfg)
                    {
                        warn!(error = %rollback, "rollback of v4 allocation failed");
                    }

                    result.seal(Vec::new());
                    return Err(InvokerError::V6AddFailed {
                        partial: Box::new(result),
                        source: Box::new(e),
                    });
                }
            }
        }

        result.seal(Vec::new());
        info!(plugin = %self.v4_plugin, ipv6 = result.ipv6_enabled, "delegated add complete");
        Ok(result)
    }

    fn delete(
        &mut self,
        address: Option<IpNet>,
        nw_cfg: &NetworkConfig,
        _args: Option<&crate::config::CmdArgs>,
        _options: &mut EndpointOptions,
    ) -> Result<(), InvokerError> {
        let address =
            address.ok_or_else(|| InvokerError::InvalidAddress("address required".to_string()))?;

        let mut cfg = nw_cfg.clone();
        cfg.ipam.address = Some(address.addr().to_string());

        let plugin = if address.addr().is_ipv4() {
            self.v4_plugin.clone()
        } else {
            self.v6_plugin.clone()
        };

        self.plugin.delegate_del(&plugin, &cfg)
    }
}
