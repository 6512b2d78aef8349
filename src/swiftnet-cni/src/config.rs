//! CNI network configuration and argument envelope
//!
//! Handles the network configuration JSON passed via stdin and the
//! environment-variable envelope the runtime sets for each invocation.

use std::env;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{CniError, CniErrorCode};

/// IPAM plugin type that selects the node-local address manager backend
pub const NODE_SERVICE_IPAM: &str = "node-service";

/// Network configuration passed to the CNI plugin
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#network-configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// CNI specification version
    pub cni_version: String,

    /// Network name (must be unique on the host)
    pub name: String,

    /// CNI plugin type (matches binary name)
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// IPv6 mode; non-empty enables dual-stack allocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_mode: Option<String>,

    /// Previous result from chain (for CHECK/DEL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<serde_json::Value>,

    /// IPAM configuration
    pub ipam: IpamConfig,
}

impl NetworkConfig {
    /// Whether dual-stack allocation is requested
    pub fn ipv6_enabled(&self) -> bool {
        self.ipv6_mode.as_deref().is_some_and(|m| !m.is_empty())
    }

    /// Whether the node-local address manager serves this network
    pub fn uses_node_service(&self) -> bool {
        self.ipam.plugin_type == NODE_SERVICE_IPAM
    }
}

/// IPAM (IP Address Management) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConfig {
    /// IPAM plugin type ("node-service" or a delegated plugin name)
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// IPAM operating mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<IpamMode>,

    /// Address manager endpoint override (loopback HTTP URL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Subnet in CIDR notation (sizes the node-side addressing)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    /// Address to release on DEL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Delegated plugin name for v6 allocations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_type: Option<String>,
}

impl IpamConfig {
    /// Parse the configured subnet, if any
    pub fn subnet_prefix(&self) -> Option<IpNet> {
        self.subnet.as_deref().and_then(|s| s.parse().ok())
    }

    /// Parse the configured address as prefix or bare IP
    pub fn parsed_address(&self) -> Option<IpNet> {
        let raw = self.address.as_deref()?;
        parse_address_or_prefix(raw)
    }
}

/// Parse "a.b.c.d/len" or a bare address (host-length prefix)
pub fn parse_address_or_prefix(raw: &str) -> Option<IpNet> {
    if let Ok(net) = raw.parse::<IpNet>() {
        return Some(net);
    }
    raw.parse::<std::net::IpAddr>()
        .ok()
        .map(|ip| IpNet::new(ip, if ip.is_ipv4() { 32 } else { 128 }).expect("host prefix fits"))
}

/// IPAM operating mode; overlay variants carry synthesized gateways
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpamMode {
    #[serde(rename = "v4overlay")]
    V4Overlay,

    #[serde(rename = "dualstackoverlay")]
    DualStackOverlay,

    #[serde(rename = "overlay")]
    Overlay,
}

impl IpamMode {
    pub fn is_overlay(self) -> bool {
        matches!(
            self,
            IpamMode::V4Overlay | IpamMode::DualStackOverlay | IpamMode::Overlay
        )
    }
}

/// Argument envelope the runtime passes through the environment
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Runtime-assigned container id
    pub container_id: String,

    /// Path to the container network namespace
    pub netns: String,

    /// Interface name inside the container
    pub ifname: String,

    /// Raw CNI_ARGS string (semicolon-separated key=value pairs)
    pub args: String,

    /// Plugin search path (CNI_PATH)
    pub path: String,
}

impl CmdArgs {
    /// Read the envelope from the environment; CNI_CONTAINERID and
    /// CNI_IFNAME are required for ADD/DEL.
    pub fn from_env() -> Result<Self, CniError> {
        let container_id = env::var("CNI_CONTAINERID").map_err(|_| {
            CniError::new(
                CniErrorCode::InvalidEnvironmentVariables,
                "CNI_CONTAINERID not set",
            )
        })?;

        let ifname = env::var("CNI_IFNAME").map_err(|_| {
            CniError::new(
                CniErrorCode::InvalidEnvironmentVariables,
                "CNI_IFNAME not set",
            )
        })?;

        Ok(Self {
            container_id,
            netns: env::var("CNI_NETNS").unwrap_or_default(),
            ifname,
            args: env::var("CNI_ARGS").unwrap_or_default(),
            path: env::var("CNI_PATH").unwrap_or_default(),
        })
    }

    /// Stable pod-interface id: first 8 chars of the container id joined
    /// with the interface name.
    pub fn endpoint_id(&self) -> String {
        let short = if self.container_id.len() > 8 {
            &self.container_id[..8]
        } else {
            &self.container_id
        };
        format!("{}-{}", short, self.ifname)
    }

    /// Extract the pod identity from the CNI_ARGS key=value pairs
    pub fn pod_info(&self) -> Result<KubernetesPodInfo, CniError> {
        let mut pod_name = None;
        let mut pod_namespace = None;

        for pair in self.args.split(';') {
            if let Some((key, value)) = pair.split_once('=') {
                match key {
                    "K8S_POD_NAME" => pod_name = Some(value.to_string()),
                    "K8S_POD_NAMESPACE" => pod_namespace = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        match (pod_name, pod_namespace) {
            (Some(pod_name), Some(pod_namespace)) => Ok(KubernetesPodInfo {
                pod_name,
                pod_namespace,
            }),
            _ => Err(CniError::new(
                CniErrorCode::InvalidEnvironmentVariables,
                "CNI_ARGS missing K8S_POD_NAME or K8S_POD_NAMESPACE",
            )),
        }
    }
}

/// Pod identity serialized into the opaque orchestrator context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesPodInfo {
    pub pod_name: String,
    pub pod_namespace: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with(container_id: &str, ifname: &str, cni_args: &str) -> CmdArgs {
        CmdArgs {
            container_id: container_id.to_string(),
            netns: "/var/run/netns/ctr".to_string(),
            ifname: ifname.to_string(),
            args: cni_args.to_string(),
            path: String::new(),
        }
    }

    #[test]
    fn test_parse_minimal_config() {
        let json = r#"{
            "cniVersion": "1.0.0",
            "name": "swiftnet",
            "type": "swiftnet-cni",
            "ipam": {
                "type": "node-service"
            }
        }"#;

        let config: NetworkConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cni_version, "1.0.0");
        assert!(config.uses_node_service());
        assert!(!config.ipv6_enabled());
        assert_eq!(config.ipam.mode, None);
    }

    #[test]
    fn test_parse_overlay_config() {
        let json = r#"{
            "cniVersion": "1.0.0",
            "name": "swiftnet",
            "type": "swiftnet-cni",
            "ipv6Mode": "ipv6nat",
            "ipam": {
                "type": "node-service",
                "mode": "dualstackoverlay",
                "endpoint": "http://localhost:10090"
            }
        }"#;

        let config: NetworkConfig = serde_json::from_str(json).unwrap();
        assert!(config.ipv6_enabled());
        assert_eq!(config.ipam.mode, Some(IpamMode::DualStackOverlay));
        assert!(config.ipam.mode.unwrap().is_overlay());
    }

    #[test]
    fn test_parse_delegated_config() {
        let json = r#"{
            "cniVersion": "1.0.0",
            "name": "swiftnet",
            "type": "swiftnet-cni",
            "ipam": {
                "type": "swiftnet-ipam",
                "subnet": "10.0.0.0/24",
                "address": "10.0.0.4"
            }
        }"#;

        let config: NetworkConfig = serde_json::from_str(json).unwrap();
        assert!(!config.uses_node_service());
        assert_eq!(
            config.ipam.subnet_prefix(),
            Some("10.0.0.0/24".parse().unwrap())
        );
        assert_eq!(
            config.ipam.parsed_address(),
            Some("10.0.0.4/32".parse().unwrap())
        );
    }

    #[test]
    fn test_parsed_address_accepts_prefix_and_v6() {
        let mut ipam = IpamConfig {
            plugin_type: "swiftnet-ipam".to_string(),
            mode: None,
            endpoint: None,
            subnet: None,
            address: Some("10.0.0.4/24".to_string()),
            ipv6_type: None,
        };
        assert_eq!(ipam.parsed_address(), Some("10.0.0.4/24".parse().unwrap()));

        ipam.address = Some("2001:db8::5".to_string());
        assert_eq!(
            ipam.parsed_address(),
            Some("2001:db8::5/128".parse().unwrap())
        );

        ipam.address = Some("not-an-address".to_string());
        assert_eq!(ipam.parsed_address(), None);
    }

    #[test]
    fn test_endpoint_id_truncates_container_id() {
        let args = args_with("0123456789abcdef", "eth0", "");
        assert_eq!(args.endpoint_id(), "01234567-eth0");

        let short = args_with("abc", "eth1", "");
        assert_eq!(short.endpoint_id(), "abc-eth1");
    }

    #[test]
    fn test_pod_info_from_cni_args() {
        let args = args_with(
            "abc",
            "eth0",
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=kube-system;K8S_POD_NAME=coredns-5d78c9869d",
        );
        let pod = args.pod_info().unwrap();
        assert_eq!(pod.pod_name, "coredns-5d78c9869d");
        assert_eq!(pod.pod_namespace, "kube-system");
    }

    #[test]
    fn test_pod_info_missing_keys() {
        let args = args_with("abc", "eth0", "IgnoreUnknown=1");
        assert!(args.pod_info().is_err());
    }
}
