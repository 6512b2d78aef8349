//! CNI result types and the IPAM result aggregate
//!
//! Output formats for CNI operations as defined in CNI Spec 1.0.0, plus
//! the aggregate the invokers hand back to the plugin: one default
//! interface, any number of secondary interfaces, the node subnet, and a
//! dual-stack marker.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Result returned by ADD operation
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#success
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    /// CNI specification version
    #[serde(default)]
    pub cni_version: String,

    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,

    /// IP addresses assigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IpConfig>>,

    /// Routes configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteConfig>>,
}

impl CniResult {
    /// Add an interface to the result
    pub fn with_interface(mut self, name: String, mac: String, sandbox: Option<String>) -> Self {
        let iface = Interface { name, mac, sandbox };
        match &mut self.interfaces {
            Some(interfaces) => interfaces.push(iface),
            None => self.interfaces = Some(vec![iface]),
        }
        self
    }

    /// Append an IP configuration
    pub fn push_ip(&mut self, ip: IpConfig) {
        match &mut self.ips {
            Some(ips) => ips.push(ip),
            None => self.ips = Some(vec![ip]),
        }
    }

    /// Append routes
    pub fn push_routes(&mut self, routes: impl IntoIterator<Item = RouteConfig>) {
        let target = self.routes.get_or_insert_with(Vec::new);
        target.extend(routes);
        if target.is_empty() {
            self.routes = None;
        }
    }

    fn has_routes(&self) -> bool {
        self.routes.as_ref().is_some_and(|r| !r.is_empty())
    }
}

/// Network interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,

    /// MAC address
    pub mac: String,

    /// Network namespace path (for container-side interfaces)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP address configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    /// IP address in CIDR notation
    pub address: String,

    /// Gateway IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Index into interfaces array
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// Route configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Destination network in CIDR notation
    pub dst: String,

    /// Gateway IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// Result returned by VERSION operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    /// Current CNI version
    pub cni_version: String,

    /// List of supported CNI versions
    pub supported_versions: Vec<String>,
}

/// Whether an allocation backs the pod's default interface or an
/// additional one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    #[default]
    #[serde(alias = "")]
    Default,
    Secondary,
}

/// One interface worth of allocation results
#[derive(Debug, Clone, Default)]
pub struct InterfaceInfo {
    /// CNI result fragment for this interface
    pub ip_result: CniResult,

    /// Default or secondary allocation
    pub address_type: AddressType,

    /// MAC address for secondary interfaces
    pub mac_address: Option<String>,

    /// Whether this interface is the pod's default route owner
    pub is_default_interface: bool,
}

/// Aggregate handed back to the CNI layer after an ADD
#[derive(Debug, Clone, Default)]
pub struct IpamAddResult {
    /// The single default interface with its IPs, routes, and gateways
    pub default_interface_info: InterfaceInfo,

    /// Additional interfaces in backend response order
    pub secondary_interfaces: Vec<InterfaceInfo>,

    /// The node's primary subnet, used by callers to size veth addressing
    pub host_subnet_prefix: Option<IpNet>,

    /// True iff any allocated address is v6
    pub ipv6_enabled: bool,
}

impl IpamAddResult {
    /// Merge one allocated address into the default interface
    pub fn push_default_ip(&mut self, ip: IpConfig) {
        self.default_interface_info.ip_result.push_ip(ip);
    }

    /// Append routes to the default interface
    pub fn push_default_routes(&mut self, routes: impl IntoIterator<Item = RouteConfig>) {
        self.default_interface_info.ip_result.push_routes(routes);
    }

    /// Append a secondary interface in response order
    pub fn push_secondary(&mut self, info: InterfaceInfo) {
        self.secondary_interfaces.push(info);
    }

    /// Whether any secondary interface claimed the default-interface role
    pub fn any_secondary_claims_default(&self) -> bool {
        self.secondary_interfaces
            .iter()
            .any(|info| info.is_default_interface)
    }

    /// Finish assembly: attach the fallback default routes when the
    /// backend supplied none, and designate the default interface. A
    /// secondary's claim to the default role wins over the default-type
    /// allocation.
    pub fn seal(&mut self, fallback_routes: Vec<RouteConfig>) {
        if !self.default_interface_info.ip_result.has_routes() {
            self.default_interface_info.ip_result.push_routes(fallback_routes);
        }
        self.default_interface_info.address_type = AddressType::Default;
        self.default_interface_info.is_default_interface = !self.any_secondary_claims_default();
    }
}
