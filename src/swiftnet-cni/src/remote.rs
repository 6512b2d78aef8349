//! Remote IPAM adapter
//!
//! Acquires and releases pod addresses through the node-local address
//! manager. The adapter negotiates between the batch and singleton wire
//! APIs (downgrading once per process lifetime, never upgrading back),
//! assembles the per-allocation response into the IPAM aggregate, and
//! defers releases to the delete queue when the service socket is
//! unreachable.

use std::cell::Cell;
use std::net::IpAddr;

use ipnet::IpNet;
use tracing::{info, warn};

use crate::client::{
    AddressService, IpConfigRequest, IpConfigsRequest, IpConfigsResponse, PodIpInfo,
};
use crate::config::{CmdArgs, IpamMode, KubernetesPodInfo, NetworkConfig};
use crate::error::InvokerError;
use crate::invoker::{EndpointOptions, IpamAddConfig, IpamInvoker};
use crate::iptables::{set_host_options, HostInfo, RuleState, SystemRuleState};
use crate::result::{AddressType, CniResult, InterfaceInfo, IpConfig, IpamAddResult, RouteConfig};
use crate::routes::translate_routes;
use crate::watcher::DeleteWatcher;

/// Fixed link-local gateway for v6 overlay allocations
const OVERLAY_GATEWAY_V6: &str = "fe80::1234:5678:9abc";

/// Which wire API shape the service accepted last
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiMode {
    Batch,
    Singleton,
}

/// Acquires addresses from the node-local address manager
pub struct RemoteIpamInvoker<S: AddressService, W: DeleteWatcher> {
    pod_info: KubernetesPodInfo,
    service: S,
    ipam_mode: Option<IpamMode>,
    watcher: W,
    rule_state: Box<dyn RuleState>,
    api_mode: Cell<ApiMode>,
}

impl<S: AddressService, W: DeleteWatcher> RemoteIpamInvoker<S, W> {
    pub fn new(
        pod_info: KubernetesPodInfo,
        service: S,
        ipam_mode: Option<IpamMode>,
        watcher: W,
    ) -> Self {
        Self {
            pod_info,
            service,
            ipam_mode,
            watcher,
            rule_state: Box::new(SystemRuleState),
            api_mode: Cell::new(ApiMode::Batch),
        }
    }

    #[cfg(test)]
    fn with_rule_state(mut self, rule_state: Box<dyn RuleState>) -> Self {
        self.rule_state = rule_state;
        self
    }

    fn is_overlay(&self) -> bool {
        self.ipam_mode.is_some_and(IpamMode::is_overlay)
    }

    fn build_request(&self, args: &CmdArgs) -> Result<IpConfigsRequest, InvokerError> {
        let orchestrator_context =
            serde_json::to_vec(&self.pod_info).map_err(InvokerError::OrchestratorContext)?;

        Ok(IpConfigsRequest {
            orchestrator_context,
            pod_interface_id: args.endpoint_id(),
            infra_container_id: args.container_id.clone(),
            desired_ip_addresses: Vec::new(),
        })
    }

    fn singleton_request(request: &IpConfigsRequest) -> IpConfigRequest {
        IpConfigRequest {
            orchestrator_context: request.orchestrator_context.clone(),
            pod_interface_id: request.pod_interface_id.clone(),
            infra_container_id: request.infra_container_id.clone(),
            desired_ip_address: request.desired_ip_addresses.first().cloned(),
        }
    }

    /// Batch request with one-way singleton fallback. The negotiated
    /// shape sticks for the rest of the process.
    fn request_with_fallback(
        &self,
        request: &IpConfigsRequest,
    ) -> Result<IpConfigsResponse, InvokerError> {
        if self.api_mode.get() == ApiMode::Batch {
            match self.service.request_ips(request) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_unsupported_api() => {
                    warn!(
                        infra_container_id = %request.infra_container_id,
                        "batch request API not supported, downgrading to singleton"
                    );
                    self.api_mode.set(ApiMode::Singleton);
                }
                Err(e) => return Err(InvokerError::BackendUnavailable(e)),
            }
        }

        match self.service.request_ip_address(&Self::singleton_request(request)) {
            Ok(response) => Ok(IpConfigsResponse {
                response: response.response,
                pod_ip_info: vec![response.pod_ip_info],
            }),
            Err(e) => Err(InvokerError::BackendUnavailable(e)),
        }
    }

    fn release_with_fallback(
        &self,
        request: &IpConfigsRequest,
    ) -> Result<(), crate::client::ServiceError> {
        if self.api_mode.get() == ApiMode::Batch {
            match self.service.release_ips(request) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_unsupported_api() => {
                    warn!(
                        infra_container_id = %request.infra_container_id,
                        "batch release API not supported, downgrading to singleton"
                    );
                    self.api_mode.set(ApiMode::Singleton);
                }
                Err(e) => return Err(e),
            }
        }

        self.service
            .release_ip_address(&Self::singleton_request(request))
    }

    fn append_secondary(
        &self,
        result: &mut IpamAddResult,
        info: &PodIpInfo,
    ) -> Result<(), InvokerError> {
        let address = format!(
            "{}/{}",
            info.pod_ip_config.ip_address, info.pod_ip_config.prefix_length
        );
        address
            .parse::<IpNet>()
            .map_err(|_| InvokerError::InvalidAddress(info.pod_ip_config.ip_address.clone()))?;

        let mac_address = parse_mac(&info.mac_address)?;
        let routes = translate_routes(&info.routes)?;

        let mut ip_result =
            CniResult::default().with_interface(String::new(), mac_address.clone(), None);
        ip_result.push_ip(IpConfig {
            address,
            gateway: None,
            interface: None,
        });
        ip_result.push_routes(routes);

        result.push_secondary(InterfaceInfo {
            ip_result,
            address_type: AddressType::Secondary,
            mac_address: Some(mac_address),
            is_default_interface: info.is_default_interface,
        });

        Ok(())
    }

    fn append_default(
        &self,
        result: &mut IpamAddResult,
        info: &PodIpInfo,
        options: &mut EndpointOptions,
        fallback_routes: &mut Vec<RouteConfig>,
        default_claimed: &mut bool,
    ) -> Result<(), InvokerError> {
        let nc = &info.network_container_primary_ip_config;

        let pod_net: IpNet = format!(
            "{}/{}",
            info.pod_ip_config.ip_address, nc.ip_subnet.prefix_length
        )
        .parse()
        .map_err(|_| InvokerError::InvalidAddress(info.pod_ip_config.ip_address.clone()))?;
        let nc_subnet = pod_net.trunc();

        let gateway: IpAddr = match nc.gateway_ip_address.parse() {
            Ok(gateway) => gateway,
            Err(_) => {
                if !self.is_overlay() {
                    return Err(InvokerError::InvalidGateway(nc.gateway_ip_address.clone()));
                }
                match pod_net.addr() {
                    IpAddr::V4(_) => overlay_gateway_v4(&nc_subnet)?,
                    IpAddr::V6(_) => OVERLAY_GATEWAY_V6.parse().expect("fixed gateway parses"),
                }
            }
        };

        let default_dst = if pod_net.addr().is_ipv4() {
            "0.0.0.0/0"
        } else {
            result.ipv6_enabled = true;
            "::/0"
        };

        result.push_default_ip(IpConfig {
            address: pod_net.to_string(),
            gateway: Some(gateway.to_string()),
            interface: None,
        });
        fallback_routes.push(RouteConfig {
            dst: default_dst.to_string(),
            gw: Some(gateway.to_string()),
        });
        result.push_default_routes(translate_routes(&info.routes)?);

        // the first default allocation owns the side channels: the node
        // subnet, the SNAT source, and host programming
        if !*default_claimed {
            *default_claimed = true;

            let host_subnet: IpNet = info
                .host_primary_ip_info
                .subnet
                .parse()
                .map_err(|_| {
                    InvokerError::InvalidHostAddress(info.host_primary_ip_info.subnet.clone())
                })?;
            result.host_subnet_prefix = Some(host_subnet.trunc());

            if let Ok(IpAddr::V4(snat_ip)) = nc.ip_subnet.ip_address.parse::<IpAddr>() {
                options.snat_ip = Some(snat_ip);
            }

            if !self.is_overlay() {
                set_host_options(
                    nc_subnet,
                    &HostInfo {
                        nc_primary_ip: &nc.ip_subnet.ip_address,
                        host_primary_ip: &info.host_primary_ip_info.primary_ip,
                        host_gateway: &info.host_primary_ip_info.gateway,
                    },
                    options,
                    self.rule_state.as_ref(),
                )?;
            }
        }

        Ok(())
    }
}

impl<S: AddressService, W: DeleteWatcher> IpamInvoker for RemoteIpamInvoker<S, W> {
    fn add(&mut self, config: IpamAddConfig<'_>) -> Result<IpamAddResult, InvokerError> {
        let args = config.args.ok_or(InvokerError::EmptyArgs)?;
        let request = self.build_request(args)?;

        info!(
            pod_name = %self.pod_info.pod_name,
            pod_namespace = %self.pod_info.pod_namespace,
            pod_interface_id = %request.pod_interface_id,
            "requesting addresses for pod"
        );

        let response = self.request_with_fallback(&request)?;
        if response.pod_ip_info.is_empty() {
            return Err(InvokerError::EmptyResponse);
        }

        let mut result = IpamAddResult::default();
        let mut fallback_routes = Vec::new();
        let mut default_claimed = false;

        for pod_ip_info in &response.pod_ip_info {
            match pod_ip_info.address_type {
                AddressType::Secondary => self.append_secondary(&mut result, pod_ip_info)?,
                AddressType::Default => self.append_default(
                    &mut result,
                    pod_ip_info,
                    config.options,
                    &mut fallback_routes,
                    &mut default_claimed,
                )?,
            }
        }

        result.seal(fallback_routes);
        Ok(result)
    }

    fn delete(
        &mut self,
        address: Option<IpNet>,
        _nw_cfg: &NetworkConfig,
        args: Option<&CmdArgs>,
        _options: &mut EndpointOptions,
    ) -> Result<(), InvokerError> {
        let args = args.ok_or(InvokerError::EmptyArgs)?;
        let mut request = self.build_request(args)?;

        match address {
            Some(address) => request.desired_ip_addresses.push(address.addr().to_string()),
            None => info!("remote invoker releasing whatever is bound to the pod interface"),
        }

        match self.release_with_fallback(&request) {
            Ok(()) => Ok(()),
            Err(e) if e.is_connection_failure() => {
                // the service socket is down; park the release for the
                // deferred-delete drainer and report success
                warn!(
                    pod_interface_id = %request.pod_interface_id,
                    error = %e,
                    "address manager unreachable, deferring release"
                );
                self.watcher
                    .enqueue(&request.pod_interface_id, &args.container_id)
                    .map_err(|source| InvokerError::DeferredEnqueue {
                        pod_interface_id: request.pod_interface_id.clone(),
                        source,
                    })
            }
            Err(e) => Err(InvokerError::ReleaseFailed(e)),
        }
    }
}

/// Validate and canonicalize a MAC address
fn parse_mac(s: &str) -> Result<String, InvokerError> {
    let parts: Vec<&str> = s.split([':', '-']).collect();
    let valid = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));

    if !valid {
        return Err(InvokerError::InvalidMac(s.to_string()));
    }

    Ok(parts.join(":").to_ascii_lowercase())
}

/// First usable address of the network container subnet
fn overlay_gateway_v4(nc_subnet: &IpNet) -> Result<IpAddr, InvokerError> {
    match nc_subnet {
        IpNet::V4(net) if net.prefix_len() < 31 => {
            Ok(IpAddr::V4((u32::from(net.network()) + 1).into()))
        }
        _ => Err(InvokerError::InvalidGateway(nc_subnet.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;

    use crate::client::{HostIpInfo, IpConfigResponse, IpConfiguration, IpSubnet, ServiceError};
    use crate::client::Route;
    use crate::watcher::FsDeleteWatcher;

    /// Scripted service: responses pop in order, calls are recorded.
    #[derive(Default)]
    struct MockService {
        request_batch: RefCell<VecDeque<Result<IpConfigsResponse, ServiceError>>>,
        request_single: RefCell<VecDeque<Result<IpConfigResponse, ServiceError>>>,
        release_batch: RefCell<VecDeque<Result<(), ServiceError>>>,
        release_single: RefCell<VecDeque<Result<(), ServiceError>>>,
        calls: RefCell<Vec<&'static str>>,
        released: RefCell<Vec<Vec<String>>>,
    }

    impl AddressService for MockService {
        fn request_ips(
            &self,
            _req: &IpConfigsRequest,
        ) -> Result<IpConfigsResponse, ServiceError> {
            self.calls.borrow_mut().push("request_ips");
            self.request_batch
                .borrow_mut()
                .pop_front()
                .expect("unscripted request_ips call")
        }

        fn request_ip_address(
            &self,
            _req: &IpConfigRequest,
        ) -> Result<IpConfigResponse, ServiceError> {
            self.calls.borrow_mut().push("request_ip_address");
            self.request_single
                .borrow_mut()
                .pop_front()
                .expect("unscripted request_ip_address call")
        }

        fn release_ips(&self, req: &IpConfigsRequest) -> Result<(), ServiceError> {
            self.calls.borrow_mut().push("release_ips");
            self.released
                .borrow_mut()
                .push(req.desired_ip_addresses.clone());
            self.release_batch
                .borrow_mut()
                .pop_front()
                .expect("unscripted release_ips call")
        }

        fn release_ip_address(&self, req: &IpConfigRequest) -> Result<(), ServiceError> {
            self.calls.borrow_mut().push("release_ip_address");
            self.released
                .borrow_mut()
                .push(req.desired_ip_address.clone().into_iter().collect());
            self.release_single
                .borrow_mut()
                .pop_front()
                .expect("unscripted release_ip_address call")
        }
    }

    /// Watcher that records pairs, optionally failing
    #[derive(Default)]
    struct MockWatcher {
        enqueued: RefCell<Vec<(String, String)>>,
        fail: bool,
    }

    impl DeleteWatcher for MockWatcher {
        fn enqueue(&self, pod_interface_id: &str, container_id: &str) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
            }
            self.enqueued
                .borrow_mut()
                .push((pod_interface_id.to_string(), container_id.to_string()));
            Ok(())
        }
    }

    /// Empty ruleset: every check reports absent
    struct NoRules;

    impl RuleState for NoRules {
        fn chain_exists(&self, _table: &str, _chain: &str) -> bool {
            false
        }

        fn rule_exists(&self, _t: &str, _c: &str, _m: &str, _target: &str) -> bool {
            false
        }
    }

    fn pod_info() -> KubernetesPodInfo {
        KubernetesPodInfo {
            pod_name: "metrics-server-7d8c9".to_string(),
            pod_namespace: "kube-system".to_string(),
        }
    }

    fn cmd_args() -> CmdArgs {
        CmdArgs {
            container_id: "abc12345deadbeef".to_string(),
            netns: "/var/run/netns/ctr".to_string(),
            ifname: "eth0".to_string(),
            args: String::new(),
            path: String::new(),
        }
    }

    fn nw_cfg() -> NetworkConfig {
        serde_json::from_value(serde_json::json!({
            "cniVersion": "1.0.0",
            "name": "swiftnet",
            "type": "swiftnet-cni",
            "ipam": {"type": "node-service"}
        }))
        .unwrap()
    }

    fn default_info(pod_ip: &str, prefix: u8, nc_primary: &str, gateway: &str) -> PodIpInfo {
        PodIpInfo {
            pod_ip_config: IpSubnet {
                ip_address: pod_ip.to_string(),
                prefix_length: prefix,
            },
            network_container_primary_ip_config: IpConfiguration {
                ip_subnet: IpSubnet {
                    ip_address: nc_primary.to_string(),
                    prefix_length: prefix,
                },
                gateway_ip_address: gateway.to_string(),
            },
            host_primary_ip_info: HostIpInfo {
                subnet: "10.224.0.0/16".to_string(),
                primary_ip: "10.224.0.4".to_string(),
                gateway: "10.224.0.1".to_string(),
            },
            address_type: AddressType::Default,
            ..Default::default()
        }
    }

    fn secondary_info(pod_ip: &str, prefix: u8, mac: &str, claims_default: bool) -> PodIpInfo {
        PodIpInfo {
            pod_ip_config: IpSubnet {
                ip_address: pod_ip.to_string(),
                prefix_length: prefix,
            },
            address_type: AddressType::Secondary,
            mac_address: mac.to_string(),
            is_default_interface: claims_default,
            routes: vec![Route {
                ip_address: "10.5.0.0/16".to_string(),
                gateway_ip_address: "10.4.0.1".to_string(),
            }],
            ..Default::default()
        }
    }

    fn batch_ok(infos: Vec<PodIpInfo>) -> Result<IpConfigsResponse, ServiceError> {
        Ok(IpConfigsResponse {
            response: Default::default(),
            pod_ip_info: infos,
        })
    }

    fn invoker(
        service: MockService,
        mode: Option<IpamMode>,
    ) -> RemoteIpamInvoker<MockService, MockWatcher> {
        RemoteIpamInvoker::new(pod_info(), service, mode, MockWatcher::default())
            .with_rule_state(Box::new(NoRules))
    }

    fn run_add(
        invoker: &mut RemoteIpamInvoker<MockService, MockWatcher>,
        options: &mut EndpointOptions,
    ) -> Result<IpamAddResult, InvokerError> {
        let cfg = nw_cfg();
        let args = cmd_args();
        invoker.add(IpamAddConfig {
            nw_cfg: &cfg,
            args: Some(&args),
            subnet_prefix: None,
            options,
        })
    }

    #[test]
    fn test_add_requires_args() {
        let mut invoker = invoker(MockService::default(), None);
        let cfg = nw_cfg();
        let mut options = EndpointOptions::default();

        let err = invoker
            .add(IpamAddConfig {
                nw_cfg: &cfg,
                args: None,
                subnet_prefix: None,
                options: &mut options,
            })
            .unwrap_err();
        assert!(matches!(err, InvokerError::EmptyArgs));
    }

    #[test]
    fn test_happy_add_programs_host() {
        let service = MockService::default();
        service
            .request_batch
            .borrow_mut()
            .push_back(batch_ok(vec![default_info("10.1.2.3", 24, "10.1.2.0", "10.1.2.1")]));

        let mut invoker = invoker(service, None);
        let mut options = EndpointOptions::default();
        let result = run_add(&mut invoker, &mut options).unwrap();

        let ips = result.default_interface_info.ip_result.ips.as_ref().unwrap();
        assert_eq!(ips[0].address, "10.1.2.3/24");
        assert_eq!(ips[0].gateway.as_deref(), Some("10.1.2.1"));

        // backend sent no routes; the default route falls in
        let routes = result.default_interface_info.ip_result.routes.as_ref().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst, "0.0.0.0/0");
        assert_eq!(routes[0].gw.as_deref(), Some("10.1.2.1"));

        assert!(result.default_interface_info.is_default_interface);
        assert!(!result.ipv6_enabled);
        assert_eq!(result.host_subnet_prefix, Some("10.224.0.0/16".parse().unwrap()));

        assert_eq!(options.snat_ip, Some("10.1.2.0".parse().unwrap()));
        assert_eq!(options.iptables_commands.len(), 5);
        assert_eq!(options.routes.len(), 1);
        assert_eq!(options.routes[0].dst, "10.1.2.0/24".parse().unwrap());
    }

    #[test]
    fn test_overlay_synthesizes_v4_gateway() {
        let service = MockService::default();
        service
            .request_batch
            .borrow_mut()
            .push_back(batch_ok(vec![default_info("10.1.2.3", 24, "10.1.2.0", "")]));

        let mut invoker = invoker(service, Some(IpamMode::Overlay));
        let mut options = EndpointOptions::default();
        let result = run_add(&mut invoker, &mut options).unwrap();

        let ips = result.default_interface_info.ip_result.ips.as_ref().unwrap();
        assert_eq!(ips[0].address, "10.1.2.3/24");
        assert_eq!(ips[0].gateway.as_deref(), Some("10.1.2.1"));

        let routes = result.default_interface_info.ip_result.routes.as_ref().unwrap();
        assert_eq!(routes[0].dst, "0.0.0.0/0");
        assert_eq!(routes[0].gw.as_deref(), Some("10.1.2.1"));

        // overlay mode never programs the host
        assert!(options.iptables_commands.is_empty());
        assert!(options.routes.is_empty());
    }

    #[test]
    fn test_overlay_v6_uses_fixed_gateway() {
        let service = MockService::default();
        service.request_batch.borrow_mut().push_back(batch_ok(vec![default_info(
            "2001:db8:abcd:15::4",
            64,
            "2001:db8:abcd:15::",
            "",
        )]));

        let mut invoker = invoker(service, Some(IpamMode::DualStackOverlay));
        let mut options = EndpointOptions::default();
        let result = run_add(&mut invoker, &mut options).unwrap();

        assert!(result.ipv6_enabled);
        let ips = result.default_interface_info.ip_result.ips.as_ref().unwrap();
        assert_eq!(ips[0].gateway.as_deref(), Some("fe80::1234:5678:9abc"));

        let routes = result.default_interface_info.ip_result.routes.as_ref().unwrap();
        assert_eq!(routes[0].dst, "::/0");

        // v6 primary never becomes the SNAT source
        assert_eq!(options.snat_ip, None);
    }

    #[test]
    fn test_missing_gateway_outside_overlay_fails() {
        let service = MockService::default();
        service
            .request_batch
            .borrow_mut()
            .push_back(batch_ok(vec![default_info("10.1.2.3", 24, "10.1.2.0", "")]));

        let mut invoker = invoker(service, None);
        let mut options = EndpointOptions::default();

        assert!(matches!(
            run_add(&mut invoker, &mut options).unwrap_err(),
            InvokerError::InvalidGateway(_)
        ));
    }

    #[test]
    fn test_secondary_allocation_carries_mac_and_routes() {
        let service = MockService::default();
        service.request_batch.borrow_mut().push_back(batch_ok(vec![
            default_info("10.1.2.3", 24, "10.1.2.0", "10.1.2.1"),
            secondary_info("10.4.0.7", 16, "00:11:22:33:44:AB", false),
        ]));

        let mut invoker = invoker(service, None);
        let mut options = EndpointOptions::default();
        let result = run_add(&mut invoker, &mut options).unwrap();

        assert_eq!(result.secondary_interfaces.len(), 1);
        let secondary = &result.secondary_interfaces[0];
        assert_eq!(secondary.mac_address.as_deref(), Some("00:11:22:33:44:ab"));
        assert!(!secondary.is_default_interface);

        let ips = secondary.ip_result.ips.as_ref().unwrap();
        assert_eq!(ips[0].address, "10.4.0.7/16");

        let routes = secondary.ip_result.routes.as_ref().unwrap();
        assert_eq!(routes[0].dst, "10.5.0.0/16");

        assert!(result.default_interface_info.is_default_interface);
    }

    #[test]
    fn test_secondary_claim_unsets_default_flag() {
        let service = MockService::default();
        service.request_batch.borrow_mut().push_back(batch_ok(vec![
            default_info("10.1.2.3", 24, "10.1.2.0", "10.1.2.1"),
            secondary_info("10.4.0.7", 16, "00:11:22:33:44:55", true),
        ]));

        let mut invoker = invoker(service, None);
        let mut options = EndpointOptions::default();
        let result = run_add(&mut invoker, &mut options).unwrap();

        // the secondary's claim wins the default-interface role
        assert!(!result.default_interface_info.is_default_interface);
        assert!(result.secondary_interfaces[0].is_default_interface);
    }

    #[test]
    fn test_invalid_mac_fails_add() {
        let service = MockService::default();
        service.request_batch.borrow_mut().push_back(batch_ok(vec![
            secondary_info("10.4.0.7", 16, "not-a-mac", false),
        ]));

        let mut invoker = invoker(service, None);
        let mut options = EndpointOptions::default();

        assert!(matches!(
            run_add(&mut invoker, &mut options).unwrap_err(),
            InvokerError::InvalidMac(_)
        ));
    }

    #[test]
    fn test_second_default_appends_but_first_owns_options() {
        let service = MockService::default();
        service.request_batch.borrow_mut().push_back(batch_ok(vec![
            default_info("10.1.2.3", 24, "10.1.2.0", "10.1.2.1"),
            default_info("10.9.0.5", 24, "10.9.0.0", "10.9.0.1"),
        ]));

        let mut invoker = invoker(service, None);
        let mut options = EndpointOptions::default();
        let result = run_add(&mut invoker, &mut options).unwrap();

        let ips = result.default_interface_info.ip_result.ips.as_ref().unwrap();
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[1].address, "10.9.0.5/24");

        // side channels reflect the first default only
        assert_eq!(options.snat_ip, Some("10.1.2.0".parse().unwrap()));
        assert_eq!(options.routes[0].dst, "10.1.2.0/24".parse().unwrap());
        assert!(options
            .iptables_commands
            .iter()
            .all(|cmd| !cmd.match_expr.contains("10.9.0.0")));
    }

    #[test]
    fn test_unsupported_api_downgrades_once() {
        let service = MockService::default();
        service
            .request_batch
            .borrow_mut()
            .push_back(Err(ServiceError::UnsupportedApi("RequestIPs".to_string())));
        service.request_single.borrow_mut().push_back(Ok(IpConfigResponse {
            response: Default::default(),
            pod_ip_info: default_info("10.1.2.3", 24, "10.1.2.0", "10.1.2.1"),
        }));
        service.request_single.borrow_mut().push_back(Ok(IpConfigResponse {
            response: Default::default(),
            pod_ip_info: default_info("10.1.2.4", 24, "10.1.2.0", "10.1.2.1"),
        }));

        let mut invoker = invoker(service, None);

        let mut options = EndpointOptions::default();
        let result = run_add(&mut invoker, &mut options).unwrap();
        let ips = result.default_interface_info.ip_result.ips.as_ref().unwrap();
        assert_eq!(ips[0].address, "10.1.2.3/24");

        // the downgrade sticks: the second add never retries batch
        let mut options = EndpointOptions::default();
        run_add(&mut invoker, &mut options).unwrap();
        assert_eq!(
            *invoker.service.calls.borrow(),
            vec!["request_ips", "request_ip_address", "request_ip_address"]
        );
    }

    #[test]
    fn test_add_connection_failure_is_backend_unavailable() {
        let service = MockService::default();
        service
            .request_batch
            .borrow_mut()
            .push_back(Err(ServiceError::ConnectionFailure("refused".to_string())));

        let mut invoker = invoker(service, None);
        let mut options = EndpointOptions::default();

        assert!(matches!(
            run_add(&mut invoker, &mut options).unwrap_err(),
            InvokerError::BackendUnavailable(_)
        ));
    }

    #[test]
    fn test_empty_response_fails() {
        let service = MockService::default();
        service.request_batch.borrow_mut().push_back(batch_ok(Vec::new()));

        let mut invoker = invoker(service, None);
        let mut options = EndpointOptions::default();

        assert!(matches!(
            run_add(&mut invoker, &mut options).unwrap_err(),
            InvokerError::EmptyResponse
        ));
    }

    #[test]
    fn test_delete_requires_args() {
        let mut invoker = invoker(MockService::default(), None);
        let cfg = nw_cfg();
        let mut options = EndpointOptions::default();

        assert!(matches!(
            invoker.delete(None, &cfg, None, &mut options).unwrap_err(),
            InvokerError::EmptyArgs
        ));
    }

    #[test]
    fn test_delete_sends_desired_address() {
        let service = MockService::default();
        service.release_batch.borrow_mut().push_back(Ok(()));

        let mut invoker = invoker(service, None);
        let cfg = nw_cfg();
        let args = cmd_args();
        let mut options = EndpointOptions::default();

        invoker
            .delete(
                Some("10.1.2.3/24".parse().unwrap()),
                &cfg,
                Some(&args),
                &mut options,
            )
            .unwrap();

        assert_eq!(
            *invoker.service.released.borrow(),
            vec![vec!["10.1.2.3".to_string()]]
        );
    }

    #[test]
    fn test_delete_without_address_releases_interface_binding() {
        let service = MockService::default();
        service.release_batch.borrow_mut().push_back(Ok(()));

        let mut invoker = invoker(service, None);
        let cfg = nw_cfg();
        let args = cmd_args();
        let mut options = EndpointOptions::default();

        invoker.delete(None, &cfg, Some(&args), &mut options).unwrap();
        assert_eq!(*invoker.service.released.borrow(), vec![Vec::<String>::new()]);
    }

    #[test]
    fn test_delete_connection_failure_defers_release() {
        let service = MockService::default();
        service
            .release_batch
            .borrow_mut()
            .push_back(Err(ServiceError::ConnectionFailure("refused".to_string())));

        let mut invoker = invoker(service, None);
        let cfg = nw_cfg();
        let args = cmd_args();
        let mut options = EndpointOptions::default();

        invoker.delete(None, &cfg, Some(&args), &mut options).unwrap();

        assert_eq!(
            *invoker.watcher.enqueued.borrow(),
            vec![("abc12345-eth0".to_string(), "abc12345deadbeef".to_string())]
        );
    }

    #[test]
    fn test_delete_connection_failure_writes_queue_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let service = MockService::default();
        service
            .release_batch
            .borrow_mut()
            .push_back(Err(ServiceError::ConnectionFailure("refused".to_string())));

        let mut invoker = RemoteIpamInvoker::new(
            pod_info(),
            service,
            None,
            FsDeleteWatcher::with_dir(tmp.path()),
        )
        .with_rule_state(Box::new(NoRules));

        let cfg = nw_cfg();
        let args = cmd_args();
        let mut options = EndpointOptions::default();
        invoker.delete(None, &cfg, Some(&args), &mut options).unwrap();

        let queued = tmp.path().join("abc12345-eth0");
        assert_eq!(std::fs::read_to_string(queued).unwrap(), "abc12345deadbeef");
    }

    #[test]
    fn test_delete_singleton_connection_failure_also_defers() {
        let service = MockService::default();
        service
            .release_batch
            .borrow_mut()
            .push_back(Err(ServiceError::UnsupportedApi("ReleaseIPs".to_string())));
        service
            .release_single
            .borrow_mut()
            .push_back(Err(ServiceError::ConnectionFailure("refused".to_string())));

        let mut invoker = invoker(service, None);
        let cfg = nw_cfg();
        let args = cmd_args();
        let mut options = EndpointOptions::default();

        invoker.delete(None, &cfg, Some(&args), &mut options).unwrap();
        assert_eq!(invoker.watcher.enqueued.borrow().len(), 1);
    }

    #[test]
    fn test_delete_service_error_is_release_failed() {
        let service = MockService::default();
        service.release_batch.borrow_mut().push_back(Err(ServiceError::Service {
            return_code: 21,
            message: "not found".to_string(),
        }));

        let mut invoker = invoker(service, None);
        let cfg = nw_cfg();
        let args = cmd_args();
        let mut options = EndpointOptions::default();

        assert!(matches!(
            invoker.delete(None, &cfg, Some(&args), &mut options).unwrap_err(),
            InvokerError::ReleaseFailed(_)
        ));
    }

    #[test]
    fn test_enqueue_failure_surfaces() {
        let service = MockService::default();
        service
            .release_batch
            .borrow_mut()
            .push_back(Err(ServiceError::ConnectionFailure("refused".to_string())));

        let mut invoker = RemoteIpamInvoker::new(
            pod_info(),
            service,
            None,
            MockWatcher {
                fail: true,
                ..Default::default()
            },
        )
        .with_rule_state(Box::new(NoRules));

        let cfg = nw_cfg();
        let args = cmd_args();
        let mut options = EndpointOptions::default();

        assert!(matches!(
            invoker.delete(None, &cfg, Some(&args), &mut options).unwrap_err(),
            InvokerError::DeferredEnqueue { .. }
        ));
    }

    #[test]
    fn test_orchestrator_context_is_injective() {
        let pods = [
            ("web", "default"),
            ("web", "staging"),
            ("api", "default"),
            ("we", "bdefault"),
        ];

        let contexts: Vec<Vec<u8>> = pods
            .iter()
            .map(|(name, namespace)| {
                serde_json::to_vec(&KubernetesPodInfo {
                    pod_name: name.to_string(),
                    pod_namespace: namespace.to_string(),
                })
                .unwrap()
            })
            .collect();

        for i in 0..contexts.len() {
            for j in (i + 1)..contexts.len() {
                assert_ne!(contexts[i], contexts[j]);
            }
        }
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("00:11:22:33:44:AB").unwrap(), "00:11:22:33:44:ab");
        assert_eq!(parse_mac("00-11-22-33-44-ab").unwrap(), "00:11:22:33:44:ab");
        assert!(parse_mac("").is_err());
        assert!(parse_mac("00:11:22:33:44").is_err());
        assert!(parse_mac("00:11:22:33:44:GG").is_err());
    }

    #[test]
    fn test_overlay_gateway_v4() {
        let subnet: IpNet = "10.1.2.0/24".parse().unwrap();
        assert_eq!(
            overlay_gateway_v4(&subnet).unwrap(),
            "10.1.2.1".parse::<IpAddr>().unwrap()
        );

        let tiny: IpNet = "10.1.2.0/31".parse().unwrap();
        assert!(overlay_gateway_v4(&tiny).is_err());
    }
}
