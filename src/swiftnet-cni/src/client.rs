//! Address manager client
//!
//! HTTP client for the node-local address management service, reached over
//! a loopback endpoint. The service exposes a batch API (`RequestIPs` /
//! `ReleaseIPs`) and an older singleton API (`RequestIPAddress` /
//! `ReleaseIPAddress`); both are surfaced here so the invoker can
//! negotiate between them. The plugin runs synchronously, so the client
//! owns a runtime and blocks on each call.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Runtime;

use crate::result::AddressType;

/// Default loopback endpoint of the address manager
pub const DEFAULT_ENDPOINT: &str = "http://localhost:10090";

/// Default timeout for address manager requests
const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Service return code signalling an API the server does not implement
const UNSUPPORTED_API_RETURN_CODE: i32 = 254;

/// Errors that can occur when communicating with the address manager
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("address manager does not support {0}")]
    UnsupportedApi(String),

    #[error("address manager connection failed: {0}")]
    ConnectionFailure(String),

    #[error("address manager request failed: HTTP {0}")]
    Http(u16),

    #[error("address manager returned {return_code}: {message}")]
    Service { return_code: i32, message: String },

    #[error("address manager returned unexpected response: {0}")]
    Decode(String),
}

impl ServiceError {
    /// Convert a reqwest error to a ServiceError
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ServiceError::ConnectionFailure(e.to_string())
        } else {
            ServiceError::Decode(e.to_string())
        }
    }

    /// Whether the server refused this API shape (fallback is possible)
    pub fn is_unsupported_api(&self) -> bool {
        matches!(self, ServiceError::UnsupportedApi(_))
    }

    /// Whether the server socket was unreachable (release can be deferred)
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, ServiceError::ConnectionFailure(_))
    }
}

/// Batch request envelope for one pod interface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfigsRequest {
    /// Opaque serialized pod identity
    pub orchestrator_context: Vec<u8>,

    /// Stable identifier of the pod interface being allocated
    #[serde(rename = "podInterfaceID")]
    pub pod_interface_id: String,

    /// Runtime-assigned id of the infra container
    #[serde(rename = "infraContainerID")]
    pub infra_container_id: String,

    /// Specific addresses to act on (release only)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub desired_ip_addresses: Vec<String>,
}

/// Singleton request envelope (older API, one allocation per call)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfigRequest {
    pub orchestrator_context: Vec<u8>,

    #[serde(rename = "podInterfaceID")]
    pub pod_interface_id: String,

    #[serde(rename = "infraContainerID")]
    pub infra_container_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_ip_address: Option<String>,
}

/// Status carried on every service response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    pub return_code: i32,

    #[serde(default)]
    pub message: String,
}

/// Batch allocation response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfigsResponse {
    pub response: ServiceResponse,

    #[serde(default)]
    pub pod_ip_info: Vec<PodIpInfo>,
}

/// Singleton allocation response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfigResponse {
    pub response: ServiceResponse,

    #[serde(default)]
    pub pod_ip_info: PodIpInfo,
}

/// Release response carries only the status envelope
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseResponse {
    response: ServiceResponse,
}

/// Address plus prefix length
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpSubnet {
    pub ip_address: String,

    #[serde(default)]
    pub prefix_length: u8,
}

/// Primary IP configuration of the network container backing a pod
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfiguration {
    #[serde(default)]
    pub ip_subnet: IpSubnet,

    #[serde(rename = "gatewayIPAddress", default)]
    pub gateway_ip_address: String,
}

/// Node-side addressing for the host that owns the network container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostIpInfo {
    #[serde(default)]
    pub subnet: String,

    #[serde(rename = "primaryIP", default)]
    pub primary_ip: String,

    #[serde(default)]
    pub gateway: String,
}

/// Backend-native route descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Destination in CIDR notation
    #[serde(rename = "ipAddress")]
    pub ip_address: String,

    #[serde(rename = "gatewayIPAddress", default)]
    pub gateway_ip_address: String,
}

/// One allocated address with its network container and host context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodIpInfo {
    #[serde(rename = "podIPConfig")]
    pub pod_ip_config: IpSubnet,

    #[serde(rename = "networkContainerPrimaryIPConfig", default)]
    pub network_container_primary_ip_config: IpConfiguration,

    #[serde(rename = "hostPrimaryIPInfo", default)]
    pub host_primary_ip_info: HostIpInfo,

    #[serde(default)]
    pub address_type: AddressType,

    #[serde(default)]
    pub mac_address: String,

    #[serde(default)]
    pub is_default_interface: bool,

    #[serde(default)]
    pub routes: Vec<Route>,
}

/// The address-manager operations the invoker consumes. Split out as a
/// trait so the invoker can be exercised against a mock service.
pub trait AddressService {
    fn request_ips(&self, req: &IpConfigsRequest) -> Result<IpConfigsResponse, ServiceError>;

    fn request_ip_address(&self, req: &IpConfigRequest) -> Result<IpConfigResponse, ServiceError>;

    fn release_ips(&self, req: &IpConfigsRequest) -> Result<(), ServiceError>;

    fn release_ip_address(&self, req: &IpConfigRequest) -> Result<(), ServiceError>;
}

/// HTTP client for the address manager
pub struct AddressManagerClient {
    http: reqwest::Client,
    base_url: String,
    rt: Runtime,
}

impl AddressManagerClient {
    /// Create a client against the given base URL
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to create HTTP client")?;

        let rt = Runtime::new().context("failed to create tokio runtime")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            rt,
        })
    }

    fn post<B, R>(&self, path: &str, body: &B) -> Result<R, ServiceError>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path);

        self.rt.block_on(async {
            let response = self
                .http
                .post(&url)
                .json(body)
                .send()
                .await
                .map_err(ServiceError::from_reqwest)?;

            if response.status() == StatusCode::NOT_FOUND {
                return Err(ServiceError::UnsupportedApi(path.to_string()));
            }

            if !response.status().is_success() {
                return Err(ServiceError::Http(response.status().as_u16()));
            }

            response
                .json::<R>()
                .await
                .map_err(|e| ServiceError::Decode(e.to_string()))
        })
    }
}

/// Check the status envelope every endpoint returns
fn check_response(api: &str, response: &ServiceResponse) -> Result<(), ServiceError> {
    match response.return_code {
        0 => Ok(()),
        UNSUPPORTED_API_RETURN_CODE => Err(ServiceError::UnsupportedApi(api.to_string())),
        code => Err(ServiceError::Service {
            return_code: code,
            message: response.message.clone(),
        }),
    }
}

impl AddressService for AddressManagerClient {
    fn request_ips(&self, req: &IpConfigsRequest) -> Result<IpConfigsResponse, ServiceError> {
        let response: IpConfigsResponse = self.post("RequestIPs", req)?;
        check_response("RequestIPs", &response.response)?;
        Ok(response)
    }

    fn request_ip_address(&self, req: &IpConfigRequest) -> Result<IpConfigResponse, ServiceError> {
        let response: IpConfigResponse = self.post("RequestIPAddress", req)?;
        check_response("RequestIPAddress", &response.response)?;
        Ok(response)
    }

    fn release_ips(&self, req: &IpConfigsRequest) -> Result<(), ServiceError> {
        let response: ReleaseResponse = self.post("ReleaseIPs", req)?;
        check_response("ReleaseIPs", &response.response)
    }

    fn release_ip_address(&self, req: &IpConfigRequest) -> Result<(), ServiceError> {
        let response: ReleaseResponse = self.post("ReleaseIPAddress", req)?;
        check_response("ReleaseIPAddress", &response.response)
    }
}
