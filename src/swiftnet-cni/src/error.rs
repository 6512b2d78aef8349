//! CNI error types
//!
//! Wire-level error codes per CNI Spec 1.0.0, plus the typed errors the
//! IPAM invoker layer raises internally. Invoker errors keep their
//! sentinels matchable so callers can branch on them; they are only
//! flattened into a wire error at the plugin boundary.

use thiserror::Error;

use crate::client::ServiceError;
use crate::result::IpamAddResult;

/// CNI error codes as defined in the specification
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(dead_code)] // Some variants reserved for future use
pub enum CniErrorCode {
    /// 1: Incompatible CNI version
    IncompatibleVersion = 1,

    /// 2: Unsupported field in network configuration
    UnsupportedField = 2,

    /// 3: Container unknown or does not exist
    UnknownContainer = 3,

    /// 4: Invalid necessary environment variables
    InvalidEnvironmentVariables = 4,

    /// 5: I/O failure
    IoFailure = 5,

    /// 6: Failed to decode content
    DecodingFailure = 6,

    /// 7: Invalid network config
    InvalidNetworkConfig = 7,

    /// 11: Try again later
    TryAgainLater = 11,

    // Plugin-specific errors (100+)

    /// 100: Delegated IPAM plugin failure
    IpamFailure = 100,

    /// 101: Delegated IPAM plugin has no address pools left
    NoAvailableAddressPools = 101,

    /// 102: Node-local address manager failure
    AddressManagerFailure = 102,

    /// 103: Host NAT programming failure
    HostProgrammingFailure = 103,
}

/// CNI error with code, message, and optional details
#[derive(Debug, Error)]
#[error("{msg}")]
pub struct CniError {
    code: CniErrorCode,
    msg: String,
    details: Option<String>,
}

impl CniError {
    /// Create a new CNI error
    pub fn new(code: CniErrorCode, msg: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
            details: None,
        }
    }

    /// Add details to the error
    pub fn with_details(mut self, details: &str) -> Self {
        self.details = Some(details.to_string());
        self
    }

    /// Get the error code
    pub fn code(&self) -> CniErrorCode {
        self.code
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Get the error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }
}

/// Errors raised by the IPAM invokers.
///
/// `UnsupportedApi` and connection failures from the address manager never
/// appear here: the remote invoker recovers from both locally (singleton
/// fallback and deferred delete respectively).
#[derive(Debug, Error)]
pub enum InvokerError {
    /// The CNI argument envelope was missing entirely.
    #[error("empty CNI cmd args not allowed")]
    EmptyArgs,

    /// An IP address or CIDR in a response or config failed to parse.
    #[error("unable to parse address {0}")]
    InvalidAddress(String),

    /// A MAC address in a response failed to parse.
    #[error("invalid mac address {0}")]
    InvalidMac(String),

    /// The backend supplied no usable gateway and the IPAM mode does not
    /// allow synthesizing one.
    #[error("gateway address {0:?} from response is invalid")]
    InvalidGateway(String),

    /// The node-side primary IP, gateway, or subnet failed to parse.
    #[error("host address {0:?} from response is invalid")]
    InvalidHostAddress(String),

    /// The delegated v4 plugin has no address pools left. Surfaced
    /// verbatim so callers can wipe cached IPAM state and retry.
    #[error("no available address pools")]
    PoolExhausted,

    /// A delegated IPAM plugin invocation failed.
    #[error("delegated plugin {plugin} failed")]
    Delegate {
        plugin: String,
        #[source]
        source: CniError,
    },

    /// The v6 plugin failed after the v4 allocation succeeded. Carries the
    /// partial v4 aggregate so the caller can log what was rolled back.
    #[error("ipv6 allocation failed after ipv4 success")]
    V6AddFailed {
        partial: Box<IpamAddResult>,
        #[source]
        source: Box<InvokerError>,
    },

    /// Failed to serialize the pod identity for the backend.
    #[error("failed to serialize orchestrator context")]
    OrchestratorContext(#[source] serde_json::Error),

    /// The address manager rejected or could not serve an allocation.
    #[error("failed to get address from the address manager")]
    BackendUnavailable(#[source] ServiceError),

    /// The address manager returned a response carrying no pod addresses.
    #[error("address manager response contained no pod addresses")]
    EmptyResponse,

    /// The address manager rejected a release.
    #[error("failed to release address from the address manager")]
    ReleaseFailed(#[source] ServiceError),

    /// A release could not be completed synchronously and the deferred
    /// delete queue itself was unwritable.
    #[error("failed to enqueue deferred delete for {pod_interface_id}")]
    DeferredEnqueue {
        pod_interface_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<InvokerError> for CniError {
    fn from(err: InvokerError) -> Self {
        let code = match &err {
            InvokerError::EmptyArgs => CniErrorCode::InvalidEnvironmentVariables,
            InvokerError::InvalidAddress(_)
            | InvokerError::InvalidMac(_)
            | InvokerError::InvalidGateway(_)
            | InvokerError::InvalidHostAddress(_) => CniErrorCode::DecodingFailure,
            InvokerError::PoolExhausted => CniErrorCode::NoAvailableAddressPools,
            InvokerError::Delegate { .. } | InvokerError::V6AddFailed { .. } => {
                CniErrorCode::IpamFailure
            }
            InvokerError::OrchestratorContext(_)
            | InvokerError::BackendUnavailable(_)
            | InvokerError::EmptyResponse
            | InvokerError::ReleaseFailed(_) => CniErrorCode::AddressManagerFailure,
            InvokerError::DeferredEnqueue { .. } => CniErrorCode::IoFailure,
        };

        let details = std::error::Error::source(&err).map(|s| s.to_string());
        let mut cni = CniError::new(code, &err.to_string());
        if let Some(details) = details {
            cni = cni.with_details(&details);
        }
        cni
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(CniErrorCode::IncompatibleVersion as u32, 1);
        assert_eq!(CniErrorCode::IoFailure as u32, 5);
        assert_eq!(CniErrorCode::NoAvailableAddressPools as u32, 101);
    }

    #[test]
    fn test_error_with_details() {
        let err = CniError::new(CniErrorCode::IoFailure, "read failed")
            .with_details("permission denied");

        assert_eq!(err.code(), CniErrorCode::IoFailure);
        assert_eq!(err.message(), "read failed");
        assert_eq!(err.details(), Some("permission denied"));
    }

    #[test]
    fn test_pool_exhaustion_maps_to_sentinel_code() {
        let cni: CniError = InvokerError::PoolExhausted.into();
        assert_eq!(cni.code(), CniErrorCode::NoAvailableAddressPools);
    }

    #[test]
    fn test_empty_args_maps_to_env_code() {
        let cni: CniError = InvokerError::EmptyArgs.into();
        assert_eq!(cni.code(), CniErrorCode::InvalidEnvironmentVariables);
    }

    #[test]
    fn test_delegate_error_keeps_source_in_details() {
        let cni: CniError = InvokerError::Delegate {
            plugin: "swiftnet-ipam".to_string(),
            source: CniError::new(CniErrorCode::IpamFailure, "plugin exploded"),
        }
        .into();

        assert_eq!(cni.code(), CniErrorCode::IpamFailure);
        assert_eq!(cni.details(), Some("plugin exploded"));
    }
}
