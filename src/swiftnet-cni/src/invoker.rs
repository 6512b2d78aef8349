//! IPAM invoker facade
//!
//! The single surface the CNI entry point drives. Two backends satisfy
//! the contract: delegation to co-located IPAM plugins, and the
//! node-local address manager. The entry point picks one from the
//! network config and stays oblivious to which is active.

use std::net::Ipv4Addr;

use ipnet::IpNet;

use crate::client::AddressManagerClient;
use crate::config::{CmdArgs, NetworkConfig};
use crate::error::{CniError, CniErrorCode, InvokerError};
use crate::iptables::IptablesCommand;
use crate::local::{ExecDelegate, LocalIpamInvoker};
use crate::remote::RemoteIpamInvoker;
use crate::result::IpamAddResult;
use crate::routes::RouteInfo;
use crate::watcher::FsDeleteWatcher;

/// Carrier for the side-channel values an ADD hands to endpoint creation.
/// Only the adapter handling the default allocation writes here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointOptions {
    /// v4 SNAT source for pod traffic; never set for v6
    pub snat_ip: Option<Ipv4Addr>,

    /// Routes to program in the pod namespace
    pub routes: Vec<RouteInfo>,

    /// Deferred, idempotent NAT rule installations
    pub iptables_commands: Vec<IptablesCommand>,
}

/// Inputs to an ADD
pub struct IpamAddConfig<'a> {
    pub nw_cfg: &'a NetworkConfig,

    /// Argument envelope; the remote backend requires it
    pub args: Option<&'a CmdArgs>,

    /// Node subnet for the local backend's result
    pub subnet_prefix: Option<IpNet>,

    pub options: &'a mut EndpointOptions,
}

/// An address backend: acquires identities on ADD, releases them on DEL.
pub trait IpamInvoker {
    fn add(&mut self, config: IpamAddConfig<'_>) -> Result<IpamAddResult, InvokerError>;

    /// A `None` address is permitted only for the remote backend and
    /// means "release whatever is bound to this pod interface".
    fn delete(
        &mut self,
        address: Option<IpNet>,
        nw_cfg: &NetworkConfig,
        args: Option<&CmdArgs>,
        options: &mut EndpointOptions,
    ) -> Result<(), InvokerError>;
}

/// Build the invoker the network config selects
pub fn create_ipam_invoker(
    nw_cfg: &NetworkConfig,
    args: &CmdArgs,
) -> Result<Box<dyn IpamInvoker>, CniError> {
    if nw_cfg.uses_node_service() {
        let pod_info = args.pod_info()?;
        let endpoint = nw_cfg
            .ipam
            .endpoint
            .clone()
            .unwrap_or_else(|| crate::client::DEFAULT_ENDPOINT.to_string());

        let client = AddressManagerClient::new(&endpoint).map_err(|e| {
            CniError::new(
                CniErrorCode::AddressManagerFailure,
                "failed to create address manager client",
            )
            .with_details(&e.to_string())
        })?;

        Ok(Box::new(RemoteIpamInvoker::new(
            pod_info,
            client,
            nw_cfg.ipam.mode,
            FsDeleteWatcher::new(),
        )))
    } else {
        Ok(Box::new(LocalIpamInvoker::new(
            ExecDelegate::new(&args.path),
            nw_cfg,
        )))
    }
}
