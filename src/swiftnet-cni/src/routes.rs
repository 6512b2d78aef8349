//! Route translation
//!
//! Converts backend-native route descriptors (destination CIDR string plus
//! gateway string) into validated CNI routing entries. The whole request
//! fails on the first entry that does not parse, and a destination whose
//! address family differs from its gateway's is rejected.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::client::Route;
use crate::error::InvokerError;
use crate::result::RouteConfig;

/// Routing entry carried in the endpoint options for the pod namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub dst: IpNet,
    pub gw: IpAddr,
}

/// Translate backend routes into CNI routing entries
pub fn translate_routes(routes: &[Route]) -> Result<Vec<RouteConfig>, InvokerError> {
    let mut translated = Vec::with_capacity(routes.len());

    for route in routes {
        let dst: IpNet = route
            .ip_address
            .parse()
            .map_err(|_| InvokerError::InvalidAddress(route.ip_address.clone()))?;

        let gw: IpAddr = route
            .gateway_ip_address
            .parse()
            .map_err(|_| InvokerError::InvalidGateway(route.gateway_ip_address.clone()))?;

        if dst.addr().is_ipv4() != gw.is_ipv4() {
            return Err(InvokerError::InvalidGateway(route.gateway_ip_address.clone()));
        }

        translated.push(RouteConfig {
            dst: dst.to_string(),
            gw: Some(gw.to_string()),
        });
    }

    Ok(translated)
}
