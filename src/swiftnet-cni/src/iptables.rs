//! Host NAT programming
//!
//! Builds the SNAT rules that steer pod-sourced infrastructure traffic:
//! DNS (UDP and TCP) is SNAT'd to the network container's primary IP, and
//! instance-metadata traffic to the node's primary IP. Rules live in a
//! dedicated NAT chain reached from POSTROUTING. Every rule is
//! check-then-install; the output is a list of deferred command
//! descriptors for the endpoint configurator, not immediate syscalls.

use std::net::IpAddr;
use std::process::Command;

use ipnet::IpNet;
use tracing::debug;

use crate::error::InvokerError;
use crate::invoker::EndpointOptions;
use crate::routes::RouteInfo;

/// NAT table name
pub const NAT_TABLE: &str = "nat";

/// Built-in chain the dedicated chain is reached from
pub const POSTROUTING_CHAIN: &str = "POSTROUTING";

/// Dedicated chain for pod SNAT rules
pub const SWIFT_CHAIN: &str = "CNI-SWIFT";

/// Well-known infrastructure DNS resolver
pub const INFRA_DNS_IP: &str = "168.63.129.16";

/// Well-known instance metadata service
pub const IMDS_IP: &str = "169.254.169.254";

const DNS_PORT: u16 = 53;
const HTTP_PORT: u16 = 80;

/// How a deferred command mutates the ruleset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    /// Create the chain
    NewChain,
    /// Append a rule at the end of the chain
    Append,
    /// Insert a rule at the head of the chain
    Insert,
}

/// One deferred, idempotent rule-installation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesCommand {
    pub op: RuleOp,
    pub table: String,
    pub chain: String,
    /// Match portion of the rule, empty for plain jumps
    pub match_expr: String,
    /// Jump target, including any target options
    pub target: String,
}

impl IptablesCommand {
    fn new_chain(table: &str, chain: &str) -> Self {
        Self {
            op: RuleOp::NewChain,
            table: table.to_string(),
            chain: chain.to_string(),
            match_expr: String::new(),
            target: String::new(),
        }
    }

    fn append(table: &str, chain: &str, match_expr: &str, target: &str) -> Self {
        Self {
            op: RuleOp::Append,
            table: table.to_string(),
            chain: chain.to_string(),
            match_expr: match_expr.to_string(),
            target: target.to_string(),
        }
    }

    fn insert(table: &str, chain: &str, match_expr: &str, target: &str) -> Self {
        Self {
            op: RuleOp::Insert,
            table: table.to_string(),
            chain: chain.to_string(),
            match_expr: match_expr.to_string(),
            target: target.to_string(),
        }
    }

    /// Render the full iptables invocation for this command
    pub fn render(&self) -> String {
        match self.op {
            RuleOp::NewChain => format!("iptables -w -t {} -N {}", self.table, self.chain),
            RuleOp::Append => format!(
                "iptables -w -t {} -A {}{} -j {}",
                self.table, self.chain, self.match_expr, self.target
            ),
            RuleOp::Insert => format!(
                "iptables -w -t {} -I {}{} -j {}",
                self.table, self.chain, self.match_expr, self.target
            ),
        }
    }
}

/// Existence checks against the live ruleset. The production
/// implementation queries the system iptables binary; tests substitute a
/// canned view.
pub trait RuleState {
    fn chain_exists(&self, table: &str, chain: &str) -> bool;

    fn rule_exists(&self, table: &str, chain: &str, match_expr: &str, target: &str) -> bool;
}

/// Queries the host's iptables binary
pub struct SystemRuleState;

impl RuleState for SystemRuleState {
    fn chain_exists(&self, table: &str, chain: &str) -> bool {
        run_iptables(&["-w", "-t", table, "-nL", chain])
    }

    fn rule_exists(&self, table: &str, chain: &str, match_expr: &str, target: &str) -> bool {
        let mut args = vec!["-w", "-t", table, "-C", chain];
        args.extend(match_expr.split_whitespace());
        args.push("-j");
        args.extend(target.split_whitespace());
        run_iptables(&args)
    }
}

fn run_iptables(args: &[&str]) -> bool {
    Command::new("iptables")
        .args(args)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Host-side inputs for one default allocation
#[derive(Debug, Clone)]
pub struct HostInfo<'a> {
    pub nc_primary_ip: &'a str,
    pub host_primary_ip: &'a str,
    pub host_gateway: &'a str,
}

/// Program the host for a non-overlay default allocation: a route to the
/// network container subnet via the host gateway, and the SNAT ruleset
/// for DNS and metadata traffic.
pub fn set_host_options(
    nc_subnet: IpNet,
    host: &HostInfo<'_>,
    options: &mut EndpointOptions,
    state: &dyn RuleState,
) -> Result<(), InvokerError> {
    let _host_ip: IpAddr = host
        .host_primary_ip
        .parse()
        .map_err(|_| InvokerError::InvalidHostAddress(host.host_primary_ip.to_string()))?;

    let host_gateway: IpAddr = host
        .host_gateway
        .parse()
        .map_err(|_| InvokerError::InvalidHostAddress(host.host_gateway.to_string()))?;

    // traffic to sibling-node pods in the nc subnet goes via the host gateway
    options.routes = vec![RouteInfo {
        dst: nc_subnet,
        gw: host_gateway,
    }];

    let dns_udp_match = format!(
        " -m addrtype ! --dst-type local -s {} -d {} -p udp --dport {}",
        nc_subnet, INFRA_DNS_IP, DNS_PORT
    );
    let dns_tcp_match = format!(
        " -m addrtype ! --dst-type local -s {} -d {} -p tcp --dport {}",
        nc_subnet, INFRA_DNS_IP, DNS_PORT
    );
    let imds_match = format!(
        " -m addrtype ! --dst-type local -s {} -d {} -p tcp --dport {}",
        nc_subnet, IMDS_IP, HTTP_PORT
    );

    let snat_primary_ip = format!("SNAT --to {}", host.nc_primary_ip);
    let snat_host_ip = format!("SNAT --to {}", host.host_primary_ip);

    let mut commands = Vec::new();

    if !state.chain_exists(NAT_TABLE, SWIFT_CHAIN) {
        commands.push(IptablesCommand::new_chain(NAT_TABLE, SWIFT_CHAIN));
    }

    if !state.rule_exists(NAT_TABLE, POSTROUTING_CHAIN, "", SWIFT_CHAIN) {
        commands.push(IptablesCommand::append(
            NAT_TABLE,
            POSTROUTING_CHAIN,
            "",
            SWIFT_CHAIN,
        ));
    }

    if !state.rule_exists(NAT_TABLE, SWIFT_CHAIN, &dns_udp_match, &snat_primary_ip) {
        commands.push(IptablesCommand::insert(
            NAT_TABLE,
            SWIFT_CHAIN,
            &dns_udp_match,
            &snat_primary_ip,
        ));
    }

    if !state.rule_exists(NAT_TABLE, SWIFT_CHAIN, &dns_tcp_match, &snat_primary_ip) {
        commands.push(IptablesCommand::insert(
            NAT_TABLE,
            SWIFT_CHAIN,
            &dns_tcp_match,
            &snat_primary_ip,
        ));
    }

    if !state.rule_exists(NAT_TABLE, SWIFT_CHAIN, &imds_match, &snat_host_ip) {
        commands.push(IptablesCommand::insert(
            NAT_TABLE,
            SWIFT_CHAIN,
            &imds_match,
            &snat_host_ip,
        ));
    }

    debug!(count = commands.len(), "queued host NAT commands");
    options.iptables_commands = commands;

    Ok(())
}
