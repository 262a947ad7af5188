//! Upstream server sections and the shared server-status table.
//!
//! Configuration groups upstreams into sections; each section says
//! which names it serves (ordered include/exclude rules), how its
//! answers are to be cached (purge/nocache/rootserver flags), how far
//! it is trusted, and which answer addresses to reject.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dns_cache::entry::{Flags, CF_NOCACHE, CF_NOPURGE, CF_ROOTSERV};
use dns_types::protocol::types::DomainName;

/// One include/exclude rule.  Rules are checked in order; the first
/// whose suffix encloses the queried name decides.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InExRule {
    pub include: bool,
    pub suffix: DomainName,
}

/// What to do when an upstream's answer contains a rejected address.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RejectPolicy {
    /// Discard the reply and try the next server.
    Fail,
    /// Treat the reply as an authoritative NXDOMAIN.
    Negate,
}

/// One configured group of upstream servers.
#[derive(Debug, Clone)]
pub struct ServerSection {
    /// For logs and the control channel.
    pub label: String,

    pub addresses: Vec<IpAddr>,
    pub port: u16,

    /// Per-exchange timeout for servers in this section.
    pub timeout: Duration,

    /// These addresses are root servers: resolution walks the
    /// delegation tree from here instead of asking them to recurse.
    pub rootserver: bool,

    /// Ask this (non-root) server to do the recursion itself, and do
    /// not fall back to walking delegations.
    pub proxy_only: bool,

    /// `false` flags everything from this section NOPURGE.
    pub purge_cache: bool,

    /// Serve this section's answers once and evict them.
    pub nocache: bool,

    /// A trusted server may hand us records for any owner name; an
    /// untrusted one only for names inside the delegation that led to
    /// it (meaningful in paranoid mode).
    pub trusted: bool,

    /// Ordered name rules.
    pub rules: Vec<InExRule>,

    /// Applied when no rule matches.
    pub default_include: bool,

    pub reject_v4: Vec<(Ipv4Addr, u8)>,
    pub reject_v6: Vec<(Ipv6Addr, u8)>,
    pub reject_policy: RejectPolicy,
}

impl ServerSection {
    /// Whether this section serves the given name.
    pub fn applies_to(&self, name: &DomainName) -> bool {
        for rule in &self.rules {
            if name.is_subdomain_of(&rule.suffix) {
                return rule.include;
            }
        }
        self.default_include
    }

    /// The cache flags data from this section carries.
    pub fn cache_flags(&self) -> Flags {
        let mut flags = 0;
        if !self.purge_cache {
            flags |= CF_NOPURGE;
        }
        if self.nocache {
            flags |= CF_NOCACHE;
        }
        if self.rootserver {
            flags |= CF_ROOTSERV;
        }
        flags
    }

    /// Whether an address in an answer hits this section's reject
    /// list.
    pub fn rejects(&self, address: IpAddr) -> bool {
        match address {
            IpAddr::V4(addr) => self
                .reject_v4
                .iter()
                .any(|(net, bits)| v4_prefix_match(addr, *net, *bits)),
            IpAddr::V6(addr) => self
                .reject_v6
                .iter()
                .any(|(net, bits)| v6_prefix_match(addr, *net, *bits)),
        }
    }
}

fn v4_prefix_match(addr: Ipv4Addr, net: Ipv4Addr, bits: u8) -> bool {
    if bits == 0 {
        return true;
    }
    let bits = bits.min(32);
    let mask = u32::MAX << (32 - u32::from(bits));
    (u32::from(addr) & mask) == (u32::from(net) & mask)
}

fn v6_prefix_match(addr: Ipv6Addr, net: Ipv6Addr, bits: u8) -> bool {
    if bits == 0 {
        return true;
    }
    let bits = bits.min(128);
    let mask = u128::MAX << (128 - u32::from(bits));
    (u128::from(addr) & mask) == (u128::from(net) & mask)
}

/// How urgently a server wants re-testing by the status probe.
pub const NEEDS_TESTING_SOON: u8 = 1;
pub const NEEDS_TESTING_NOW: u8 = 2;

/// Runtime state of one upstream address.
#[derive(Debug, Copy, Clone)]
pub struct ServerStatus {
    pub up: bool,
    /// 0: fine; 1: probe on the next cycle; 2: probe as soon as
    /// possible (repeated timeouts).
    pub needs_testing: u8,
    /// Unix time of the last completed exchange.
    pub last_exchange: Option<u64>,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self {
            up: true,
            needs_testing: 0,
            last_exchange: None,
        }
    }
}

/// The status table, shared between the resolver (which records
/// failures) and the status probe and control channel (which read and
/// reset them).  Guarded by its own lock so a slow resolution never
/// blocks a probe.
#[derive(Debug, Default)]
pub struct ServerStatusTable {
    statuses: HashMap<SocketAddr, ServerStatus>,
}

impl ServerStatusTable {
    pub fn status(&self, address: SocketAddr) -> ServerStatus {
        self.statuses.get(&address).copied().unwrap_or_default()
    }

    pub fn is_up(&self, address: SocketAddr) -> bool {
        self.status(address).up
    }

    pub fn record_success(&mut self, address: SocketAddr, now: u64) {
        let status = self.statuses.entry(address).or_default();
        status.up = true;
        status.needs_testing = 0;
        status.last_exchange = Some(now);
    }

    /// Raise (never lower) the needs-testing level.
    pub fn flag_for_testing(&mut self, address: SocketAddr, level: u8) {
        let status = self.statuses.entry(address).or_default();
        if status.needs_testing < level {
            status.needs_testing = level;
        }
    }

    pub fn set_up(&mut self, address: SocketAddr, up: bool) {
        let status = self.statuses.entry(address).or_default();
        status.up = up;
        status.needs_testing = 0;
    }

    pub fn snapshot(&self) -> Vec<(SocketAddr, ServerStatus)> {
        let mut all: Vec<_> = self
            .statuses
            .iter()
            .map(|(addr, status)| (*addr, *status))
            .collect();
        all.sort_by_key(|(addr, _)| *addr);
        all
    }
}

/// Shared handle to the status table.
pub type SharedServers = Arc<RwLock<ServerStatusTable>>;

pub fn new_shared_servers() -> SharedServers {
    Arc::new(RwLock::new(ServerStatusTable::default()))
}

/// One concrete server to query, produced by server-list assembly
/// from the sections (or from a cached delegation).
#[derive(Debug, Clone)]
pub struct QueryTarget {
    pub address: SocketAddr,

    /// Ask the server to recurse (proxy mode) or walk delegations
    /// ourselves (root / delegation servers).
    pub recursion_desired: bool,

    /// Flags stamped onto everything cached from this server's
    /// answers.
    pub cache_flags: Flags,

    pub trusted: bool,

    /// The delegation that led us to this server: an untrusted server
    /// may only hand us records inside it.  `None` for configured
    /// servers.
    pub ns_scope: Option<DomainName>,

    pub timeout: Duration,

    pub reject_v4: Vec<(Ipv4Addr, u8)>,
    pub reject_v6: Vec<(Ipv6Addr, u8)>,
    pub reject_policy: RejectPolicy,
}

impl QueryTarget {
    /// Targets for one configured section.
    pub fn from_section(section: &ServerSection) -> Vec<QueryTarget> {
        section
            .addresses
            .iter()
            .map(|address| QueryTarget {
                address: SocketAddr::new(*address, section.port),
                recursion_desired: !section.rootserver,
                cache_flags: section.cache_flags(),
                trusted: section.trusted,
                ns_scope: None,
                timeout: section.timeout,
                reject_v4: section.reject_v4.clone(),
                reject_v6: section.reject_v6.clone(),
                reject_policy: section.reject_policy,
            })
            .collect()
    }

    /// A target learned from a delegation, inheriting the reject
    /// rules and timeout of the section the walk started from.
    pub fn from_delegation(
        parent: &QueryTarget,
        address: IpAddr,
        port: u16,
        scope: DomainName,
    ) -> QueryTarget {
        QueryTarget {
            address: SocketAddr::new(address, port),
            recursion_desired: false,
            cache_flags: parent.cache_flags & !CF_ROOTSERV,
            trusted: parent.trusted,
            ns_scope: Some(scope),
            timeout: parent.timeout,
            reject_v4: parent.reject_v4.clone(),
            reject_v6: parent.reject_v6.clone(),
            reject_policy: parent.reject_policy,
        }
    }

    pub fn rejects(&self, address: IpAddr) -> bool {
        match address {
            IpAddr::V4(addr) => self
                .reject_v4
                .iter()
                .any(|(net, bits)| v4_prefix_match(addr, *net, *bits)),
            IpAddr::V6(addr) => self
                .reject_v6
                .iter()
                .any(|(net, bits)| v6_prefix_match(addr, *net, *bits)),
        }
    }
}

#[cfg(test)]
mod tests {
    use dns_types::protocol::types::test_util::*;

    use super::*;

    fn section_with_rules(rules: Vec<InExRule>, default_include: bool) -> ServerSection {
        ServerSection {
            label: "test".into(),
            addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            port: 53,
            timeout: Duration::from_secs(5),
            rootserver: false,
            proxy_only: false,
            purge_cache: true,
            nocache: false,
            trusted: true,
            rules,
            default_include,
            reject_v4: Vec::new(),
            reject_v6: Vec::new(),
            reject_policy: RejectPolicy::Fail,
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let section = section_with_rules(
            vec![
                InExRule {
                    include: false,
                    suffix: domain("internal.example.com."),
                },
                InExRule {
                    include: true,
                    suffix: domain("example.com."),
                },
            ],
            false,
        );

        assert!(!section.applies_to(&domain("db.internal.example.com.")));
        assert!(section.applies_to(&domain("www.example.com.")));
        assert!(!section.applies_to(&domain("www.example.net.")));
    }

    #[test]
    fn default_policy_applies_without_rules() {
        assert!(section_with_rules(Vec::new(), true).applies_to(&domain("anything.")));
        assert!(!section_with_rules(Vec::new(), false).applies_to(&domain("anything.")));
    }

    #[test]
    fn reject_list_prefix_matching() {
        let mut section = section_with_rules(Vec::new(), true);
        section.reject_v4 = vec![(Ipv4Addr::new(127, 0, 0, 0), 8)];

        assert!(section.rejects(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(section.rejects(IpAddr::V4(Ipv4Addr::new(127, 255, 0, 1))));
        assert!(!section.rejects(IpAddr::V4(Ipv4Addr::new(128, 0, 0, 1))));
    }

    #[test]
    fn cache_flags_reflect_section_options() {
        let mut section = section_with_rules(Vec::new(), true);
        assert_eq!(0, section.cache_flags());

        section.purge_cache = false;
        section.nocache = true;
        section.rootserver = true;
        assert_eq!(
            CF_NOPURGE | CF_NOCACHE | CF_ROOTSERV,
            section.cache_flags()
        );
    }

    #[test]
    fn needs_testing_never_lowers() {
        let mut table = ServerStatusTable::default();
        let addr: SocketAddr = "10.0.0.1:53".parse().unwrap();

        table.flag_for_testing(addr, NEEDS_TESTING_NOW);
        table.flag_for_testing(addr, NEEDS_TESTING_SOON);
        assert_eq!(NEEDS_TESTING_NOW, table.status(addr).needs_testing);

        table.record_success(addr, 1000);
        assert_eq!(0, table.status(addr).needs_testing);
        assert_eq!(Some(1000), table.status(addr).last_exchange);
    }
}
