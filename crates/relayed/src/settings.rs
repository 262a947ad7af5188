//! The settings file.  Deserialised from YAML via the `config` crate,
//! with environment overrides under the `RELAYED_` prefix.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dns_cache::store::TtlLimits;
use dns_resolver::context::{NegPolicy, ResolverOpts};
use dns_resolver::query::{QueryMethod, QueryOptions};
use dns_resolver::servers::{InExRule, RejectPolicy, ServerSection};
use dns_types::protocol::edns::{MAX_UDP_PAYLOAD_SIZE, MIN_UDP_PAYLOAD_SIZE};
use dns_types::protocol::types::DomainName;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Port to serve DNS on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to bind the listeners to.  On a multi-homed host,
    /// bind a concrete address so replies leave from the address the
    /// query arrived at.
    #[serde(default = "default_server_ip")]
    pub server_ip: IpAddr,

    /// Source address for upstream queries.
    #[serde(default)]
    pub outgoing_ip: Option<IpAddr>,

    #[serde(default = "default_min_ttl")]
    pub min_ttl: u32,
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,
    #[serde(default = "default_neg_ttl")]
    pub neg_ttl: u32,

    /// Negative caching of missing RR types.
    #[serde(default)]
    pub neg_rrs_pol: NegPolicySetting,
    /// Negative caching of whole names.
    #[serde(default = "default_neg_domain_pol")]
    pub neg_domain_pol: NegPolicySetting,

    /// Upstream exchanges in flight at once per resolution step.
    #[serde(default = "default_par_queries")]
    pub par_queries: usize,

    /// Active worker budget; queries beyond it queue.
    #[serde(default = "default_proc_limit")]
    pub proc_limit: usize,
    /// Queued worker budget; queries beyond `proc_limit +
    /// procq_limit` are dropped.
    #[serde(default = "default_procq_limit")]
    pub procq_limit: usize,

    /// Global timeout (seconds) for one round of upstream queries.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// How long (seconds) a TCP client may dawdle over sending its
    /// query.
    #[serde(default = "default_tcp_qtimeout")]
    pub tcp_qtimeout: u64,

    #[serde(default)]
    pub query_method: QueryMethodSetting,

    /// Bind outgoing queries to a random port in
    /// `[query_port_start, query_port_end]`.
    #[serde(default)]
    pub query_port_start: Option<u16>,
    #[serde(default)]
    pub query_port_end: Option<u16>,

    /// EDNS payload size for upstream queries; at 512 EDNS is not
    /// used.
    #[serde(default = "default_udpbufsize")]
    pub udpbufsize: u16,

    /// Rotate answer record order between responses.
    #[serde(default)]
    pub randomize_recs: bool,

    /// Distrust out-of-bailiwick records.
    #[serde(default)]
    pub paranoid: bool,

    /// Accepted for configuration compatibility; the workaround it
    /// selected applies to no supported platform.
    #[serde(default)]
    pub lndown_kluge: bool,

    /// Cache size in kilobytes.
    #[serde(default = "default_perm_cache")]
    pub perm_cache: usize,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Zones which must only ever delegate (sinkhole protection).
    #[serde(default)]
    pub delegation_only: Vec<String>,

    #[serde(default)]
    pub servers: Vec<ServerSettings>,

    /// Locally defined records.
    #[serde(default)]
    pub local_records: Vec<LocalRecordSetting>,

    /// Locally negated whole subtrees.
    #[serde(default)]
    pub neg_domains: Vec<String>,

    /// hosts(5)-format files to serve records from.
    #[serde(default)]
    pub hosts_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    pub label: String,
    pub ip: Vec<IpAddr>,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    /// Per-exchange timeout, seconds.
    #[serde(default = "default_upstream_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub rootserver: bool,
    #[serde(default)]
    pub proxy_only: bool,
    #[serde(default = "default_true")]
    pub purge_cache: bool,
    #[serde(default)]
    pub nocache: bool,
    #[serde(default = "default_true")]
    pub trusted: bool,
    /// Ordered include rules (names, as suffixes).
    #[serde(default)]
    pub include: Vec<String>,
    /// Ordered exclude rules.  Includes are checked first.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Applied when no rule matches.
    #[serde(default = "default_true")]
    pub default_include: bool,
    /// CIDR prefixes whose appearance in an answer poisons it.
    #[serde(default)]
    pub reject: Vec<String>,
    #[serde(default)]
    pub reject_policy: RejectPolicySetting,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalRecordSetting {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: String,
    pub value: String,
    #[serde(default = "default_local_ttl")]
    pub ttl: u32,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegPolicySetting {
    On,
    Off,
    Auth,
    #[default]
    Default,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMethodSetting {
    UdpOnly,
    TcpOnly,
    #[default]
    UdpTcp,
    TcpUdp,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectPolicySetting {
    #[default]
    Fail,
    Negate,
}

fn default_port() -> u16 {
    53
}
fn default_server_ip() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}
fn default_min_ttl() -> u32 {
    120
}
fn default_max_ttl() -> u32 {
    604_800
}
fn default_neg_ttl() -> u32 {
    900
}
fn default_neg_domain_pol() -> NegPolicySetting {
    NegPolicySetting::Auth
}
fn default_par_queries() -> usize {
    2
}
fn default_proc_limit() -> usize {
    40
}
fn default_procq_limit() -> usize {
    60
}
fn default_timeout() -> u64 {
    30
}
fn default_tcp_qtimeout() -> u64 {
    5
}
fn default_udpbufsize() -> u16 {
    1024
}
fn default_perm_cache() -> usize {
    2048
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/relayed")
}
fn default_upstream_port() -> u16 {
    53
}
fn default_upstream_timeout() -> u64 {
    5
}
fn default_true() -> bool {
    true
}
fn default_local_ttl() -> u32 {
    86_400
}

/// A settings value which did not parse.
#[derive(Debug)]
pub enum SettingsError {
    Config(ConfigError),
    BadName { field: &'static str, value: String },
    BadPrefix { field: &'static str, value: String },
    BadPortRange,
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SettingsError::Config(error) => write!(f, "{error}"),
            SettingsError::BadName { field, value } => {
                write!(f, "'{value}' in '{field}' is not a domain name")
            }
            SettingsError::BadPrefix { field, value } => {
                write!(f, "'{value}' in '{field}' is not an address prefix")
            }
            SettingsError::BadPortRange => {
                write!(f, "query_port_start and query_port_end must be given together")
            }
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::Config(error) => Some(error),
            _ => None,
        }
    }
}

impl From<ConfigError> for SettingsError {
    fn from(error: ConfigError) -> Self {
        SettingsError::Config(error)
    }
}

impl Settings {
    pub fn new(filename: &str) -> Result<Self, SettingsError> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name(filename))
            .add_source(Environment::with_prefix("RELAYED"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// A built-in configuration serving nothing but the cache; used
    /// when no settings file is given.
    pub fn defaults() -> Self {
        // an empty source deserialises to all-defaults
        Config::builder()
            .build()
            .and_then(|config| config.try_deserialize())
            .expect("default settings must deserialise")
    }

    pub fn ttl_limits(&self) -> TtlLimits {
        TtlLimits {
            min_ttl: self.min_ttl,
            max_ttl: self.max_ttl.max(self.min_ttl),
            neg_ttl: self.neg_ttl,
        }
    }

    pub fn query_options(&self) -> Result<QueryOptions, SettingsError> {
        let port_range = match (self.query_port_start, self.query_port_end) {
            (Some(start), Some(end)) => Some((start.min(end), start.max(end))),
            (None, None) => None,
            _ => return Err(SettingsError::BadPortRange),
        };

        Ok(QueryOptions {
            method: match self.query_method {
                QueryMethodSetting::UdpOnly => QueryMethod::UdpOnly,
                QueryMethodSetting::TcpOnly => QueryMethod::TcpOnly,
                QueryMethodSetting::UdpTcp => QueryMethod::UdpTcp,
                QueryMethodSetting::TcpUdp => QueryMethod::TcpUdp,
            },
            udp_payload_size: self
                .udpbufsize
                .clamp(MIN_UDP_PAYLOAD_SIZE, MAX_UDP_PAYLOAD_SIZE),
            port_range,
            outgoing_v4: match self.outgoing_ip {
                Some(IpAddr::V4(addr)) => Some(addr),
                _ => None,
            },
            outgoing_v6: match self.outgoing_ip {
                Some(IpAddr::V6(addr)) => Some(addr),
                _ => None,
            },
        })
    }

    pub fn resolver_opts(&self) -> Result<ResolverOpts, SettingsError> {
        let mut delegation_only = Vec::with_capacity(self.delegation_only.len());
        for name in &self.delegation_only {
            delegation_only.push(parse_name("delegation_only", name)?);
        }

        Ok(ResolverOpts {
            query: self.query_options()?,
            par_queries: self.par_queries.max(1),
            upstream_port: 53,
            global_timeout: Duration::from_secs(self.timeout),
            neg_rrs_pol: neg_policy(self.neg_rrs_pol),
            neg_domain_pol: neg_policy(self.neg_domain_pol),
            paranoid: self.paranoid,
            delegation_only,
        })
    }

    pub fn server_sections(&self) -> Result<Vec<ServerSection>, SettingsError> {
        let mut sections = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            sections.push(server.to_section()?);
        }
        Ok(sections)
    }
}

impl ServerSettings {
    fn to_section(&self) -> Result<ServerSection, SettingsError> {
        // excludes go first: they carve exceptions out of the
        // (usually broader) includes
        let mut rules = Vec::with_capacity(self.include.len() + self.exclude.len());
        for name in &self.exclude {
            rules.push(InExRule {
                include: false,
                suffix: parse_name("exclude", name)?,
            });
        }
        for name in &self.include {
            rules.push(InExRule {
                include: true,
                suffix: parse_name("include", name)?,
            });
        }

        let mut reject_v4 = Vec::new();
        let mut reject_v6 = Vec::new();
        for prefix in &self.reject {
            match parse_prefix(prefix) {
                Some(Prefix::V4(net, bits)) => reject_v4.push((net, bits)),
                Some(Prefix::V6(net, bits)) => reject_v6.push((net, bits)),
                None => {
                    return Err(SettingsError::BadPrefix {
                        field: "reject",
                        value: prefix.clone(),
                    })
                }
            }
        }

        Ok(ServerSection {
            label: self.label.clone(),
            addresses: self.ip.clone(),
            port: self.port,
            timeout: Duration::from_secs(self.timeout),
            rootserver: self.rootserver,
            proxy_only: self.proxy_only,
            purge_cache: self.purge_cache,
            nocache: self.nocache,
            trusted: self.trusted,
            rules,
            default_include: self.default_include,
            reject_v4,
            reject_v6,
            reject_policy: match self.reject_policy {
                RejectPolicySetting::Fail => RejectPolicy::Fail,
                RejectPolicySetting::Negate => RejectPolicy::Negate,
            },
        })
    }
}

fn neg_policy(setting: NegPolicySetting) -> NegPolicy {
    match setting {
        NegPolicySetting::On => NegPolicy::On,
        NegPolicySetting::Off => NegPolicy::Off,
        NegPolicySetting::Auth => NegPolicy::Auth,
        NegPolicySetting::Default => NegPolicy::Default,
    }
}

fn parse_name(field: &'static str, value: &str) -> Result<DomainName, SettingsError> {
    DomainName::from_dotted_string(value).ok_or_else(|| SettingsError::BadName {
        field,
        value: value.to_string(),
    })
}

enum Prefix {
    V4(std::net::Ipv4Addr, u8),
    V6(std::net::Ipv6Addr, u8),
}

fn parse_prefix(value: &str) -> Option<Prefix> {
    let (addr_str, bits_str) = match value.split_once('/') {
        Some(parts) => parts,
        None => (value, ""),
    };

    match IpAddr::from_str(addr_str).ok()? {
        IpAddr::V4(addr) => {
            let bits = if bits_str.is_empty() {
                32
            } else {
                u8::from_str(bits_str).ok().filter(|b| *b <= 32)?
            };
            Some(Prefix::V4(addr, bits))
        }
        IpAddr::V6(addr) => {
            let bits = if bits_str.is_empty() {
                128
            } else {
                u8::from_str(bits_str).ok().filter(|b| *b <= 128)?
            };
            Some(Prefix::V6(addr, bits))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let settings = Settings::defaults();
        assert_eq!(53, settings.port);
        assert_eq!(120, settings.min_ttl);
        assert_eq!(2048, settings.perm_cache);
        assert!(settings.servers.is_empty());
        assert!(settings.resolver_opts().is_ok());
    }

    #[test]
    fn port_range_must_be_complete() {
        let mut settings = Settings::defaults();
        settings.query_port_start = Some(1024);
        assert!(matches!(
            settings.query_options(),
            Err(SettingsError::BadPortRange)
        ));

        settings.query_port_end = Some(2048);
        assert_eq!(
            Some((1024, 2048)),
            settings.query_options().unwrap().port_range
        );
    }

    #[test]
    fn prefixes_parse() {
        assert!(matches!(
            parse_prefix("127.0.0.0/8"),
            Some(Prefix::V4(addr, 8)) if addr == std::net::Ipv4Addr::new(127, 0, 0, 0)
        ));
        assert!(matches!(
            parse_prefix("10.1.2.3"),
            Some(Prefix::V4(_, 32))
        ));
        assert!(matches!(parse_prefix("::1/128"), Some(Prefix::V6(_, 128))));
        assert!(parse_prefix("not-an-address").is_none());
        assert!(parse_prefix("10.0.0.0/33").is_none());
    }

    #[test]
    fn bad_names_are_reported_with_their_field() {
        let mut settings = Settings::defaults();
        settings.delegation_only = vec!["not..a..name".to_string()];
        match settings.resolver_opts() {
            Err(SettingsError::BadName { field, .. }) => assert_eq!("delegation_only", field),
            other => panic!("expected BadName, got {other:?}"),
        }
    }

    #[test]
    fn server_section_rules_put_excludes_first() {
        let server = ServerSettings {
            label: "upstream".into(),
            ip: vec!["9.9.9.9".parse().unwrap()],
            port: 53,
            timeout: 5,
            rootserver: false,
            proxy_only: false,
            purge_cache: true,
            nocache: false,
            trusted: true,
            include: vec!["example.com.".into()],
            exclude: vec!["internal.example.com.".into()],
            default_include: false,
            reject: vec!["127.0.0.0/8".into()],
            reject_policy: RejectPolicySetting::Negate,
        };

        let section = server.to_section().unwrap();
        assert_eq!(2, section.rules.len());
        assert!(!section.rules[0].include);
        assert!(!section.applies_to(
            &DomainName::from_dotted_string("db.internal.example.com.").unwrap()
        ));
        assert!(section.applies_to(
            &DomainName::from_dotted_string("www.example.com.").unwrap()
        ));
        assert_eq!(1, section.reject_v4.len());
        assert_eq!(RejectPolicy::Negate, section.reject_policy);
    }
}
