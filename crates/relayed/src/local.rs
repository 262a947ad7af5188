//! Locally defined data: records from the settings file and from
//! hosts(5)-format files.  Everything loaded here enters the cache
//! flagged LOCAL, so it is never purged and never displaced by remote
//! answers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use bytes::Bytes;
use dns_cache::entry::{Cent, CF_AUTH, CF_LOCAL, DF_AUTH, DF_LOCAL, DF_WILD};
use dns_cache::{unix_now, SharedCache};
use dns_types::protocol::types::*;

use crate::settings::{LocalRecordSetting, Settings};

/// Load everything local into the cache.  Returns the number of
/// records loaded, or the first error.
pub async fn load_local_records(
    settings: &Settings,
    cache: &SharedCache,
) -> Result<usize, Error> {
    let mut records: Vec<(DomainName, u32, RecordTypeWithData)> = Vec::new();

    for setting in &settings.local_records {
        records.push(parse_local_record(setting)?);
    }

    for path in &settings.hosts_files {
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| Error::HostsIO {
                path: path.display().to_string(),
                error,
            })?;
        parse_hosts(&data, &mut records).map_err(|error| Error::Hosts {
            path: path.display().to_string(),
            error,
        })?;
    }

    let count = records.len();
    let now = unix_now();

    // group records per owner so each name becomes one entry
    let mut cents: HashMap<DomainName, Cent> = HashMap::new();
    let mut wild_parents: Vec<DomainName> = Vec::new();

    for (name, ttl, data) in records {
        // the synthetic `*.<parent>` entry is stored for real, and
        // the parent is marked so lookups know to try it
        if name.is_wildcard() {
            if let Some(parent) = name.parent() {
                wild_parents.push(parent);
            }
        }

        let cent = cents
            .entry(name.clone())
            .or_insert_with(|| Cent::new(name, DF_LOCAL | DF_AUTH));
        cent.add_record(ttl, now, CF_LOCAL | CF_AUTH, data)
            .map_err(|error| Error::NotCacheable {
                rtype: error.0.to_string(),
            })?;
    }

    for setting in &settings.neg_domains {
        let name = DomainName::from_dotted_string(setting).ok_or_else(|| Error::BadName {
            value: setting.clone(),
        })?;
        cents.insert(
            name.clone(),
            Cent::new_negative(name, settings.neg_ttl, now, DF_LOCAL | DF_AUTH),
        );
    }

    for (_, cent) in cents {
        cache.add_cache(cent, now);
    }

    for parent in wild_parents {
        if !cache.set_cent_flags(&parent, DF_WILD) {
            // flag-only local entry so the wildcard is findable
            cache.add_cache(Cent::new(parent, DF_LOCAL | DF_WILD), now);
        }
    }

    Ok(count)
}

pub(crate) fn parse_local_record(
    setting: &LocalRecordSetting,
) -> Result<(DomainName, u32, RecordTypeWithData), Error> {
    let name = DomainName::from_dotted_string(&setting.name).ok_or_else(|| Error::BadName {
        value: setting.name.clone(),
    })?;

    let bad_value = || Error::BadValue {
        rtype: setting.rtype.clone(),
        value: setting.value.clone(),
    };

    let parse_name = |value: &str| DomainName::from_dotted_string(value).ok_or_else(bad_value);

    let data = match setting.rtype.to_ascii_uppercase().as_str() {
        "A" => RecordTypeWithData::A {
            address: setting.value.parse().map_err(|_| bad_value())?,
        },
        "AAAA" => RecordTypeWithData::AAAA {
            address: setting.value.parse().map_err(|_| bad_value())?,
        },
        "CNAME" => RecordTypeWithData::CNAME {
            cname: parse_name(&setting.value)?,
        },
        "NS" => RecordTypeWithData::NS {
            nsdname: parse_name(&setting.value)?,
        },
        "PTR" => RecordTypeWithData::PTR {
            ptrdname: parse_name(&setting.value)?,
        },
        "MX" => {
            let (preference, exchange) =
                setting.value.split_once(' ').ok_or_else(bad_value)?;
            RecordTypeWithData::MX {
                preference: u16::from_str(preference.trim()).map_err(|_| bad_value())?,
                exchange: parse_name(exchange.trim())?,
            }
        }
        "TXT" => {
            // single character-string wire form
            let text = setting.value.as_bytes();
            if text.len() > 255 {
                return Err(bad_value());
            }
            let mut octets = Vec::with_capacity(text.len() + 1);
            octets.push(text.len() as u8);
            octets.extend_from_slice(text);
            RecordTypeWithData::TXT {
                octets: Bytes::from(octets),
            }
        }
        _ => {
            return Err(Error::BadType {
                rtype: setting.rtype.clone(),
            })
        }
    };

    Ok((name, setting.ttl, data))
}

/// Parse hosts-format data: `address name [name...]`, `#` comments,
/// `%`-scoped addresses skipped.
pub(crate) fn parse_hosts(
    data: &str,
    records: &mut Vec<(DomainName, u32, RecordTypeWithData)>,
) -> Result<(), HostsError> {
    for line in data.lines() {
        if let Some((address, names)) = parse_hosts_line(line)? {
            for name in names {
                let data = match address {
                    IpAddr::V4(addr) => RecordTypeWithData::A { address: addr },
                    IpAddr::V6(addr) => RecordTypeWithData::AAAA { address: addr },
                };
                records.push((name, HOSTS_TTL, data));
            }
        }
    }
    Ok(())
}

/// TTL served for hosts-file records.
const HOSTS_TTL: u32 = 86_400;

/// Parse a single hosts line.
fn parse_hosts_line(line: &str) -> Result<Option<(IpAddr, Vec<DomainName>)>, HostsError> {
    let mut state = State::SkipToAddress;
    let mut address = None;
    let mut names = Vec::new();

    let push_name = |names: &mut Vec<DomainName>, name_str: &str| {
        match DomainName::from_relative_dotted_string(&DomainName::root_domain(), name_str) {
            Some(name) => {
                if !names.contains(&name) {
                    names.push(name);
                }
                Ok(())
            }
            None => Err(HostsError::CouldNotParseName {
                name: name_str.into(),
            }),
        }
    };

    for (i, octet) in line.chars().enumerate() {
        if !octet.is_ascii() {
            return Err(HostsError::ExpectedAscii);
        }

        state = match (&state, octet) {
            (_, '#') => State::CommentToEndOfLine,
            (State::CommentToEndOfLine, _) => break,

            (State::SkipToAddress, c) if c.is_whitespace() => state,
            (State::SkipToAddress, _) => State::ReadingAddress { start: i },

            // scoped addresses (fe80::1%lo0) are interface-local:
            // nothing to serve
            (State::ReadingAddress { .. }, '%') => return Ok(None),
            (State::ReadingAddress { start }, c) if c.is_whitespace() => {
                let addr_str = &line[*start..i];
                match IpAddr::from_str(addr_str) {
                    Ok(addr) => address = Some(addr),
                    Err(_) => {
                        return Err(HostsError::CouldNotParseAddress {
                            address: addr_str.into(),
                        })
                    }
                }
                State::SkipToName
            }
            (State::ReadingAddress { .. }, _) => state,

            (State::SkipToName, c) if c.is_whitespace() => state,
            (State::SkipToName, _) => State::ReadingName { start: i },

            (State::ReadingName { start }, c) if c.is_whitespace() => {
                push_name(&mut names, &line[*start..i])?;
                State::SkipToName
            }
            (State::ReadingName { .. }, _) => state,
        }
    }

    if let State::ReadingName { start } = state {
        push_name(&mut names, &line[start..])?;
    }

    match (address, names.is_empty()) {
        (Some(address), false) => Ok(Some((address, names))),
        _ => Ok(None),
    }
}

/// States for the hosts line parser
enum State {
    SkipToAddress,
    ReadingAddress { start: usize },
    SkipToName,
    ReadingName { start: usize },
    CommentToEndOfLine,
}

/// An error that can occur loading local records.
#[derive(Debug)]
pub enum Error {
    BadName { value: String },
    BadType { rtype: String },
    BadValue { rtype: String, value: String },
    NotCacheable { rtype: String },
    HostsIO { path: String, error: std::io::Error },
    Hosts { path: String, error: HostsError },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::BadName { value } => write!(f, "'{value}' is not a domain name"),
            Error::BadType { rtype } => {
                write!(f, "'{rtype}' is not a supported local record type")
            }
            Error::BadValue { rtype, value } => {
                write!(f, "'{value}' is not a valid {rtype} value")
            }
            Error::NotCacheable { rtype } => write!(f, "'{rtype}' records cannot be stored"),
            Error::HostsIO { path, error } => write!(f, "could not read '{path}': {error}"),
            Error::Hosts { path, error } => write!(f, "could not parse '{path}': {error:?}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::HostsIO { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// An error that can occur reading a hosts file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostsError {
    ExpectedAscii,
    CouldNotParseAddress { address: String },
    CouldNotParseName { name: String },
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use dns_cache::store::LookupOutcome;
    use dns_cache::Cache;
    use dns_types::protocol::types::test_util::*;

    use super::*;

    fn settings_with(
        local_records: Vec<LocalRecordSetting>,
        neg_domains: Vec<String>,
    ) -> Settings {
        let mut settings = Settings::defaults();
        settings.local_records = local_records;
        settings.neg_domains = neg_domains;
        settings
    }

    fn record(name: &str, rtype: &str, value: &str) -> LocalRecordSetting {
        LocalRecordSetting {
            name: name.into(),
            rtype: rtype.into(),
            value: value.into(),
            ttl: 3600,
        }
    }

    #[tokio::test]
    async fn local_records_become_local_cents() {
        let cache = SharedCache::new(Cache::default());
        let settings = settings_with(
            vec![
                record("printer.lan.", "A", "10.0.0.9"),
                record("printer.lan.", "AAAA", "fd00::9"),
                record("www.lan.", "CNAME", "printer.lan."),
            ],
            Vec::new(),
        );

        let count = load_local_records(&settings, &cache).await.unwrap();
        assert_eq!(3, count);

        let (cent, _) = cache.lookup(&domain("printer.lan.")).unwrap();
        assert!(cent.is_local());
        assert!(cent.rrset(RecordType::A).unwrap().is_local());
        assert!(cent.has_rr(RecordType::AAAA));

        let rrs = cache
            .lookup_local_rrset(&domain("www.lan."), RecordType::CNAME)
            .unwrap();
        assert_eq!(
            vec![RecordTypeWithData::CNAME {
                cname: domain("printer.lan.")
            }],
            rrs.records
        );
    }

    #[tokio::test]
    async fn neg_domains_negate_subtrees() {
        let cache = SharedCache::new(Cache::default());
        let settings = settings_with(Vec::new(), vec!["ads.example.".into()]);

        load_local_records(&settings, &cache).await.unwrap();

        let (cent, outcome) = cache.lookup(&domain("tracker.ads.example.")).unwrap();
        assert_eq!(LookupOutcome::LocalNegativeAncestor, outcome);
        assert!(cent.is_negative());
        assert!(cent.is_local());
    }

    #[tokio::test]
    async fn zone_root_records_shadow_their_subtree() {
        let cache = SharedCache::new(Cache::default());
        let settings = settings_with(vec![record("lan.", "A", "10.0.0.1")], Vec::new());

        load_local_records(&settings, &cache).await.unwrap();

        // names under the local zone with no data of their own are
        // authoritatively nonexistent
        let (cent, outcome) = cache.lookup(&domain("bogus.lan.")).unwrap();
        assert_eq!(LookupOutcome::LocalAncestor, outcome);
        assert!(cent.is_local());
        assert!(!cent.is_negative());
    }

    #[tokio::test]
    async fn wildcards_mark_their_parent() {
        let cache = SharedCache::new(Cache::default());
        let settings = settings_with(
            vec![record("*.apps.lan.", "A", "10.0.0.10")],
            Vec::new(),
        );

        load_local_records(&settings, &cache).await.unwrap();

        let (cent, outcome) = cache.lookup(&domain("grafana.apps.lan.")).unwrap();
        assert_eq!(LookupOutcome::Wildcard, outcome);
        assert_eq!(domain("*.apps.lan."), cent.name);
        assert!(cent.has_rr(RecordType::A));
    }

    #[test]
    fn hosts_lines_parse() {
        assert_eq!(
            Ok(Some((
                IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
                vec![domain("foo."), domain("bar.")]
            ))),
            parse_hosts_line("1.2.3.4 foo bar")
        );

        assert_eq!(
            Ok(Some((
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                vec![domain("localhost.")]
            ))),
            parse_hosts_line("::1 localhost")
        );

        assert_eq!(Ok(None), parse_hosts_line("fe80::1%lo0 localhost"));
        assert_eq!(Ok(None), parse_hosts_line("# just a comment"));
        assert_eq!(Ok(None), parse_hosts_line("1.2.3.4"));
        assert_eq!(
            Err(HostsError::CouldNotParseAddress {
                address: "not-an-ip".into()
            }),
            parse_hosts_line("not-an-ip name")
        );
    }

    #[test]
    fn hosts_data_parses_with_comments_and_blanks() {
        let hosts_data = "# hark, a comment!\n\
                          1.2.3.4 one two\n\
                          \n\
                          127.0.0.1 localhost.\n\
                          ::1 localhost";

        let mut records = Vec::new();
        parse_hosts(hosts_data, &mut records).unwrap();
        assert_eq!(4, records.len());
    }

    #[test]
    fn mx_values_need_a_preference() {
        assert!(parse_local_record(&record("mail.lan.", "MX", "10 mx.lan.")).is_ok());
        assert!(parse_local_record(&record("mail.lan.", "MX", "mx.lan.")).is_err());
    }

    #[test]
    fn unsupported_types_are_rejected() {
        assert!(matches!(
            parse_local_record(&record("x.lan.", "WKS", "whatever")),
            Err(Error::BadType { .. })
        ));
    }
}
