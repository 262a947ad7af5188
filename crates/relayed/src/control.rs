//! Handlers for the administrative control channel.  Only the
//! command semantics live here; the socket and its framing are the
//! caller's business.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use dns_cache::entry::{Cent, CF_AUTH, CF_LOCAL, DF_AUTH, DF_LOCAL};
use dns_cache::unix_now;
use dns_types::protocol::rrinfo::is_cacheable;
use dns_types::protocol::types::{DomainName, RecordType};

use crate::local::parse_local_record;
use crate::settings::LocalRecordSetting;
use crate::AppState;

/// A decoded control command.
#[derive(Debug, Clone)]
pub enum Command {
    /// Report runtime statistics.
    Stats,
    /// Change an upstream server's status.
    Server { server: String, action: ServerAction },
    /// Drop or invalidate one cached name.
    Record { name: String, action: RecordAction },
    /// Define a local record at runtime.
    Add {
        name: String,
        rtype: String,
        value: String,
        ttl: u32,
    },
    /// Negate a name (or just one of its types) locally.
    Neg {
        name: String,
        rtype: Option<String>,
        ttl: Option<u32>,
    },
    /// Serve records from a hosts-format file.
    Source { path: String },
    /// Flush the cache, keeping names under the given suffixes.
    Empty { keep: Vec<String> },
    /// Dump the cache (or one subtree) as text.
    Dump { name: Option<String>, exact: bool },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerAction {
    Up,
    Down,
    Retest,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecordAction {
    Delete,
    Invalidate,
}

/// Parse one line of the control protocol.
///
/// ```text
/// stats
/// server <label|address> <up|down|retest>
/// record <name> <delete|invalidate>
/// add <type> <name> <value> [ttl]
/// neg <name> [type] [ttl]
/// source <path>
/// empty [keep-suffix...]
/// dump [name] [exact]
/// ```
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().map(str::to_ascii_lowercase);

    match verb.as_deref() {
        Some("stats") => Ok(Command::Stats),
        Some("server") => {
            let server = words.next().ok_or("server: missing server")?.to_string();
            let action = match words.next() {
                Some("up") => ServerAction::Up,
                Some("down") => ServerAction::Down,
                Some("retest") => ServerAction::Retest,
                _ => return Err("server: expected up, down, or retest".into()),
            };
            Ok(Command::Server { server, action })
        }
        Some("record") => {
            let name = words.next().ok_or("record: missing name")?.to_string();
            let action = match words.next() {
                Some("delete") => RecordAction::Delete,
                Some("invalidate") => RecordAction::Invalidate,
                _ => return Err("record: expected delete or invalidate".into()),
            };
            Ok(Command::Record { name, action })
        }
        Some("add") => {
            let rtype = words.next().ok_or("add: missing type")?.to_string();
            let name = words.next().ok_or("add: missing name")?.to_string();
            let value = words.next().ok_or("add: missing value")?.to_string();
            let ttl = match words.next() {
                None => 86_400,
                Some(raw) => raw.parse().map_err(|_| "add: bad ttl")?,
            };
            Ok(Command::Add {
                name,
                rtype,
                value,
                ttl,
            })
        }
        Some("neg") => {
            let name = words.next().ok_or("neg: missing name")?.to_string();
            let mut rtype = None;
            let mut ttl = None;
            for word in words {
                if let Ok(parsed) = word.parse::<u32>() {
                    ttl = Some(parsed);
                } else {
                    rtype = Some(word.to_string());
                }
            }
            Ok(Command::Neg { name, rtype, ttl })
        }
        Some("source") => {
            let path = words.next().ok_or("source: missing path")?.to_string();
            Ok(Command::Source { path })
        }
        Some("empty") => Ok(Command::Empty {
            keep: words.map(str::to_string).collect(),
        }),
        Some("dump") => {
            let mut name = None;
            let mut exact = false;
            for word in words {
                if word == "exact" {
                    exact = true;
                } else {
                    name = Some(word.to_string());
                }
            }
            Ok(Command::Dump { name, exact })
        }
        Some(other) => Err(format!("unknown command '{other}'")),
        None => Err("empty command".into()),
    }
}

/// Run one command, returning its textual report.
pub fn handle(state: &AppState, command: Command) -> Result<String, String> {
    match command {
        Command::Stats => Ok(stats_report(state)),
        Command::Server { server, action } => server_command(state, &server, action),
        Command::Record { name, action } => record_command(state, &name, action),
        Command::Add {
            name,
            rtype,
            value,
            ttl,
        } => add_command(state, &name, &rtype, &value, ttl),
        Command::Neg { name, rtype, ttl } => neg_command(state, &name, rtype.as_deref(), ttl),
        Command::Source { path } => source_command(state, &path),
        Command::Empty { keep } => empty_command(state, &keep),
        Command::Dump { name, exact } => dump_command(state, name.as_deref(), exact),
    }
}

fn stats_report(state: &AppState) -> String {
    let (entries, bytes) = {
        let cache = state.cache.read();
        (cache.len(), cache.byte_size())
    };

    let mut report = state.stats.report();
    report.push_str(&format!(
        "cache entries:     {entries}\ncache bytes:       {bytes}\n"
    ));

    if let Ok(table) = state.servers.read() {
        for (address, status) in table.snapshot() {
            report.push_str(&format!(
                "server {address}: {} (needs testing: {})\n",
                if status.up { "up" } else { "down" },
                status.needs_testing
            ));
        }
    }

    report
}

/// The addresses a server argument names: a socket address, a bare
/// IP, or the label of a configured section.
fn server_addresses(state: &AppState, server: &str) -> Result<Vec<SocketAddr>, String> {
    if let Ok(address) = SocketAddr::from_str(server) {
        return Ok(vec![address]);
    }
    if let Ok(ip) = IpAddr::from_str(server) {
        return Ok(vec![SocketAddr::new(ip, 53)]);
    }

    let section = state
        .sections
        .iter()
        .find(|section| section.label == server)
        .ok_or_else(|| format!("no server or section named '{server}'"))?;
    Ok(section
        .addresses
        .iter()
        .map(|ip| SocketAddr::new(*ip, section.port))
        .collect())
}

fn server_command(
    state: &AppState,
    server: &str,
    action: ServerAction,
) -> Result<String, String> {
    let addresses = server_addresses(state, server)?;
    let mut table = state
        .servers
        .write()
        .map_err(|_| "server table lock poisoned".to_string())?;

    for address in &addresses {
        match action {
            ServerAction::Up => table.set_up(*address, true),
            ServerAction::Down => table.set_up(*address, false),
            ServerAction::Retest => {
                table.flag_for_testing(*address, dns_resolver::servers::NEEDS_TESTING_NOW);
            }
        }
    }

    Ok(format!("{} server(s) updated", addresses.len()))
}

fn record_command(
    state: &AppState,
    name: &str,
    action: RecordAction,
) -> Result<String, String> {
    let name =
        DomainName::from_dotted_string(name).ok_or_else(|| format!("bad name '{name}'"))?;

    let changed = match action {
        RecordAction::Delete => state.cache.del_cache(&name),
        RecordAction::Invalidate => state.cache.invalidate(&name),
    };

    if changed {
        Ok("ok".to_string())
    } else {
        Err(format!("'{name}' is not cached"))
    }
}

fn add_command(
    state: &AppState,
    name: &str,
    rtype: &str,
    value: &str,
    ttl: u32,
) -> Result<String, String> {
    let setting = LocalRecordSetting {
        name: name.to_string(),
        rtype: rtype.to_string(),
        value: value.to_string(),
        ttl,
    };
    let (name, ttl, data) = parse_local_record(&setting).map_err(|error| error.to_string())?;

    let now = unix_now();
    let mut cent = Cent::new(name, DF_LOCAL | DF_AUTH);
    cent.add_record(ttl, now, CF_LOCAL | CF_AUTH, data)
        .map_err(|error| error.to_string())?;
    state.cache.add_cache(cent, now);

    Ok("ok".to_string())
}

fn neg_command(
    state: &AppState,
    name: &str,
    rtype: Option<&str>,
    ttl: Option<u32>,
) -> Result<String, String> {
    let name =
        DomainName::from_dotted_string(name).ok_or_else(|| format!("bad name '{name}'"))?;
    let ttl = ttl.unwrap_or(state.neg_ttl);
    let now = unix_now();

    match rtype {
        None => {
            state.cache.add_cache(
                Cent::new_negative(name, ttl, now, DF_LOCAL | DF_AUTH),
                now,
            );
        }
        Some(rtype_str) => {
            let rtype = RecordType::from_str(rtype_str)
                .map_err(|_| format!("bad RR type '{rtype_str}'"))?;
            if !is_cacheable(rtype) {
                return Err(format!("RR type '{rtype}' cannot be negated"));
            }
            let mut cent = Cent::new(name, DF_LOCAL | DF_AUTH);
            cent.add_negated_rrset(rtype, ttl, now, CF_LOCAL | CF_AUTH)
                .map_err(|error| error.to_string())?;
            state.cache.add_cache(cent, now);
        }
    }

    Ok("ok".to_string())
}

fn source_command(state: &AppState, path: &str) -> Result<String, String> {
    let data = std::fs::read_to_string(path).map_err(|error| error.to_string())?;

    let mut records = Vec::new();
    crate::local::parse_hosts(&data, &mut records).map_err(|error| format!("{error:?}"))?;

    let now = unix_now();
    let count = records.len();

    // one entry per owner, so multi-address names keep all their
    // records
    let mut cents: std::collections::HashMap<_, Cent> = std::collections::HashMap::new();
    for (name, ttl, data) in records {
        let cent = cents
            .entry(name.clone())
            .or_insert_with(|| Cent::new(name, DF_LOCAL | DF_AUTH));
        cent.add_record(ttl, now, CF_LOCAL | CF_AUTH, data)
            .map_err(|error| error.to_string())?;
    }
    for (_, cent) in cents {
        state.cache.add_cache(cent, now);
    }

    Ok(format!("{count} records loaded"))
}

fn empty_command(state: &AppState, keep: &[String]) -> Result<String, String> {
    let mut keep_names = Vec::with_capacity(keep.len());
    for name in keep {
        keep_names.push(
            DomainName::from_dotted_string(name).ok_or_else(|| format!("bad name '{name}'"))?,
        );
    }

    let removed = state.cache.empty_cache(&keep_names);
    Ok(format!("{removed} entries removed"))
}

fn dump_command(state: &AppState, name: Option<&str>, exact: bool) -> Result<String, String> {
    let filter = match name {
        None => None,
        Some(value) => Some(
            DomainName::from_dotted_string(value)
                .ok_or_else(|| format!("bad name '{value}'"))?,
        ),
    };

    let mut out = Vec::new();
    state
        .cache
        .read()
        .dump(&mut out, filter.as_ref(), exact, unix_now())
        .map_err(|error| error.to_string())?;
    String::from_utf8(out).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_types::protocol::types::test_util::*;

    use super::*;
    use crate::test_util::test_state;

    #[test]
    fn add_then_dump_then_delete() {
        let state = test_state();

        handle(
            &state,
            Command::Add {
                name: "printer.lan.".into(),
                rtype: "A".into(),
                value: "10.0.0.9".into(),
                ttl: 3600,
            },
        )
        .unwrap();

        let dump = handle(
            &state,
            Command::Dump {
                name: Some("printer.lan.".into()),
                exact: true,
            },
        )
        .unwrap();
        assert!(dump.contains("printer.lan."));
        assert!(dump.contains("10.0.0.9"));

        handle(
            &state,
            Command::Record {
                name: "printer.lan.".into(),
                action: RecordAction::Delete,
            },
        )
        .unwrap();
        assert!(state.cache.lookup(&domain("printer.lan.")).is_none());
    }

    #[test]
    fn neg_creates_local_negation() {
        let state = test_state();

        handle(
            &state,
            Command::Neg {
                name: "ads.example.".into(),
                rtype: None,
                ttl: None,
            },
        )
        .unwrap();

        let (cent, _) = state.cache.lookup(&domain("ads.example.")).unwrap();
        assert!(cent.is_negative());
        assert!(cent.is_local());
    }

    #[test]
    fn empty_keeps_requested_suffixes() {
        let state = test_state();
        let now = unix_now();

        let mut a = Cent::new(domain("a.example.com."), 0);
        a.add_record(
            300,
            now,
            0,
            dns_types::protocol::types::RecordTypeWithData::A {
                address: Ipv4Addr::new(1, 1, 1, 1),
            },
        )
        .unwrap();
        state.cache.add_cache(a, now);

        let mut b = Cent::new(domain("b.example.net."), 0);
        b.add_record(
            300,
            now,
            0,
            dns_types::protocol::types::RecordTypeWithData::A {
                address: Ipv4Addr::new(2, 2, 2, 2),
            },
        )
        .unwrap();
        state.cache.add_cache(b, now);

        let report = handle(
            &state,
            Command::Empty {
                keep: vec!["example.com.".into()],
            },
        )
        .unwrap();
        assert_eq!("1 entries removed", report);
        assert!(state.cache.lookup(&domain("a.example.com.")).is_some());
        assert!(state.cache.lookup(&domain("b.example.net.")).is_none());
    }

    #[test]
    fn unknown_server_is_an_error() {
        let state = test_state();
        assert!(handle(
            &state,
            Command::Server {
                server: "nonesuch".into(),
                action: ServerAction::Down,
            },
        )
        .is_err());
    }

    #[test]
    fn parse_covers_the_command_set() {
        assert!(matches!(parse("stats"), Ok(Command::Stats)));
        assert!(matches!(
            parse("server 9.9.9.9 down"),
            Ok(Command::Server {
                action: ServerAction::Down,
                ..
            })
        ));
        assert!(matches!(
            parse("record www.example.com. invalidate"),
            Ok(Command::Record {
                action: RecordAction::Invalidate,
                ..
            })
        ));
        assert!(matches!(
            parse("add A printer.lan. 10.0.0.9 3600"),
            Ok(Command::Add { ttl: 3600, .. })
        ));
        assert!(matches!(
            parse("neg ads.example. A 900"),
            Ok(Command::Neg {
                rtype: Some(_),
                ttl: Some(900),
                ..
            })
        ));
        assert!(matches!(parse("source /etc/hosts"), Ok(Command::Source { .. })));
        assert!(matches!(parse("empty example.com."), Ok(Command::Empty { .. })));
        assert!(matches!(
            parse("dump example.com. exact"),
            Ok(Command::Dump { exact: true, .. })
        ));
        assert!(parse("frobnicate").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn stats_report_includes_cache_numbers() {
        let state = test_state();
        let report = handle(&state, Command::Stats).unwrap();
        assert!(report.contains("cache entries"));
        assert!(report.contains("udp queries"));
    }
}
