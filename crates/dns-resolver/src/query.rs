//! The upstream query engine: single exchanges over UDP and TCP with
//! transport fallback, and the parallel admission loop that keeps
//! several servers in flight at once.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};

use dns_types::protocol::edns::{append_opt, EdnsInfo, MIN_UDP_PAYLOAD_SIZE};
use dns_types::protocol::types::*;

use crate::net::{read_tcp_bytes, send_tcp_bytes};
use crate::servers::{QueryTarget, SharedServers, NEEDS_TESTING_NOW, NEEDS_TESTING_SOON};

/// Which transports to use for upstream exchanges, and in which
/// order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum QueryMethod {
    UdpOnly,
    TcpOnly,
    /// UDP first, retrying over TCP when the reply is truncated.
    UdpTcp,
    /// TCP first, falling back to UDP when the connection fails.
    TcpUdp,
}

/// Knobs for a single exchange, identical for every upstream.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub method: QueryMethod,

    /// Above the 512-octet baseline, queries advertise EDNS0 with
    /// this payload size and the receive buffer grows to match.
    pub udp_payload_size: u16,

    /// Bind outgoing UDP sockets to a random port in this range.
    pub port_range: Option<(u16, u16)>,

    pub outgoing_v4: Option<Ipv4Addr>,
    pub outgoing_v6: Option<Ipv6Addr>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            method: QueryMethod::UdpTcp,
            udp_payload_size: MIN_UDP_PAYLOAD_SIZE,
            port_range: None,
            outgoing_v4: None,
            outgoing_v6: None,
        }
    }
}

/// Why an exchange produced no reply.
#[derive(Debug)]
pub enum ExchangeError {
    IO(io::Error),
    Timeout,
    /// The request could not be serialised, or no parseable reply
    /// arrived.
    Malformed,
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ExchangeError::IO(error) => write!(f, "i/o error: {error}"),
            ExchangeError::Timeout => write!(f, "timed out"),
            ExchangeError::Malformed => write!(f, "malformed exchange"),
        }
    }
}

impl std::error::Error for ExchangeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExchangeError::IO(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for ExchangeError {
    fn from(error: io::Error) -> Self {
        ExchangeError::IO(error)
    }
}

/// Send one question to one server and await its reply, applying the
/// configured transport policy, EDNS sizing, and the retry quirks
/// servers in the wild need: a FORMERR answer to an EDNS query is
/// retried without EDNS, and an upstream failure from a server not
/// offering recursion is retried without RD.
pub async fn exchange(
    address: SocketAddr,
    question: &Question,
    recursion_desired: bool,
    per_timeout: Duration,
    opts: &QueryOptions,
) -> Result<Message, ExchangeError> {
    let mut use_edns = opts.udp_payload_size > MIN_UDP_PAYLOAD_SIZE;
    let mut rd = recursion_desired;
    let mut tried_without_edns = false;
    let mut tried_without_rd = false;

    loop {
        let mut request = Message::from_question(rand::random(), question.clone());
        request.header.recursion_desired = rd;
        if use_edns {
            append_opt(&mut request, EdnsInfo::advertising(opts.udp_payload_size));
        }

        let bufsize = if use_edns {
            opts.udp_payload_size as usize
        } else {
            MIN_UDP_PAYLOAD_SIZE as usize
        };

        let response = match opts.method {
            QueryMethod::UdpOnly => {
                udp_exchange(address, &request, bufsize, per_timeout, opts).await?
            }
            QueryMethod::TcpOnly => tcp_exchange(address, &request, per_timeout).await?,
            QueryMethod::UdpTcp => {
                let response =
                    udp_exchange(address, &request, bufsize, per_timeout, opts).await?;
                if response.header.is_truncated {
                    tracing::trace!(%address, "truncated UDP reply, retrying over TCP");
                    match tcp_exchange(address, &request, per_timeout).await {
                        Ok(tcp_response) => tcp_response,
                        // better a truncated answer than none; the
                        // caller sees the TC flag and caches nothing
                        // durable from it
                        Err(_) => response,
                    }
                } else {
                    response
                }
            }
            QueryMethod::TcpUdp => match tcp_exchange(address, &request, per_timeout).await {
                Ok(response) => response,
                Err(ExchangeError::Timeout | ExchangeError::IO(_)) => {
                    tracing::trace!(%address, "TCP failed, falling back to UDP");
                    udp_exchange(address, &request, bufsize, per_timeout, opts).await?
                }
                Err(error) => return Err(error),
            },
        };

        if response.header.rcode == Rcode::FormatError && use_edns && !tried_without_edns {
            tracing::trace!(%address, "FORMERR to an EDNS query, retrying without EDNS");
            use_edns = false;
            tried_without_edns = true;
            continue;
        }

        if matches!(
            response.header.rcode,
            Rcode::ServerFailure | Rcode::NotImplemented | Rcode::Refused
        ) && !response.header.recursion_available
            && rd
            && !tried_without_rd
        {
            tracing::trace!(%address, "upstream failure with RA=0, retrying without RD");
            rd = false;
            tried_without_rd = true;
            continue;
        }

        return Ok(response);
    }
}

async fn udp_exchange(
    address: SocketAddr,
    request: &Message,
    bufsize: usize,
    per_timeout: Duration,
    opts: &QueryOptions,
) -> Result<Message, ExchangeError> {
    let serialised = request.to_octets().map_err(|_| ExchangeError::Malformed)?;

    let sock = bind_udp(address.is_ipv4(), opts).await?;
    sock.connect(address).await?;
    sock.send(&serialised).await?;

    let mut buf = vec![0u8; bufsize];
    match timeout(per_timeout, async {
        loop {
            let len = sock.recv(&mut buf).await?;
            let datagram = &buf[..len];
            match Message::from_octets(datagram) {
                Ok(response) if response_matches_request(request, &response) => {
                    return Ok(response)
                }
                Ok(_) => {
                    // stray or spoofed datagram, keep listening
                    tracing::trace!(%address, "mismatched UDP reply");
                }
                Err(error) => {
                    // a reply cut off mid-record still counts if the
                    // server flagged the truncation
                    if let Some(response) = truncated_stub(request, datagram) {
                        return Ok(response);
                    }
                    tracing::trace!(%address, %error, "unparseable UDP reply");
                }
            }
        }
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout),
    }
}

/// If a datagram has our ID and the TC bit but does not parse, treat
/// it as an empty truncated reply so the transport fallback kicks in.
fn truncated_stub(request: &Message, datagram: &[u8]) -> Option<Message> {
    if datagram.len() < 12 {
        return None;
    }
    let id = u16::from_be_bytes([datagram[0], datagram[1]]);
    let flags1 = datagram[2];
    if id == request.header.id
        && flags1 & HEADER_MASK_QR != 0
        && flags1 & HEADER_MASK_TC != 0
    {
        let mut stub = request.make_response();
        stub.header.is_truncated = true;
        Some(stub)
    } else {
        None
    }
}

async fn tcp_exchange(
    address: SocketAddr,
    request: &Message,
    per_timeout: Duration,
) -> Result<Message, ExchangeError> {
    let serialised = request.to_octets().map_err(|_| ExchangeError::Malformed)?;

    match timeout(per_timeout, async {
        let mut stream = TcpStream::connect(address).await?;
        send_tcp_bytes(&mut stream, &serialised).await?;
        let bytes = read_tcp_bytes(&mut stream).await.map_err(|error| match error {
            crate::net::TcpError::IO { error, .. } => ExchangeError::IO(error),
            crate::net::TcpError::TooShort { .. } => ExchangeError::Malformed,
        })?;

        match Message::from_octets(&bytes) {
            Ok(response) if response_matches_request(request, &response) => Ok(response),
            _ => Err(ExchangeError::Malformed),
        }
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout),
    }
}

/// Bind an outgoing query socket.  With a port range configured, a
/// random port inside the range is picked; on collision another
/// random candidate is tried, with a linear scan as the last resort
/// after `2 * range` random failures.
async fn bind_udp(v4: bool, opts: &QueryOptions) -> Result<UdpSocket, ExchangeError> {
    let local_ip: IpAddr = if v4 {
        opts.outgoing_v4.unwrap_or(Ipv4Addr::UNSPECIFIED).into()
    } else {
        opts.outgoing_v6.unwrap_or(Ipv6Addr::UNSPECIFIED).into()
    };

    let Some((start, end)) = opts.port_range else {
        return Ok(UdpSocket::bind((local_ip, 0)).await?);
    };

    let (start, end) = if start <= end { (start, end) } else { (end, start) };
    let range = u32::from(end - start) + 1;

    for _ in 0..2 * range {
        #[allow(clippy::cast_possible_truncation)]
        let port = start + (u32::from(rand::random::<u16>()) % range) as u16;
        match UdpSocket::bind((local_ip, port)).await {
            Ok(sock) => return Ok(sock),
            Err(error) if error.kind() == io::ErrorKind::AddrInUse => (),
            Err(error) => return Err(error.into()),
        }
    }

    for port in start..=end {
        match UdpSocket::bind((local_ip, port)).await {
            Ok(sock) => return Ok(sock),
            Err(error) if error.kind() == io::ErrorKind::AddrInUse => (),
            Err(error) => return Err(error.into()),
        }
    }

    Err(ExchangeError::IO(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no free port in the configured query port range",
    )))
}

/// Sanity checks tying a reply to its request: the ID, the QR bit,
/// the opcode, and the echoed question must all line up.  The rcode
/// is deliberately not checked here - failures are data the caller
/// wants to see.
pub fn response_matches_request(request: &Message, response: &Message) -> bool {
    if request.header.id != response.header.id {
        return false;
    }
    if !response.header.is_response {
        return false;
    }
    if request.header.opcode != response.header.opcode {
        return false;
    }
    if request.questions != response.questions {
        return false;
    }

    true
}

/// What the resolver thinks of a reply that arrived intact.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReplyVerdict {
    /// Use it, cancel everything else.
    Accept,
    /// An upstream failure with nothing better to offer: keep the
    /// first of these around in case no server does better.
    Tentative,
    /// Poisoned or useless, try the next server.
    Reject,
}

/// A usable reply and the target which produced it.
#[derive(Debug)]
pub struct UpstreamAnswer {
    pub message: Message,
    pub target: QueryTarget,
}

/// Query a list of servers, keeping up to `par_queries` exchanges in
/// flight.  Queries already running keep running while fresh ones are
/// admitted, so one slow server does not hold up the others.  The
/// first reply the `validate` callback accepts wins and the rest are
/// aborted; failures flag the server for re-testing.
pub async fn query_upstreams(
    targets: &[QueryTarget],
    question: &Question,
    par_queries: usize,
    global_timeout: Duration,
    opts: &QueryOptions,
    servers: &SharedServers,
    validate: impl Fn(&Message, &QueryTarget) -> ReplyVerdict + Send,
) -> Result<UpstreamAnswer, ExchangeError> {
    let mut set: JoinSet<(QueryTarget, Result<Message, ExchangeError>)> = JoinSet::new();
    let mut pending = targets.iter().cloned();
    let deadline = Instant::now() + global_timeout;
    let mut tentative: Option<UpstreamAnswer> = None;

    for _ in 0..par_queries.max(1) {
        admit_next(&mut set, &mut pending, question, opts);
    }

    while !set.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let joined = match timeout(remaining, set.join_next()).await {
            Err(_) => break,
            Ok(None) => break,
            Ok(Some(joined)) => joined,
        };

        match joined {
            Ok((target, Ok(message))) => {
                if let Ok(mut table) = servers.write() {
                    table.record_success(target.address, dns_cache::unix_now());
                }
                match validate(&message, &target) {
                    ReplyVerdict::Accept => {
                        set.abort_all();
                        return Ok(UpstreamAnswer { message, target });
                    }
                    ReplyVerdict::Tentative => {
                        if tentative.is_none() {
                            tentative = Some(UpstreamAnswer { message, target });
                        }
                        admit_next(&mut set, &mut pending, question, opts);
                    }
                    ReplyVerdict::Reject => {
                        tracing::debug!(address = %target.address, "rejected upstream reply");
                        admit_next(&mut set, &mut pending, question, opts);
                    }
                }
            }
            Ok((target, Err(error))) => {
                note_failure(servers, &target, &error);
                admit_next(&mut set, &mut pending, question, opts);
            }
            Err(join_error) => {
                tracing::warn!(%join_error, "upstream query task died");
                admit_next(&mut set, &mut pending, question, opts);
            }
        }
    }

    set.abort_all();
    tentative.ok_or(ExchangeError::Timeout)
}

fn admit_next(
    set: &mut JoinSet<(QueryTarget, Result<Message, ExchangeError>)>,
    pending: &mut (impl Iterator<Item = QueryTarget> + Send),
    question: &Question,
    opts: &QueryOptions,
) {
    if let Some(target) = pending.next() {
        let question = question.clone();
        let opts = opts.clone();
        set.spawn(async move {
            let result = exchange(
                target.address,
                &question,
                target.recursion_desired,
                target.timeout,
                &opts,
            )
            .await;
            (target, result)
        });
    }
}

/// Connection-level failures mean the server may be down: flag it so
/// the status probe re-tests it.  Repeated timeouts ask for an
/// immediate probe.
fn note_failure(servers: &SharedServers, target: &QueryTarget, error: &ExchangeError) {
    let level = match error {
        ExchangeError::Timeout => Some(NEEDS_TESTING_NOW),
        ExchangeError::IO(io_error) => match io_error.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::NetworkDown => Some(NEEDS_TESTING_SOON),
            _ => None,
        },
        ExchangeError::Malformed => None,
    };

    tracing::debug!(address = %target.address, %error, "upstream exchange failed");

    if let Some(level) = level {
        if let Ok(mut table) = servers.write() {
            table.flag_for_testing(target.address, level);
        }
    }
}
