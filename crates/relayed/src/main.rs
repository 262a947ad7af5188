#![warn(clippy::pedantic)]
// Sometimes a redundant else is clearer
#![allow(clippy::redundant_else)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

mod answer;
mod control;
mod local;
mod settings;
mod stats;

use bytes::BytesMut;
use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

use dns_cache::{persist, unix_now, Cache, SharedCache};
use dns_resolver::context::ResolverOpts;
use dns_resolver::net::{read_tcp_bytes, send_tcp_bytes};
use dns_resolver::servers::{new_shared_servers, ServerSection, SharedServers};
use dns_types::protocol::types::Message;

use crate::settings::Settings;
use crate::stats::Stats;

/// Everything the listener tasks share.
pub struct AppState {
    pub opts: ResolverOpts,
    pub sections: Vec<ServerSection>,
    pub servers: SharedServers,
    pub cache: SharedCache,
    pub stats: Arc<Stats>,
    pub randomize_recs: bool,
    pub udpbufsize: u16,
    pub neg_ttl: u32,
    /// Combined active + queued worker budget.
    pub worker_limit: usize,
    pub tcp_qtimeout: Duration,
}

async fn handle_raw_message(state: &Arc<AppState>, buf: &[u8]) -> Option<(Message, usize)> {
    let res = Message::from_octets(buf);
    tracing::debug!(message = ?res, "got message");

    match res {
        Ok(msg) => answer::handle_message(state, msg).await,
        Err(err) => err
            .id()
            .map(|id| (Message::make_format_error_response(id), 512)),
    }
}

async fn listen_tcp_task(state: Arc<AppState>, socket: TcpListener) {
    loop {
        match socket.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(?peer, "TCP connection");
                if !state.stats.try_spawn_worker(state.worker_limit) {
                    tracing::debug!(?peer, "worker budget exhausted, dropping connection");
                    continue;
                }

                let state = state.clone();
                tokio::spawn(async move {
                    handle_tcp_connection(&state, stream).await;
                    state.stats.worker_done();
                });
            }
            Err(error) => tracing::debug!(?error, "TCP accept error"),
        }
    }
}

/// One TCP client: length-prefixed queries, answered in order, until
/// the client goes away or takes too long over its next query.
async fn handle_tcp_connection(state: &Arc<AppState>, mut stream: TcpStream) {
    loop {
        let bytes = match timeout(state.tcp_qtimeout, read_tcp_bytes(&mut stream)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(error)) => {
                if let Some(id) = error.id() {
                    let response = Message::make_format_error_response(id);
                    if let Ok(serialised) = response.to_octets() {
                        let _ = send_tcp_bytes(&mut stream, &serialised).await;
                    }
                }
                return;
            }
            Err(_) => return,
        };

        state
            .stats
            .tcp_queries
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let Some((response, _)) = handle_raw_message(state, bytes.as_ref()).await else {
            return;
        };

        match response.to_octets() {
            Ok(serialised) => {
                if let Err(error) = send_tcp_bytes(&mut stream, &serialised).await {
                    tracing::debug!(?error, "TCP send error");
                    return;
                }
            }
            Err(error) => {
                tracing::warn!(?response, ?error, "could not serialise message");
                return;
            }
        }
    }
}

async fn listen_udp_task(state: Arc<AppState>, socket: UdpSocket) {
    let (tx, mut rx) = mpsc::channel::<(Message, std::net::SocketAddr, usize)>(32);
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            Ok((size, peer)) = socket.recv_from(&mut buf) => {
                tracing::debug!(?peer, "UDP request");
                state.stats.udp_queries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                if !state.stats.try_spawn_worker(state.worker_limit) {
                    tracing::debug!(?peer, "worker budget exhausted, dropping datagram");
                    continue;
                }

                let bytes = BytesMut::from(&buf[..size]);
                let reply = tx.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    if let Some((response, budget)) = handle_raw_message(&state, bytes.as_ref()).await {
                        if let Err(error) = reply.send((response, peer, budget)).await {
                            tracing::debug!(?peer, ?error, "UDP reply channel error");
                        }
                    }
                    state.stats.worker_done();
                });
            }

            Some((message, peer, budget)) = rx.recv() => {
                // replying on the listening socket keeps the reply's
                // source address equal to the query's destination
                match message.to_octets_bounded(budget) {
                    Ok(serialised) => {
                        if let Err(error) = socket.send_to(&serialised, peer).await {
                            tracing::debug!(?peer, ?error, "UDP send error");
                        }
                    }
                    Err(error) => {
                        tracing::warn!(?peer, ?message, ?error, "could not serialise message");
                    }
                }
            }
        }
    }
}

/// The administrative channel: a UNIX stream socket in the cache
/// directory, one text command per line, answered with a report
/// terminated by a lone `.` line.
async fn control_task(state: Arc<AppState>, listener: tokio::net::UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    handle_control_client(&state, stream).await;
                });
            }
            Err(error) => tracing::debug!(?error, "control accept error"),
        }
    }
}

async fn handle_control_client(state: &Arc<AppState>, stream: tokio::net::UnixStream) {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let report = control::parse(&line)
            .and_then(|command| control::handle(state, command))
            .unwrap_or_else(|error| format!("error: {error}"));

        if write.write_all(report.as_bytes()).await.is_err() {
            return;
        }
        if write.write_all(b"\n.\n").await.is_err() {
            return;
        }
    }
}

/// Purge the cache back under its byte budget every 5 minutes.
async fn purge_cache_task(cache: SharedCache) {
    loop {
        sleep(Duration::from_secs(60 * 5)).await;
        let stats = cache.purge(unix_now(), true);
        if stats.sets_removed > 0 || stats.entries_removed > 0 {
            tracing::info!(
                sets = %stats.sets_removed,
                entries = %stats.entries_removed,
                "periodic purge"
            );
        }
    }
}

/// Reload local records on SIGUSR1.
async fn reload_task(state: Arc<AppState>, settings: Settings) {
    let mut stream = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGUSR1");
            return;
        }
    };

    loop {
        stream.recv().await;
        tracing::info!("SIGUSR1 received, reloading local records");
        match local::load_local_records(&settings, &state.cache).await {
            Ok(count) => tracing::info!(%count, "local records reloaded"),
            Err(error) => tracing::warn!(%error, "could not reload local records"),
        }
    }
}

async fn wait_for_shutdown() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGTERM");
            process::exit(1);
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = term.recv() => tracing::info!("SIGTERM received"),
    }
}

/// Write the cache file on the way out.  Uses the polite write lock:
/// a wedged reader costs us the disk cache, not the shutdown.
fn save_cache_on_shutdown(settings: &Settings, cache: &SharedCache) {
    match cache.try_write_softly() {
        Some(mut guard) => {
            guard.purge(unix_now(), false);
            match persist::save_dir(&settings.cache_dir, &guard) {
                Ok(count) => tracing::info!(%count, "wrote disk cache"),
                Err(error) => tracing::warn!(%error, "could not write disk cache"),
            }
        }
        None => tracing::warn!("could not take the cache lock; disk cache not written"),
    }
}

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("pretty") {
        if log_format.contains("no-time") {
            logger.pretty().without_time().init();
        } else {
            logger.pretty().init();
        }
    } else if log_format.contains("compact") {
        if log_format.contains("no-time") {
            logger.compact().without_time().init();
        } else {
            logger.compact().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Clone, Parser)]
/// A recursive, caching DNS proxy.
///
/// relayed answers local clients over UDP and TCP, from its cache
/// where possible and by querying upstream nameservers (configured
/// proxies, or a walk down from the root servers) where not.  The
/// cache persists across restarts, locally defined records override
/// the world, and negative answers are cached per policy.
struct Args {
    /// Path to the settings file
    #[clap(short, long, value_parser, env = "RELAYED_CONFIG")]
    config: Option<PathBuf>,

    /// Override the port to serve DNS on
    #[clap(short, long, value_parser)]
    port: Option<u16>,

    /// Override the cache directory
    #[clap(long, value_parser)]
    cache_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    let mut settings = match &args.config {
        Some(path) => match Settings::new(&path.display().to_string()) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::error!(%error, "could not load settings");
                process::exit(1);
            }
        },
        None => Settings::defaults(),
    };
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(cache_dir) = args.cache_dir {
        settings.cache_dir = cache_dir;
    }

    let mut cache_inner = Cache::new(settings.perm_cache, settings.ttl_limits());
    match persist::load_dir(&settings.cache_dir, &mut cache_inner, unix_now()) {
        Ok(count) => tracing::info!(%count, "loaded disk cache"),
        Err(persist::Error::BadVersion(tag)) => {
            tracing::warn!(?tag, "disk cache has an unknown version tag, starting cold");
        }
        Err(error) => tracing::warn!(%error, "could not read disk cache, starting cold"),
    }
    let cache = SharedCache::new(cache_inner);

    match local::load_local_records(&settings, &cache).await {
        Ok(count) => tracing::info!(%count, "loaded local records"),
        Err(error) => {
            tracing::error!(%error, "could not load local records");
            process::exit(1);
        }
    }

    let opts = match settings.resolver_opts() {
        Ok(opts) => opts,
        Err(error) => {
            tracing::error!(%error, "bad resolver settings");
            process::exit(1);
        }
    };
    let sections = match settings.server_sections() {
        Ok(sections) => sections,
        Err(error) => {
            tracing::error!(%error, "bad server settings");
            process::exit(1);
        }
    };

    let state = Arc::new(AppState {
        opts,
        sections,
        servers: new_shared_servers(),
        cache: cache.clone(),
        stats: Arc::new(Stats::new()),
        randomize_recs: settings.randomize_recs,
        udpbufsize: settings.udpbufsize,
        neg_ttl: settings.neg_ttl,
        worker_limit: settings.proc_limit + settings.procq_limit,
        tcp_qtimeout: Duration::from_secs(settings.tcp_qtimeout),
    });

    tracing::info!(address = %settings.server_ip, port = %settings.port, "binding DNS UDP socket");
    let udp = match UdpSocket::bind((settings.server_ip, settings.port)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(address = %settings.server_ip, port = %settings.port, "binding DNS TCP socket");
    let tcp = match TcpListener::bind((settings.server_ip, settings.port)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS TCP socket");
            process::exit(1);
        }
    };

    let control_path = settings.cache_dir.join("relayed.status");
    let _ = std::fs::remove_file(&control_path);
    match tokio::net::UnixListener::bind(&control_path) {
        Ok(listener) => {
            tracing::info!(path = %control_path.display(), "control socket ready");
            tokio::spawn(control_task(state.clone(), listener));
        }
        Err(error) => {
            tracing::warn!(?error, path = %control_path.display(), "could not bind control socket");
        }
    }

    tokio::spawn(listen_udp_task(state.clone(), udp));
    tokio::spawn(listen_tcp_task(state.clone(), tcp));
    tokio::spawn(purge_cache_task(cache.clone()));
    tokio::spawn(reload_task(state.clone(), settings.clone()));

    wait_for_shutdown().await;

    save_cache_on_shutdown(&settings, &cache);
}

#[cfg(test)]
pub mod test_util {
    use super::*;

    /// A state with defaults and an empty cache, for handler tests.
    pub fn test_state() -> AppState {
        let settings = Settings::defaults();
        AppState {
            opts: settings.resolver_opts().unwrap(),
            sections: Vec::new(),
            servers: new_shared_servers(),
            cache: SharedCache::new(Cache::new(settings.perm_cache, settings.ttl_limits())),
            stats: Arc::new(Stats::new()),
            randomize_recs: settings.randomize_recs,
            udpbufsize: settings.udpbufsize,
            neg_ttl: settings.neg_ttl,
            worker_limit: settings.proc_limit + settings.procq_limit,
            tcp_qtimeout: Duration::from_secs(settings.tcp_qtimeout),
        }
    }
}
