//! Traffic-generating client.
//!
//! The client exists only to exercise the server: a sender thread emits
//! random payloads at a fixed rate and records the digest it expects back,
//! while the reactor here blocks on the poll (the client has no other
//! work), reads fixed-width digests, and matches them against the pending
//! list.

pub mod sender;

use crate::config::{ClientConfig, Tuning};
use crate::stats::{spawn_client_reporter, ClientStats};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read};
use std::net::ToSocketAddrs;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const STREAM_TOKEN: Token = Token(0);

/// Pause between read retries on a partially received digest.
const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Connect and run the client until the process is killed or the server
/// closes the connection.
pub fn run(config: ClientConfig, tuning: Tuning) -> io::Result<()> {
    let addr = format!("{}:{}", config.host, config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "host did not resolve")
        })?;

    let std_stream = std::net::TcpStream::connect(addr)?;
    std_stream.set_nonblocking(true)?;
    let mut stream = TcpStream::from_std(std_stream);
    info!(addr = %addr, rate = config.rate, "Client connected");

    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut stream, STREAM_TOKEN, Interest::READABLE)?;

    let stream = Arc::new(Mutex::new(stream));
    let pending: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let stats = ClientStats::new();

    sender::spawn_sender(
        Arc::clone(&stream),
        Arc::clone(&pending),
        Arc::clone(&stats),
        config.rate,
        tuning.clone(),
    );
    spawn_client_reporter(Arc::clone(&stats), tuning.stats_delay, tuning.stats_interval);

    read_digests(&mut poll, &stream, &pending, &stats, &tuning)
}

/// Blocking-poll read loop: each readiness event yields one or more
/// fixed-width digests.
fn read_digests(
    poll: &mut Poll,
    stream: &Arc<Mutex<TcpStream>>,
    pending: &Arc<Mutex<Vec<String>>>,
    stats: &Arc<ClientStats>,
    tuning: &Tuning,
) -> io::Result<()> {
    let mut events = Events::with_capacity(64);
    let mut digest_buf = vec![0u8; tuning.digest_width];

    loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            if event.token() != STREAM_TOKEN || !event.is_readable() {
                continue;
            }

            // A batch flush on the server can deliver several digests in
            // one readiness event; drain them all
            while read_one_digest(stream, &mut digest_buf)? {
                stats.record_received();

                let digest = String::from_utf8_lossy(&digest_buf).into_owned();
                let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
                if take_matching(&mut pending, &digest) {
                    debug!(digest = %digest, "Digest matched");
                } else {
                    warn!(digest = %digest, "Received digest with no pending match");
                }
            }
        }
    }
}

/// Read exactly one digest, looping on partial reads. Returns `false` when
/// no data is available at all (spurious or exhausted readiness). The
/// stream lock is held for the duration of one digest so the sender cannot
/// interleave.
fn read_one_digest(stream: &Arc<Mutex<TcpStream>>, buf: &mut [u8]) -> io::Result<bool> {
    let mut stream = stream.lock().unwrap_or_else(PoisonError::into_inner);
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ))
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if filled == 0 {
                    return Ok(false);
                }
                // Mid-digest; the rest is on the wire
                thread::sleep(RETRY_INTERVAL);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Remove one entry equal to `digest` from the pending list. Duplicate
/// digests (identical payloads in flight) each consume one entry.
fn take_matching(pending: &mut Vec<String>, digest: &str) -> bool {
    match pending.iter().position(|h| h == digest) {
        Some(pos) => {
            pending.remove(pos);
            true
        }
        None => false,
    }
}
