//! Units of deferred work produced by the reactor.
//!
//! A closed set of variants dispatched through one `run` operation. Each
//! task runs exactly once, on whichever worker dequeues it. Failures are
//! contained to the task: they are logged and, for transport failures,
//! resolved by tearing the connection down. Nothing propagates back to the
//! reactor or to other workers.

use super::{Connection, ServerShared, LISTENER_TOKEN};
use crate::digest::wire_digest;
use mio::{Interest, Token};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Pause between retries while a non-blocking read or write reports no
/// progress. Bounded overall by the configured io timeout.
const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// A unit of work for the pool.
pub enum Task {
    Accept(AcceptTask),
    ReadWrite(ReadWriteTask),
    /// An ordered batch, executed sequentially on a single worker.
    Batch(Vec<ReadWriteTask>),
}

impl Task {
    pub fn run(self) {
        match self {
            Task::Accept(task) => task.run(),
            Task::ReadWrite(task) => task.run(),
            Task::Batch(tasks) => {
                for task in tasks {
                    task.run();
                }
            }
        }
    }
}

/// Accepts one pending connection and restores accept interest.
pub struct AcceptTask {
    shared: Arc<ServerShared>,
}

impl AcceptTask {
    pub(crate) fn new(shared: Arc<ServerShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn run(self) {
        if let Err(e) = self.accept() {
            warn!(error = %e, "Accept task failed");
        }
    }

    fn accept(&self) -> io::Result<()> {
        let mut listener = self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let conn = Arc::new(Mutex::new(Connection { stream, open: true }));
                let conn_id = {
                    let mut connections = self
                        .shared
                        .connections
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    connections.insert(Arc::clone(&conn))
                };
                self.shared.stats.register(conn_id);

                let registered = {
                    let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
                    self.shared.registry.register(
                        &mut conn.stream,
                        Token(conn_id),
                        Interest::READABLE,
                    )
                };
                match registered {
                    Ok(()) => debug!(conn_id, peer = %peer_addr, "Accepted connection"),
                    Err(e) => {
                        warn!(conn_id, error = %e, "Failed to register connection");
                        let mut connections = self
                            .shared
                            .connections
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        connections.remove(conn_id);
                        self.shared.stats.remove(conn_id);
                    }
                }
            }
            // Spurious wakeup: nothing pending, restore interest and move on
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "Accept failed"),
        }

        // Restoring accept interest is the last action, mirroring the
        // read-interest discipline of ReadWrite tasks
        self.shared
            .registry
            .register(&mut *listener, LISTENER_TOKEN, Interest::READABLE)
    }
}

/// One request/response round trip: read a full payload, digest it, write
/// the fixed-width digest back, restore read interest.
pub struct ReadWriteTask {
    shared: Arc<ServerShared>,
    conn: Arc<Mutex<Connection>>,
    conn_id: usize,
}

impl ReadWriteTask {
    pub(crate) fn new(
        shared: Arc<ServerShared>,
        conn: Arc<Mutex<Connection>>,
        conn_id: usize,
    ) -> Self {
        Self {
            shared,
            conn,
            conn_id,
        }
    }

    pub(crate) fn conn_id(&self) -> usize {
        self.conn_id
    }

    pub(crate) fn run(self) {
        if let Err(e) = self.round_trip() {
            warn!(conn_id = self.conn_id, error = %e, "Read-write task failed, closing connection");
            self.teardown();
        }
    }

    fn round_trip(&self) -> io::Result<()> {
        let payload_size = self.shared.tuning.payload_size;
        let digest_width = self.shared.tuning.digest_width;
        let deadline = Instant::now() + self.shared.tuning.io_timeout;

        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let mut payload = vec![0u8; payload_size];
        read_full(&mut conn.stream, &mut payload, deadline)?;

        let response = wire_digest(&payload, digest_width);
        debug!(conn_id = self.conn_id, digest = %response, "Writing digest");
        write_full(&mut conn.stream, response.as_bytes(), deadline)?;

        // Restoring read interest must be the very last action: doing it any
        // earlier would let the reactor observe readiness for this connection
        // while the task is still mid-flight
        self.shared
            .registry
            .register(&mut conn.stream, Token(self.conn_id), Interest::READABLE)
    }

    /// Registered -> Closed: drop the registry entry, the poll registration,
    /// and the stats entry. The socket closes when the last `Arc` drops.
    fn teardown(&self) {
        {
            let mut connections = self
                .shared
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if connections.contains(self.conn_id) {
                connections.remove(self.conn_id);
            }
        }

        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.open = false;
        // The reactor already cleared the poll registration for this task;
        // deregister again only to cover teardown from other paths
        let _ = self.shared.registry.deregister(&mut conn.stream);
        self.shared.stats.remove(self.conn_id);
        debug!(conn_id = self.conn_id, "Connection closed");
    }
}

/// Read exactly `buf.len()` bytes from a non-blocking stream, looping on
/// partial reads. Fails with `UnexpectedEof` on end-of-stream and
/// `TimedOut` once `deadline` passes with the buffer still unfilled.
fn read_full(stream: &mut mio::net::TcpStream, buf: &mut [u8], deadline: Instant) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-message",
                ))
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write all of `buf` to a non-blocking stream, looping on partial writes
/// with the same deadline discipline as [`read_full`].
fn write_full(stream: &mut mio::net::TcpStream, buf: &[u8], deadline: Instant) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
