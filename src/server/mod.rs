//! Digest-echo server: reactor loop and connection registry.
//!
//! A single reactor thread owns the mio `Poll` and translates readiness
//! events into tasks for the worker pool. The reactor never performs
//! payload I/O itself: an acceptable listener event becomes an `Accept`
//! task on the pool's immediate path, a readable connection event becomes
//! a `ReadWrite` task on the batched path.
//!
//! Interest discipline: the listener is deregistered before an Accept task
//! is submitted and re-registered by the task as its last action, so at
//! most one Accept task is ever pending. Likewise a connection's stream is
//! deregistered before its ReadWrite task is submitted and re-registered
//! only after the task completes, so at most one ReadWrite task per
//! connection is in the queue or executing at any time.

pub mod pool;
pub mod task;

use crate::config::{ServerConfig, Tuning};
use crate::stats::{spawn_server_reporter, ServerStats};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use pool::WorkerPool;
use slab::Slab;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use task::{AcceptTask, ReadWriteTask, Task};
use tracing::{debug, error, info};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Bounded wait per poll iteration. The original design spins on a
/// non-blocking readiness check; a short wait keeps the dispatch latency
/// equivalent without pinning a core. Tests must not depend on the cadence.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// A live client socket. Owned by the registry slab, shared with workers
/// through `Arc<Mutex<_>>` for payload I/O and interest restoration.
pub struct Connection {
    pub stream: TcpStream,
    /// Cleared on teardown; a closed connection never re-enters the poll.
    pub open: bool,
}

/// State shared between the reactor thread and the worker pool.
pub struct ServerShared {
    pub registry: Registry,
    pub listener: Mutex<TcpListener>,
    pub connections: Mutex<Slab<Arc<Mutex<Connection>>>>,
    pub stats: Arc<ServerStats>,
    pub tuning: Tuning,
}

/// Run the server until the process is killed.
pub fn run(config: ServerConfig, tuning: Tuning) -> io::Result<()> {
    let server = Server::bind(&config, tuning)?;
    server.run(&config)
}

/// Reactor-side server state.
pub struct Server {
    poll: Poll,
    events: Events,
    shared: Arc<ServerShared>,
}

impl Server {
    /// Bind the listening socket and set up the poll registration.
    pub fn bind(config: &ServerConfig, tuning: Tuning) -> io::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let mut listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let registry = poll.registry().try_clone()?;

        info!(addr = %local_addr, "Server listening");

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            shared: Arc::new(ServerShared {
                registry,
                listener: Mutex::new(listener),
                connections: Mutex::new(Slab::new()),
                stats: ServerStats::new(),
                tuning,
            }),
        })
    }

    /// Address the listener is bound to. Useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .local_addr()
    }

    /// Start the worker pool and stats reporter, then run the reactor loop.
    /// Never returns under normal operation.
    pub fn run(mut self, config: &ServerConfig) -> io::Result<()> {
        let pool = WorkerPool::new(
            config.workers,
            config.max_batch_size,
            config.max_batch_latency,
        );
        pool.start();

        spawn_server_reporter(
            Arc::clone(&self.shared.stats),
            self.shared.tuning.stats_delay,
            self.shared.tuning.stats_interval,
        );

        loop {
            self.poll_once(&pool, Some(POLL_TIMEOUT))?;
        }
    }

    /// One reactor iteration: poll readiness, dispatch every ready key.
    fn poll_once(&mut self, pool: &WorkerPool, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.dispatch_acceptable(pool),
                Token(conn_id) => {
                    if event.is_readable() {
                        self.dispatch_readable(conn_id, pool);
                    }
                }
            }
        }

        Ok(())
    }

    /// Clear accept interest and hand an Accept task to the immediate path.
    fn dispatch_acceptable(&self, pool: &WorkerPool) {
        {
            let mut listener = self
                .shared
                .listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = self.shared.registry.deregister(&mut *listener) {
                error!(error = %e, "Failed to clear accept interest");
                return;
            }
        }
        debug!("Listener ready, submitting accept task");
        pool.submit_immediate(Task::Accept(AcceptTask::new(Arc::clone(&self.shared))));
    }

    /// Count the message, clear read interest, and hand a ReadWrite task to
    /// the batched path.
    fn dispatch_readable(&self, conn_id: usize, pool: &WorkerPool) {
        let conn = {
            let connections = self
                .shared
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match connections.get(conn_id) {
                Some(conn) => Arc::clone(conn),
                None => return,
            }
        };

        self.shared.stats.record(conn_id);

        {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = self.shared.registry.deregister(&mut conn.stream) {
                error!(conn_id, error = %e, "Failed to clear read interest");
                return;
            }
        }

        debug!(conn_id, "Connection readable, submitting read-write task");
        pool.submit_batched(ReadWriteTask::new(
            Arc::clone(&self.shared),
            conn,
            conn_id,
        ));
    }
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR`.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::thread;

    /// A server-side harness for unit tests: a bound listener, a poll, and
    /// `conns` established connections with their client-side peers.
    pub(crate) struct Fixture {
        pub shared: Arc<ServerShared>,
        pub poll: Poll,
        pub peers: Vec<std::net::TcpStream>,
        pub addr: SocketAddr,
    }

    pub(crate) fn tuning(payload_size: usize, io_timeout: Duration) -> Tuning {
        Tuning {
            payload_size,
            digest_width: 40,
            stats_interval: Duration::from_secs(20),
            stats_delay: Duration::from_secs(5),
            io_timeout,
        }
    }

    pub(crate) fn fixture(conns: usize, tuning: Tuning) -> Fixture {
        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let shared = Arc::new(ServerShared {
            registry,
            listener: Mutex::new(listener),
            connections: Mutex::new(Slab::new()),
            stats: ServerStats::new(),
            tuning,
        });

        let mut peers = Vec::with_capacity(conns);
        for _ in 0..conns {
            let peer = std::net::TcpStream::connect(addr).unwrap();
            let stream = accept_blocking(&shared);
            let conn = Arc::new(Mutex::new(Connection { stream, open: true }));
            let conn_id = shared
                .connections
                .lock()
                .unwrap()
                .insert(Arc::clone(&conn));
            shared.stats.register(conn_id);
            peers.push(peer);
        }

        Fixture {
            shared,
            poll,
            peers,
            addr,
        }
    }

    pub(crate) fn connection(fixture: &Fixture, conn_id: usize) -> Arc<Mutex<Connection>> {
        Arc::clone(fixture.shared.connections.lock().unwrap().get(conn_id).unwrap())
    }

    fn accept_blocking(shared: &ServerShared) -> TcpStream {
        loop {
            let result = shared.listener.lock().unwrap().accept();
            match result {
                Ok((stream, _)) => return stream,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }
}
