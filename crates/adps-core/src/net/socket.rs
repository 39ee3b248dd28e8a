//! Socket backend: request-reply over persistent TCP connections.
//!
//! The server owns one listening endpoint. Every accepted connection gets a
//! lightweight reader thread that only frames requests and queues them; the
//! fixed worker pool takes requests off the shared queue, dispatches them and
//! writes each reply back on the connection it came from.
//!
//! # Shutdown
//!
//! When the shutdown token fires the acceptor stops, the read half of every
//! connection is closed so no new requests enter the queue, and the workers
//! drain whatever was already queued before `run()` returns. Workers only
//! exit once every sender of the queue is gone.

use super::frame::{read_frame, write_frame};
use super::{Backend, ClientTransport, NetConfig, NetInterface};
use crate::config::{ClientConfig, ServerConfig};
use crate::dispatch::{Dispatcher, ServerCore, ServerState};
use crate::error::{PsError, Result};
use crate::message::{Message, MessageType};
use crate::shutdown::ShutdownToken;
use crate::store::{GlobalAnomalyStats, ParameterInterface};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Strip an optional `tcp://` scheme and map the `*` wildcard host.
pub fn parse_endpoint(address: &str) -> Result<String> {
    let rest = match address.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("tcp") => rest,
        Some((scheme, _)) => {
            return Err(PsError::connection(format!(
                "unsupported endpoint scheme '{}' in {}",
                scheme, address
            )))
        }
        None => address,
    };
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| PsError::connection(format!("endpoint {} has no port", address)))?;
    port.parse::<u16>()
        .map_err(|_| PsError::connection(format!("invalid port in endpoint {}", address)))?;
    let host = if host == "*" { "0.0.0.0" } else { host };
    Ok(format!("{}:{}", host, port))
}

struct Job {
    bytes: Vec<u8>,
    writer: Arc<Mutex<TcpStream>>,
    peer: SocketAddr,
}

type ConnectionMap = Arc<Mutex<HashMap<u64, TcpStream>>>;

/// Server side of the socket backend.
pub struct SocketNet {
    core: ServerCore,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    connections: ConnectionMap,
    next_conn_id: Arc<AtomicU64>,
}

impl SocketNet {
    pub fn new() -> Self {
        Self {
            core: ServerCore::new(),
            listener: None,
            local_addr: None,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Address the listener is bound to (after `initialize`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        self.core.state()
    }

    fn spawn_workers(
        &self,
        dispatcher: &Arc<Dispatcher>,
        queue: Arc<Mutex<Receiver<Job>>>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let threads = self.core.threads();
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let dispatcher = Arc::clone(dispatcher);
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("ps-worker-{}", i))
                .spawn(move || worker_loop(&dispatcher, &queue))?;
            handles.push(handle);
        }
        Ok(handles)
    }

    fn accept_loop(
        &self,
        listener: &TcpListener,
        tx: &Sender<Job>,
        readers: &mut Vec<JoinHandle<()>>,
    ) {
        let token = &self.core.shutdown;
        while !token.is_triggered() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    reap_finished(readers);
                    match self.register(stream, peer, tx.clone()) {
                        Ok(handle) => readers.push(handle),
                        Err(e) => warn!("Dropping connection from {}: {}", peer, e),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    token.wait_timeout(ServerConfig::POLL_INTERVAL);
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    token.wait_timeout(ServerConfig::POLL_INTERVAL);
                }
            }
        }
    }

    fn register(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        tx: Sender<Job>,
    ) -> Result<JoinHandle<()>> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let writer = Arc::new(Mutex::new(stream.try_clone()?));
        self.connections.lock().insert(id, stream.try_clone()?);

        debug!("Connection {} from {}", id, peer);
        let connections = Arc::clone(&self.connections);
        let handle = thread::Builder::new()
            .name(format!("ps-conn-{}", id))
            .spawn(move || {
                read_loop(stream, peer, writer, tx);
                connections.lock().remove(&id);
                debug!("Connection {} from {} closed", id, peer);
            })?;
        Ok(handle)
    }

    fn close_connections(&self, how: Shutdown) {
        for stream in self.connections.lock().values() {
            let _ = stream.shutdown(how);
        }
    }
}

impl Default for SocketNet {
    fn default() -> Self {
        Self::new()
    }
}

/// Join reader threads whose connection has already closed.
fn reap_finished(readers: &mut Vec<JoinHandle<()>>) -> usize {
    let (done, live): (Vec<_>, Vec<_>) = readers.drain(..).partition(|h| h.is_finished());
    *readers = live;
    let reaped = done.len();
    for handle in done {
        if handle.join().is_err() {
            error!("Connection reader panicked");
        }
    }
    reaped
}

fn read_loop(
    mut stream: TcpStream,
    peer: SocketAddr,
    writer: Arc<Mutex<TcpStream>>,
    tx: Sender<Job>,
) {
    loop {
        match read_frame(&mut stream) {
            Ok(Some(bytes)) => {
                let job = Job {
                    bytes,
                    writer: Arc::clone(&writer),
                    peer,
                };
                if tx.send(job).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Connection from {} ended: {}", peer, e);
                break;
            }
        }
    }
}

fn worker_loop(dispatcher: &Dispatcher, queue: &Mutex<Receiver<Job>>) {
    loop {
        let next = queue.lock().recv();
        match next {
            Ok(job) => {
                let fallback = MessageType::ReqCmd;
                let out = dispatcher.handle(&job.bytes, fallback);
                let encoded = out.reply.encode();
                let mut writer = job.writer.lock();
                if let Err(e) = write_frame(&mut *writer, &encoded) {
                    warn!("Failed to reply to {}: {}", job.peer, e);
                }
            }
            // Every reader and the acceptor have dropped their senders.
            Err(_) => break,
        }
    }
}

impl NetInterface for SocketNet {
    fn backend(&self) -> Backend {
        Backend::Socket
    }

    fn initialize(&mut self, config: &NetConfig) -> Result<()> {
        if self.core.state() != ServerState::Uninitialized {
            return Err(PsError::usage(format!(
                "initialize called in state {:?}",
                self.core.state()
            )));
        }
        let endpoint = parse_endpoint(&config.address)?;
        let listener = TcpListener::bind(&endpoint).map_err(|e| PsError::Connection {
            message: format!("failed to bind {}", endpoint),
            cause: Some(e.to_string()),
        })?;
        listener.set_nonblocking(true)?;
        self.core.mark_initialized(config.threads)?;

        let addr = listener.local_addr()?;
        info!(
            "Socket backend listening on {} with {} worker threads",
            addr,
            self.core.threads()
        );
        self.local_addr = Some(addr);
        self.listener = Some(listener);
        Ok(())
    }

    fn set_parameter_store(&mut self, store: Arc<dyn ParameterInterface>) {
        *self.core.store.lock() = Some(store);
    }

    fn set_anomaly_stats(&mut self, stats: Arc<GlobalAnomalyStats>) {
        *self.core.anomaly_stats.lock() = Some(stats);
    }

    fn run(&mut self) -> Result<()> {
        let dispatcher = self
            .core
            .begin_serving(ServerConfig::SERVER_RANK, Backend::Socket.identifier())?;
        let listener = self
            .listener
            .take()
            .ok_or_else(|| PsError::usage("socket listener is not open"))?;

        let (tx, rx) = mpsc::channel::<Job>();
        let workers = self.spawn_workers(&dispatcher, Arc::new(Mutex::new(rx)))?;

        let mut readers = Vec::new();
        self.accept_loop(&listener, &tx, &mut readers);
        drop(listener);

        info!("Socket backend stopping, draining queued requests");
        self.close_connections(Shutdown::Read);
        drop(tx);
        for handle in readers {
            let _ = handle.join();
        }
        for handle in workers {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        self.close_connections(Shutdown::Both);
        self.core.mark_stopped();
        info!("Socket backend stopped");
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.core.shutdown.trigger();
        self.listener = None;
        self.close_connections(Shutdown::Both);
        self.connections.lock().clear();
        if self.core.state() != ServerState::Uninitialized {
            self.core.mark_stopped();
        }
        Ok(())
    }

    fn shutdown_token(&self) -> ShutdownToken {
        self.core.shutdown.clone()
    }
}

/// Client side of the socket backend.
#[derive(Debug, Default)]
pub struct SocketClient {
    stream: Option<TcpStream>,
}

impl SocketClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| PsError::usage("socket client used before connect"))
    }
}

impl ClientTransport for SocketClient {
    fn backend(&self) -> Backend {
        Backend::Socket
    }

    fn connect(&mut self, rank: i32, _server_rank: i32, address: &str) -> Result<()> {
        let endpoint = parse_endpoint(address)?;
        let addrs: Vec<SocketAddr> = endpoint
            .to_socket_addrs()
            .map_err(|e| PsError::Connection {
                message: format!("cannot resolve {}", endpoint),
                cause: Some(e.to_string()),
            })?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, ClientConfig::CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("Rank {} connected to {}", rank, addr);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(PsError::Connection {
            message: format!("failed to connect to {}", endpoint),
            cause: last_err.map(|e| e.to_string()),
        })
    }

    fn send(&mut self, msg: &Message) -> Result<()> {
        let encoded = msg.encode();
        write_frame(self.stream()?, &encoded)
    }

    fn receive(&mut self, expected: MessageType) -> Result<Message> {
        let bytes = read_frame(self.stream()?)?
            .ok_or_else(|| {
                PsError::protocol(format!("connection closed while waiting for {}", expected))
            })?;
        Message::decode(&bytes).map_err(|e| PsError::protocol(format!("malformed reply: {}", e)))
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
