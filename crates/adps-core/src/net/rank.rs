//! Rank backend: rank-addressed, tag-matched messaging inside a parallel job.
//!
//! A [`JobFabric`] stands in for the job's process group. The server opens a
//! [`Communicator`], publishes it under a service name and serves it with a
//! pool of workers; clients look the name up and attach with their own rank.
//! The communicator behaves like an intercommunicator: the server side is the
//! single rank [`ServerConfig::SERVER_RANK`], the client side is addressed by
//! each client's rank.
//!
//! Messages carry no length in-band. A receiver probes for the envelope
//! ([`Status::count`]) and then posts a sized receive. Server workers use the
//! matched probe ([`Endpoint::mprobe`]) so an envelope is claimed by exactly
//! one worker. Tags are message type codes.
//!
//! # Shutdown
//!
//! When the shutdown token fires the server inbox stops taking envelopes, so
//! client sends fail with a connection error. Workers keep claiming what was
//! already queued and exit once the closed inbox is empty.

use super::{Backend, ClientTransport, NetConfig, NetInterface};
use crate::config::ServerConfig;
use crate::dispatch::{ServerCore, ServerState};
use crate::error::{PsError, Result};
use crate::message::{Message, MessageType};
use crate::shutdown::ShutdownToken;
use crate::store::{GlobalAnomalyStats, ParameterInterface};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Envelope information returned by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub source: i32,
    pub tag: i32,
    /// Payload size in bytes.
    pub count: usize,
}

#[derive(Debug)]
struct Envelope {
    source: i32,
    tag: i32,
    data: Vec<u8>,
}

impl Envelope {
    fn matches(&self, source: Option<i32>, tag: Option<i32>) -> bool {
        source.map_or(true, |s| s == self.source) && tag.map_or(true, |t| t == self.tag)
    }

    fn status(&self) -> Status {
        Status {
            source: self.source,
            tag: self.tag,
            count: self.data.len(),
        }
    }
}

#[derive(Debug, Default)]
struct MailboxState {
    queue: VecDeque<Envelope>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Mailbox {
    state: Mutex<MailboxState>,
    ready: Condvar,
}

impl Mailbox {
    fn push(&self, envelope: Envelope) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PsError::connection("communicator is closed"));
        }
        state.queue.push_back(envelope);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    /// Wait for the first envelope matching `source`/`tag`, then apply `take`
    /// to the queue at its position. `None` on timeout.
    fn wait_match<T>(
        &self,
        source: Option<i32>,
        tag: Option<i32>,
        timeout: Option<Duration>,
        take: impl FnOnce(&mut VecDeque<Envelope>, usize) -> T,
    ) -> Result<Option<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(pos) = state.queue.iter().position(|e| e.matches(source, tag)) {
                return Ok(Some(take(&mut state.queue, pos)));
            }
            if state.closed {
                return Err(PsError::connection("communicator is closed"));
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        return Ok(None);
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }
}

/// A published server endpoint and every client attached to it.
#[derive(Debug)]
pub struct Communicator {
    server_rank: i32,
    server_inbox: Mailbox,
    clients: Mutex<HashMap<i32, Arc<Mailbox>>>,
}

impl Communicator {
    pub fn new(server_rank: i32) -> Arc<Self> {
        Arc::new(Self {
            server_rank,
            server_inbox: Mailbox::default(),
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn server_rank(&self) -> i32 {
        self.server_rank
    }

    /// Endpoint for the serving side.
    pub fn server_endpoint(self: &Arc<Self>) -> Endpoint {
        Endpoint {
            comm: Arc::clone(self),
            side: Side::Server,
        }
    }

    /// Attach a client with its own rank.
    pub fn connect(self: &Arc<Self>, rank: i32) -> Result<Endpoint> {
        if self.server_inbox.state.lock().closed {
            return Err(PsError::connection("communicator is closed"));
        }
        let mut clients = self.clients.lock();
        if clients.contains_key(&rank) {
            return Err(PsError::connection(format!("rank {} is already attached", rank)));
        }
        clients.insert(rank, Arc::new(Mailbox::default()));
        debug!("Rank {} attached to communicator", rank);
        Ok(Endpoint {
            comm: Arc::clone(self),
            side: Side::Client(rank),
        })
    }

    pub fn n_clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// Refuse further requests and attachments. Envelopes already in the
    /// server inbox can still be claimed.
    pub fn close_intake(&self) {
        self.server_inbox.close();
    }

    /// Close every mailbox; blocked probes return a connection error.
    pub fn close(&self) {
        self.server_inbox.close();
        for mailbox in self.clients.lock().values() {
            mailbox.close();
        }
    }

    fn client_mailbox(&self, rank: i32) -> Result<Arc<Mailbox>> {
        self.clients
            .lock()
            .get(&rank)
            .cloned()
            .ok_or_else(|| PsError::connection(format!("rank {} is not attached", rank)))
    }

    fn detach(&self, rank: i32) {
        if let Some(mailbox) = self.clients.lock().remove(&rank) {
            mailbox.close();
            debug!("Rank {} detached from communicator", rank);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Server,
    Client(i32),
}

/// One side's handle on a communicator.
#[derive(Debug)]
pub struct Endpoint {
    comm: Arc<Communicator>,
    side: Side,
}

impl Endpoint {
    pub fn rank(&self) -> i32 {
        match self.side {
            Side::Server => self.comm.server_rank,
            Side::Client(rank) => rank,
        }
    }

    fn inbox(&self) -> Result<Arc<Mailbox>> {
        match self.side {
            Side::Server => Err(PsError::usage("server inbox is not shared")),
            Side::Client(rank) => self.comm.client_mailbox(rank),
        }
    }

    fn with_inbox<T>(&self, f: impl FnOnce(&Mailbox) -> Result<T>) -> Result<T> {
        match self.side {
            Side::Server => f(&self.comm.server_inbox),
            Side::Client(_) => f(&*self.inbox()?),
        }
    }

    /// Send `data` to rank `dest` of the remote side.
    pub fn send(&self, dest: i32, tag: i32, data: &[u8]) -> Result<()> {
        let envelope = Envelope {
            source: self.rank(),
            tag,
            data: data.to_vec(),
        };
        match self.side {
            Side::Server => self.comm.client_mailbox(dest)?.push(envelope),
            Side::Client(_) => {
                if dest != self.comm.server_rank {
                    return Err(PsError::usage(format!(
                        "rank {} is not a server rank (expected {})",
                        dest, self.comm.server_rank
                    )));
                }
                self.comm.server_inbox.push(envelope)
            }
        }
    }

    /// Block until a matching envelope is available and describe it.
    pub fn probe(&self, source: Option<i32>, tag: Option<i32>) -> Result<Status> {
        self.probe_timeout(source, tag, None)?
            .ok_or_else(|| PsError::connection("probe returned without a message"))
    }

    /// Like [`probe`](Self::probe), giving up after `timeout`.
    pub fn probe_timeout(
        &self,
        source: Option<i32>,
        tag: Option<i32>,
        timeout: Option<Duration>,
    ) -> Result<Option<Status>> {
        self.with_inbox(|mailbox| {
            mailbox.wait_match(source, tag, timeout, |queue, pos| queue[pos].status())
        })
    }

    /// Receive the first envelope matching `source`/`tag` into a buffer of
    /// `count` bytes. A larger message is consumed and reported as truncated.
    pub fn recv(&self, source: i32, tag: i32, count: usize) -> Result<Vec<u8>> {
        let envelope = self.with_inbox(|mailbox| {
            mailbox.wait_match(Some(source), Some(tag), None, |queue, pos| queue.remove(pos))
        })?;
        let envelope = envelope
            .flatten()
            .ok_or_else(|| PsError::connection("receive returned without a message"))?;
        truncate_check(envelope.data, count)
    }

    /// Claim the first matching envelope so no other receiver can match it.
    pub fn mprobe(
        &self,
        source: Option<i32>,
        tag: Option<i32>,
        timeout: Option<Duration>,
    ) -> Result<Option<MatchedMessage>> {
        let claimed = self.with_inbox(|mailbox| {
            mailbox.wait_match(source, tag, timeout, |queue, pos| queue.remove(pos))
        })?;
        Ok(claimed.flatten().map(|envelope| MatchedMessage {
            status: envelope.status(),
            data: envelope.data,
        }))
    }

    /// Leave the communicator. Pending envelopes for this rank are dropped.
    pub fn disconnect(self) {
        if let Side::Client(rank) = self.side {
            self.comm.detach(rank);
        }
    }
}

fn truncate_check(data: Vec<u8>, count: usize) -> Result<Vec<u8>> {
    if data.len() > count {
        return Err(PsError::protocol(format!(
            "message of {} bytes truncated by a {} byte receive",
            data.len(),
            count
        )));
    }
    Ok(data)
}

/// An envelope claimed by [`Endpoint::mprobe`].
#[derive(Debug)]
pub struct MatchedMessage {
    pub status: Status,
    data: Vec<u8>,
}

impl MatchedMessage {
    /// Sized receive of the claimed envelope.
    pub fn mrecv(self, count: usize) -> Result<Vec<u8>> {
        truncate_check(self.data, count)
    }
}

/// Process group of a parallel job: name service plus communicators.
///
/// Cloning yields another handle to the same group.
#[derive(Debug, Clone, Default)]
pub struct JobFabric {
    names: Arc<Mutex<HashMap<String, Arc<Communicator>>>>,
}

impl JobFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_name(&self, service: &str, comm: Arc<Communicator>) -> Result<()> {
        let mut names = self.names.lock();
        if names.contains_key(service) {
            return Err(PsError::connection(format!("service '{}' is already published", service)));
        }
        names.insert(service.to_string(), comm);
        Ok(())
    }

    pub fn lookup_name(&self, service: &str) -> Result<Arc<Communicator>> {
        self.names
            .lock()
            .get(service)
            .cloned()
            .ok_or_else(|| PsError::connection(format!("service '{}' is not published", service)))
    }

    pub fn unpublish_name(&self, service: &str) -> bool {
        self.names.lock().remove(service).is_some()
    }
}

/// Server side of the rank backend.
pub struct RankNet {
    core: ServerCore,
    fabric: JobFabric,
    service: Option<String>,
    comm: Option<Arc<Communicator>>,
}

impl RankNet {
    pub fn new(fabric: JobFabric) -> Self {
        Self {
            core: ServerCore::new(),
            fabric,
            service: None,
            comm: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.core.state()
    }
}

impl NetInterface for RankNet {
    fn backend(&self) -> Backend {
        Backend::Rank
    }

    fn initialize(&mut self, config: &NetConfig) -> Result<()> {
        if self.core.state() != ServerState::Uninitialized {
            return Err(PsError::usage(format!(
                "initialize called in state {:?}",
                self.core.state()
            )));
        }
        let comm = Communicator::new(ServerConfig::SERVER_RANK);
        self.fabric.publish_name(&config.address, Arc::clone(&comm))?;
        self.core.mark_initialized(config.threads)?;

        info!(
            "Rank backend published '{}' with {} worker threads",
            config.address,
            self.core.threads()
        );
        self.service = Some(config.address.clone());
        self.comm = Some(comm);
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
            .begin_serving(ServerConfig::SERVER_RANK, Backend::Rank.identifier())?;
        let comm = self
            .comm
            .clone()
            .ok_or_else(|| PsError::usage("communicator is not open"))?;

        let threads = self.core.threads();
        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(threads);
        for i in 0..threads {
            let dispatcher = Arc::clone(&dispatcher);
            let endpoint = comm.server_endpoint();
            let handle = thread::Builder::new()
                .name(format!("ps-rank-worker-{}", i))
                .spawn(move || loop {
                    match endpoint.mprobe(None, None, Some(ServerConfig::POLL_INTERVAL)) {
                        Ok(Some(matched)) => {
                            let status = matched.status;
                            let bytes = match matched.mrecv(status.count) {
                                Ok(bytes) => bytes,
                                Err(e) => {
                                    warn!("Receive from rank {} failed: {}", status.source, e);
                                    continue;
                                }
                            };
                            let fallback =
                                MessageType::from_code(status.tag).unwrap_or(MessageType::ReqCmd);
                            let out = dispatcher.handle(&bytes, fallback);
                            let tag = out.reply.msg_type.code();
                            if let Err(e) = endpoint.send(status.source, tag, &out.reply.encode()) {
                                warn!("Failed to reply to rank {}: {}", status.source, e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!("Rank worker {} exiting: {}", i, e);
                            break;
                        }
                    }
                })?;
            workers.push(handle);
        }

        self.core.shutdown.wait();
        info!("Rank backend stopping, draining queued requests");
        comm.close_intake();
        for handle in workers {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        self.core.mark_stopped();
        info!("Rank backend stopped");
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.core.shutdown.trigger();
        if let Some(service) = self.service.take() {
            self.fabric.unpublish_name(&service);
        }
        if let Some(comm) = self.comm.take() {
            comm.close();
        }
        if self.core.state() != ServerState::Uninitialized {
            self.core.mark_stopped();
        }
        Ok(())
    }

    fn shutdown_token(&self) -> ShutdownToken {
        self.core.shutdown.clone()
    }
}

/// Client side of the rank backend.
#[derive(Debug)]
pub struct RankClient {
    fabric: JobFabric,
    endpoint: Option<Endpoint>,
    server_rank: i32,
}

impl RankClient {
    pub fn new(fabric: JobFabric) -> Self {
        Self {
            fabric,
            endpoint: None,
            server_rank: ServerConfig::SERVER_RANK,
        }
    }

    fn endpoint(&self) -> Result<&Endpoint> {
        self.endpoint
            .as_ref()
            .ok_or_else(|| PsError::usage("rank client used before connect"))
    }
}

impl ClientTransport for RankClient {
    fn backend(&self) -> Backend {
        Backend::Rank
    }

    fn connect(&mut self, rank: i32, server_rank: i32, address: &str) -> Result<()> {
        let comm = self.fabric.lookup_name(address)?;
        if comm.server_rank() != server_rank {
            return Err(PsError::connection(format!(
                "service '{}' is served by rank {}, not {}",
                address,
                comm.server_rank(),
                server_rank
            )));
        }
        self.endpoint = Some(comm.connect(rank)?);
        self.server_rank = server_rank;
        Ok(())
    }

    fn send(&mut self, msg: &Message) -> Result<()> {
        self.endpoint()?
            .send(self.server_rank, msg.msg_type.code(), &msg.encode())
    }

    fn receive(&mut self, expected: MessageType) -> Result<Message> {
        let endpoint = self.endpoint()?;
        let status = endpoint
            .probe(Some(self.server_rank), Some(expected.code()))
            .map_err(|e| PsError::protocol(format!("no {} reply: {}", expected, e)))?;
        let bytes = endpoint.recv(status.source, status.tag, status.count)?;
        Message::decode(&bytes).map_err(|e| PsError::protocol(format!("malformed reply: {}", e)))
    }

    fn close(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.disconnect();
        }
    }

    fn is_connected(&self) -> bool {
        self.endpoint.is_some()
    }
}

impl Drop for RankClient {
    fn drop(&mut self) {
        self.close();
    }
}
