//! Request dispatch shared by every transport backend.
//!
//! A backend hands the raw bytes of one request to [`Dispatcher::handle`] and
//! writes back the returned reply. Failures of a single request become error
//! replies; they never tear down the connection or the worker.

use crate::config::HandshakeConfig;
use crate::error::{PsError, Result};
use crate::message::{handshake_reply, Message, MessageCmd, MessageKind, MessageType};
use crate::shutdown::ShutdownToken;
use crate::store::{GlobalAnomalyStats, ParameterInterface};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle of a server: `Uninitialized -> Initialized -> Serving -> Stopped`.
///
/// Transitions only move forward; a stopped server is not restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    Initialized,
    Serving,
    Stopped,
}

/// Outcome of dispatching one request.
#[derive(Debug)]
pub struct Dispatched {
    pub reply: Message,
    /// The request asked the server to stop.
    pub shutdown: bool,
}

/// Routes decoded requests to the parameter store.
pub struct Dispatcher {
    server_rank: i32,
    backend_id: &'static str,
    store: Arc<dyn ParameterInterface>,
    anomaly_stats: Option<Arc<GlobalAnomalyStats>>,
    shutdown: ShutdownToken,
}

impl Dispatcher {
    pub fn new(
        server_rank: i32,
        backend_id: &'static str,
        store: Arc<dyn ParameterInterface>,
        anomaly_stats: Option<Arc<GlobalAnomalyStats>>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            server_rank,
            backend_id,
            store,
            anomaly_stats,
            shutdown,
        }
    }

    /// Decode and serve one request.
    ///
    /// `fallback` is the request type to answer when the envelope is too
    /// corrupt to carry a readable type field.
    pub fn handle(&self, bytes: &[u8], fallback: MessageType) -> Dispatched {
        let request = match Message::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                let req_type = Message::peek_type(bytes).unwrap_or(fallback);
                let source = Message::peek_source(bytes).unwrap_or(-1);
                warn!("Rejecting malformed request from rank {}: {}", source, e);
                return Dispatched {
                    reply: Message::error_reply(self.server_rank, source, req_type, &e),
                    shutdown: false,
                };
            }
        };

        match self.dispatch(&request) {
            Ok(dispatched) => dispatched,
            Err(e) => {
                warn!(
                    "{} from rank {} failed (code {}): {}",
                    request.msg_type,
                    request.source_rank,
                    e.code(),
                    e
                );
                Dispatched {
                    reply: Message::error_reply(
                        self.server_rank,
                        request.source_rank,
                        request.msg_type,
                        &e,
                    ),
                    shutdown: false,
                }
            }
        }
    }

    fn dispatch(&self, request: &Message) -> Result<Dispatched> {
        debug!(
            "{} ({:?}) from rank {}, {} bytes",
            request.msg_type,
            request.kind,
            request.source_rank,
            request.payload.len()
        );

        let mut shutdown = false;
        let payload = match (request.msg_type, request.kind) {
            (MessageType::ReqEcho, MessageKind::Default) => {
                let hello = request.payload_str().unwrap_or(HandshakeConfig::HELLO);
                handshake_reply(hello, self.backend_id).into_bytes()
            }
            (MessageType::ReqEcho, kind) => {
                return Err(PsError::InvalidRequest {
                    message: format!("echo request with kind {:?}", kind),
                })
            }
            (MessageType::ReqAdd, MessageKind::AnomalyStats) => {
                let stats = self.anomaly_stats()?;
                let id = stats.add_anomaly_data(request.payload_str()?)?;
                serde_json::to_vec(&json!({
                    "stat_id": id,
                    "n_data": stats.get_n_anomaly_data(&id),
                }))?
            }
            (MessageType::ReqAdd, _) => self.store.update(&request.payload)?,
            (MessageType::ReqGet, MessageKind::AnomalyStats) => {
                let stats = self.anomaly_stats()?;
                let id = request.payload_str()?.trim();
                let summaries = if id.is_empty() {
                    stats.collect()
                } else {
                    stats.get_anomaly_stat(id).into_iter().collect()
                };
                serde_json::to_vec(&summaries)?
            }
            (MessageType::ReqGet, _) => self.store.snapshot()?,
            (MessageType::ReqCmd, _) => match MessageCmd::from_payload(&request.payload)? {
                MessageCmd::Quit => {
                    info!("Quit command from rank {}", request.source_rank);
                    shutdown = true;
                    Vec::new()
                }
            },
            (MessageType::ReqQuit, _) => {
                info!("Quit request from rank {}", request.source_rank);
                shutdown = true;
                Vec::new()
            }
            (other, _) => {
                return Err(PsError::InvalidRequest {
                    message: format!("{} is not a request type", other),
                })
            }
        };

        if shutdown {
            self.shutdown.trigger();
        }

        Ok(Dispatched {
            reply: request.reply(payload),
            shutdown,
        })
    }

    fn anomaly_stats(&self) -> Result<&GlobalAnomalyStats> {
        self.anomaly_stats.as_deref().ok_or_else(|| PsError::InvalidRequest {
            message: "anomaly statistics are not enabled on this server".to_string(),
        })
    }
}

/// State shared by a backend's control surface.
///
/// Holds the store and the lifecycle state so both backends enforce the same
/// `initialize -> run -> finalize` rules.
pub(crate) struct ServerCore {
    pub state: Mutex<ServerState>,
    pub threads: Mutex<usize>,
    pub store: Mutex<Option<Arc<dyn ParameterInterface>>>,
    pub anomaly_stats: Mutex<Option<Arc<GlobalAnomalyStats>>>,
    pub shutdown: ShutdownToken,
}

impl ServerCore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::Uninitialized),
            threads: Mutex::new(0),
            store: Mutex::new(None),
            anomaly_stats: Mutex::new(None),
            shutdown: ShutdownToken::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn mark_initialized(&self, threads: usize) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ServerState::Uninitialized {
            return Err(PsError::usage(format!("initialize called in state {:?}", *state)));
        }
        *self.threads.lock() = threads.max(1);
        *state = ServerState::Initialized;
        Ok(())
    }

    /// Transition to `Serving` and build the dispatcher the workers share.
    pub fn begin_serving(
        &self,
        server_rank: i32,
        backend_id: &'static str,
    ) -> Result<Arc<Dispatcher>> {
        let mut state = self.state.lock();
        match *state {
            ServerState::Initialized => {}
            ServerState::Uninitialized => {
                return Err(PsError::usage("run called before initialize"));
            }
            other => {
                return Err(PsError::usage(format!("run called in state {:?}", other)));
            }
        }
        let store = self
            .store
            .lock()
            .clone()
            .ok_or_else(|| PsError::usage("run called without a parameter store"))?;
        *state = ServerState::Serving;

        Ok(Arc::new(Dispatcher::new(
            server_rank,
            backend_id,
            store,
            self.anomaly_stats.lock().clone(),
            self.shutdown.clone(),
        )))
    }

    pub fn mark_stopped(&self) {
        *self.state.lock() = ServerState::Stopped;
    }

    pub fn threads(&self) -> usize {
        *self.threads.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FuncStats, GlobalStats, StatisticalParameterStore, StatsUpdate};
    use crate::stats::RunningStatistics;

    fn dispatcher() -> (Dispatcher, ShutdownToken) {
        let token = ShutdownToken::new();
        let d = Dispatcher::new(
            0,
            "I am TESTNET!",
            Arc::new(StatisticalParameterStore::new()),
            Some(Arc::new(GlobalAnomalyStats::new())),
            token.clone(),
        );
        (d, token)
    }

    fn add_request(rank: i32, id: u64, samples: &[f64]) -> Message {
        let mut update = StatsUpdate::new(rank, None);
        let mut f = FuncStats::new("solve");
        f.inclusive = RunningStatistics::from_samples(samples.iter().copied());
        update.functions.insert(id, f);
        Message::new(
            rank,
            0,
            MessageType::ReqAdd,
            MessageKind::Default,
            update.to_payload().unwrap(),
        )
    }

    #[test]
    fn test_echo_handshake() {
        let (d, token) = dispatcher();
        let out = d.handle(&Message::echo_request(4, 0).encode(), MessageType::ReqEcho);
        assert_eq!(out.reply.msg_type, MessageType::RepEcho);
        assert_eq!(out.reply.dest_rank, 4);
        assert_eq!(out.reply.payload_str().unwrap(), "Hello!>I am TESTNET!");
        assert!(!out.shutdown);
        assert!(!token.is_triggered());
    }

    #[test]
    fn test_echo_with_non_default_kind_is_invalid() {
        let (d, token) = dispatcher();
        for kind in [MessageKind::AnomalyStats, MessageKind::Cmd, MessageKind::Error] {
            let echo = Message::new(4, 0, MessageType::ReqEcho, kind, HandshakeConfig::HELLO);
            let out = d.handle(&echo.encode(), MessageType::ReqEcho);
            assert_eq!(out.reply.msg_type, MessageType::RepEcho);
            assert_eq!(out.reply.kind, MessageKind::Error);
            assert!(out.reply.payload_str().unwrap().starts_with("Invalid request"));
        }
        assert!(!token.is_triggered());
    }

    #[test]
    fn test_add_then_get() {
        let (d, _) = dispatcher();
        let out = d.handle(&add_request(1, 7, &[1.0, 2.0, 3.0]).encode(), MessageType::ReqAdd);
        assert_eq!(out.reply.msg_type, MessageType::RepAdd);
        let global = GlobalStats::from_payload(&out.reply.payload).unwrap();
        assert_eq!(global.get(7).unwrap().inclusive.count(), 3);

        let get = Message::new(1, 0, MessageType::ReqGet, MessageKind::Default, Vec::new());
        let out = d.handle(&get.encode(), MessageType::ReqGet);
        assert_eq!(out.reply.msg_type, MessageType::RepGet);
        assert_eq!(GlobalStats::from_payload(&out.reply.payload).unwrap().len(), 1);
    }

    #[test]
    fn test_get_before_add_is_empty() {
        let (d, _) = dispatcher();
        let get = Message::new(0, 0, MessageType::ReqGet, MessageKind::Default, Vec::new());
        let out = d.handle(&get.encode(), MessageType::ReqGet);
        assert_eq!(out.reply.kind, MessageKind::Default);
        assert!(GlobalStats::from_payload(&out.reply.payload).unwrap().is_empty());
    }

    #[test]
    fn test_quit_command_triggers_shutdown() {
        let (d, token) = dispatcher();
        let out = d.handle(
            &Message::command(0, 0, MessageCmd::Quit).encode(),
            MessageType::ReqCmd,
        );
        assert!(out.shutdown);
        assert_eq!(out.reply.msg_type, MessageType::RepCmd);
        assert!(token.is_triggered());
    }

    #[test]
    fn test_reply_type_sent_as_request_is_invalid() {
        let (d, token) = dispatcher();
        let bogus = Message::new(2, 0, MessageType::RepAdd, MessageKind::Default, Vec::new());
        let out = d.handle(&bogus.encode(), MessageType::ReqAdd);
        assert_eq!(out.reply.kind, MessageKind::Error);
        assert!(out.reply.payload_str().unwrap().starts_with("Invalid request"));
        assert!(!token.is_triggered());
    }

    #[test]
    fn test_corrupt_envelope_gets_error_reply() {
        let (d, _) = dispatcher();
        let mut bytes = add_request(3, 1, &[1.0]).encode();
        bytes.truncate(bytes.len() - 2);
        let out = d.handle(&bytes, MessageType::ReqCmd);
        assert_eq!(out.reply.kind, MessageKind::Error);
        assert_eq!(out.reply.msg_type, MessageType::RepAdd);
        assert_eq!(out.reply.dest_rank, 3);

        let out = d.handle(&[1, 2, 3], MessageType::ReqGet);
        assert_eq!(out.reply.msg_type, MessageType::RepGet);
    }

    #[test]
    fn test_anomaly_report_roundtrip() {
        let (d, _) = dispatcher();
        let report = r#"{"app":0,"rank":5,"step":1,"n_anomalies":3}"#;
        let add = Message::new(5, 0, MessageType::ReqAdd, MessageKind::AnomalyStats, report);
        let out = d.handle(&add.encode(), MessageType::ReqAdd);
        assert_eq!(out.reply.kind, MessageKind::AnomalyStats);

        let get = Message::new(5, 0, MessageType::ReqGet, MessageKind::AnomalyStats, "0:5");
        let out = d.handle(&get.encode(), MessageType::ReqGet);
        let summaries: Vec<crate::store::anomaly::AnomalySummary> =
            serde_json::from_slice(&out.reply.payload).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].total, 3);
    }

    #[test]
    fn test_server_core_lifecycle() {
        let core = ServerCore::new();
        assert!(matches!(core.begin_serving(0, "x"), Err(PsError::Usage { .. })));

        core.mark_initialized(2).unwrap();
        assert!(matches!(core.begin_serving(0, "x"), Err(PsError::Usage { .. })));

        *core.store.lock() = Some(Arc::new(StatisticalParameterStore::new()));
        core.begin_serving(0, "x").unwrap();
        assert_eq!(core.state(), ServerState::Serving);
        assert!(matches!(core.begin_serving(0, "x"), Err(PsError::Usage { .. })));

        core.mark_stopped();
        assert!(core.mark_initialized(1).is_err());
    }
}
