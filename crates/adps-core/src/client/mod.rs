//! Client side of the parameter server protocol.
//!
//! [`NetClient`] wraps one [`ClientTransport`] and adds the parts of the
//! protocol every backend shares: the mandatory handshake on connect,
//! synchronous request-reply with reply validation, and the collective
//! disconnect in which only the coordinating rank asks the server to quit.
//!
//! # Example
//!
//! ```no_run
//! use adps_core::client::NetClient;
//! use adps_core::net::SocketClient;
//! use adps_core::store::StatsUpdate;
//!
//! # fn main() -> adps_core::Result<()> {
//! let mut client = NetClient::new(Box::new(SocketClient::new()));
//! client.connect(0, 0, "tcp://127.0.0.1:5559")?;
//! let global = client.add_stats(&StatsUpdate::new(0, Some(1)))?;
//! println!("{} functions", global.len());
//! client.disconnect()?;
//! # Ok(())
//! # }
//! ```

pub mod group;
pub mod local_stats;

pub use group::{GroupBarrier, LocalGroup, SoloGroup};
pub use local_stats::{LocalFuncStatistics, StepExchange};

use crate::config::{ClientConfig, HandshakeConfig};
use crate::error::{PsError, Result};
use crate::message::{handshake_reply, Message, MessageCmd, MessageKind, MessageType};
use crate::net::{Backend, ClientTransport};
use crate::store::anomaly::{AnomalyReport, AnomalySummary};
use crate::store::{GlobalStats, StatsUpdate};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Server acknowledgement of an anomaly report.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnomalyAck {
    pub stat_id: String,
    pub n_data: usize,
}

/// Connection of one analysis rank to the parameter server.
pub struct NetClient {
    transport: Box<dyn ClientTransport>,
    group: Arc<dyn GroupBarrier>,
    rank: i32,
    server_rank: i32,
    use_ps: bool,
    expected_identifier: String,
}

impl NetClient {
    /// Client that is the only member of its group.
    pub fn new(transport: Box<dyn ClientTransport>) -> Self {
        Self::with_group(transport, Arc::new(SoloGroup))
    }

    pub fn with_group(transport: Box<dyn ClientTransport>, group: Arc<dyn GroupBarrier>) -> Self {
        let expected_identifier = transport.backend().identifier().to_string();
        Self {
            transport,
            group,
            rank: 0,
            server_rank: 0,
            use_ps: false,
            expected_identifier,
        }
    }

    /// Override the backend identifier the handshake must report.
    pub fn expect_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.expected_identifier = identifier.into();
        self
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn server_rank(&self) -> i32 {
        self.server_rank
    }

    pub fn backend(&self) -> Backend {
        self.transport.backend()
    }

    /// Whether the server was reached and verified.
    pub fn use_ps(&self) -> bool {
        self.use_ps
    }

    /// Connect and verify the server with the echo handshake.
    ///
    /// On any failure the transport is closed, `use_ps()` stays `false` and
    /// the error is a [`PsError::Connection`].
    pub fn connect(&mut self, rank: i32, server_rank: i32, address: &str) -> Result<()> {
        if self.use_ps {
            return Err(PsError::usage("client is already connected"));
        }
        self.rank = rank;
        self.server_rank = server_rank;

        if let Err(e) = self.open(address) {
            self.transport.close();
            return Err(match e {
                PsError::Connection { .. } => e,
                other => PsError::Connection {
                    message: format!("handshake with {} failed", address),
                    cause: Some(other.to_string()),
                },
            });
        }

        self.use_ps = true;
        info!(
            "Rank {} connected to parameter server at {} ({})",
            rank,
            address,
            self.transport.backend()
        );
        Ok(())
    }

    fn open(&mut self, address: &str) -> Result<()> {
        self.transport.connect(self.rank, self.server_rank, address)?;

        let request = Message::echo_request(self.rank, self.server_rank);
        self.transport.send(&request)?;
        let reply = self.transport.receive(MessageType::RepEcho)?;
        let reply = validate_reply(reply, MessageType::RepEcho)?;

        let expected = handshake_reply(HandshakeConfig::HELLO, &self.expected_identifier);
        let actual = reply.payload_str()?;
        if actual != expected {
            return Err(PsError::connection(format!(
                "unexpected handshake reply '{}', expected '{}'",
                actual, expected
            )));
        }
        debug!("Handshake with {} verified", address);
        Ok(())
    }

    /// Send `request` and block until its reply arrives.
    ///
    /// An error reply from the server, a reply of another type or a missing
    /// reply is a [`PsError::Protocol`].
    pub fn send_and_receive(&mut self, request: &Message) -> Result<Message> {
        if !self.use_ps {
            return Err(PsError::usage("client is not connected"));
        }
        if !request.msg_type.is_request() {
            return Err(PsError::usage(format!("{} is not a request type", request.msg_type)));
        }
        let expected = request.msg_type.reply();
        self.transport.send(request)?;
        let reply = self.transport.receive(expected)?;
        validate_reply(reply, expected)
    }

    /// Merge `update` into the global model.
    pub fn add_stats(&mut self, update: &StatsUpdate) -> Result<GlobalStats> {
        self.add_stats_sized(update).map(|(global, _, _)| global)
    }

    fn add_stats_sized(&mut self, update: &StatsUpdate) -> Result<(GlobalStats, usize, usize)> {
        let request = Message::new(
            self.rank,
            self.server_rank,
            MessageType::ReqAdd,
            MessageKind::Default,
            update.to_payload()?,
        );
        let reply = self.send_and_receive(&request)?;
        let global = GlobalStats::from_payload(&reply.payload)
            .map_err(|e| PsError::protocol(format!("undecodable ADD reply: {}", e)))?;
        Ok((global, request.encoded_len(), reply.encoded_len()))
    }

    /// Fetch the whole global model.
    pub fn get_global(&mut self) -> Result<GlobalStats> {
        let request = Message::new(
            self.rank,
            self.server_rank,
            MessageType::ReqGet,
            MessageKind::Default,
            Vec::new(),
        );
        let reply = self.send_and_receive(&request)?;
        GlobalStats::from_payload(&reply.payload)
            .map_err(|e| PsError::protocol(format!("undecodable GET reply: {}", e)))
    }

    pub fn send_anomaly_report(&mut self, report: &AnomalyReport) -> Result<AnomalyAck> {
        let request = Message::new(
            self.rank,
            self.server_rank,
            MessageType::ReqAdd,
            MessageKind::AnomalyStats,
            serde_json::to_vec(report)?,
        );
        let reply = self.send_and_receive(&request)?;
        serde_json::from_slice(&reply.payload)
            .map_err(|e| PsError::protocol(format!("undecodable anomaly acknowledgement: {}", e)))
    }

    /// Summaries for `stat_id`, or for every stat id when `None`.
    pub fn get_anomaly_stats(&mut self, stat_id: Option<&str>) -> Result<Vec<AnomalySummary>> {
        let request = Message::new(
            self.rank,
            self.server_rank,
            MessageType::ReqGet,
            MessageKind::AnomalyStats,
            stat_id.unwrap_or(""),
        );
        let reply = self.send_and_receive(&request)?;
        serde_json::from_slice(&reply.payload)
            .map_err(|e| PsError::protocol(format!("undecodable anomaly statistics: {}", e)))
    }

    /// Collective disconnect.
    ///
    /// Every rank of the group meets at a barrier, the coordinating rank asks
    /// the server to quit, and all ranks meet again before closing. Does
    /// nothing when not connected.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.use_ps {
            return Ok(());
        }

        self.group.barrier();
        let result = if self.group.rank() == ClientConfig::COORDINATOR_RANK {
            debug!("Rank {} sending quit to the parameter server", self.rank);
            let quit = Message::command(self.rank, self.server_rank, MessageCmd::Quit);
            self.send_and_receive(&quit).map(|_| ())
        } else {
            Ok(())
        };
        self.group.barrier();

        self.transport.close();
        self.use_ps = false;
        if let Err(e) = &result {
            warn!("Quit request from rank {} failed: {}", self.rank, e);
        }
        result
    }
}

fn validate_reply(reply: Message, expected: MessageType) -> Result<Message> {
    if reply.kind == MessageKind::Error {
        let text = String::from_utf8_lossy(&reply.payload).into_owned();
        return Err(PsError::protocol(format!("server rejected the request: {}", text)));
    }
    if reply.msg_type != expected {
        return Err(PsError::protocol(format!(
            "expected {} reply, received {}",
            expected, reply.msg_type
        )));
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Transport that replays canned replies.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: VecDeque<Message>,
        sent: Vec<Message>,
        connected: bool,
        refuse: bool,
    }

    impl ClientTransport for ScriptedTransport {
        fn backend(&self) -> Backend {
            Backend::Socket
        }

        fn connect(&mut self, _rank: i32, _server_rank: i32, _address: &str) -> Result<()> {
            if self.refuse {
                return Err(PsError::connection("refused"));
            }
            self.connected = true;
            Ok(())
        }

        fn send(&mut self, msg: &Message) -> Result<()> {
            self.sent.push(msg.clone());
            Ok(())
        }

        fn receive(&mut self, expected: MessageType) -> Result<Message> {
            self.replies
                .pop_front()
                .ok_or_else(|| PsError::protocol(format!("no {} reply", expected)))
        }

        fn close(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn echo_reply(identifier: &str) -> Message {
        Message::echo_request(1, 0).reply(handshake_reply("Hello!", identifier))
    }

    fn scripted(replies: Vec<Message>) -> NetClient {
        NetClient::new(Box::new(ScriptedTransport {
            replies: replies.into(),
            ..Default::default()
        }))
    }

    #[test]
    fn test_connect_verifies_handshake() {
        let mut client = scripted(vec![echo_reply("I am SOCKNET!")]);
        client.connect(1, 0, "tcp://x:1").unwrap();
        assert!(client.use_ps());
    }

    #[test]
    fn test_handshake_mismatch_is_connection_error() {
        let mut client = scripted(vec![echo_reply("I am RANKNET!")]);
        let err = client.connect(1, 0, "tcp://x:1").unwrap_err();
        assert!(matches!(err, PsError::Connection { .. }));
        assert!(!client.use_ps());
    }

    #[test]
    fn test_missing_handshake_reply_is_connection_error() {
        let mut client = scripted(Vec::new());
        assert!(matches!(client.connect(1, 0, "x"), Err(PsError::Connection { .. })));
        assert!(!client.use_ps());
    }

    #[test]
    fn test_refused_connect() {
        let mut client = NetClient::new(Box::new(ScriptedTransport {
            refuse: true,
            ..Default::default()
        }));
        assert!(matches!(client.connect(1, 0, "x"), Err(PsError::Connection { .. })));
    }

    #[test]
    fn test_rpc_before_connect_is_usage_error() {
        let mut client = scripted(Vec::new());
        assert!(matches!(client.get_global(), Err(PsError::Usage { .. })));
    }

    #[test]
    fn test_error_reply_is_protocol_error() {
        let get = Message::new(1, 0, MessageType::ReqGet, MessageKind::Default, Vec::new());
        let err_reply = Message::error_reply(0, 1, MessageType::ReqGet, &PsError::format("bad"));
        let mut client = scripted(vec![echo_reply("I am SOCKNET!"), err_reply]);
        client.connect(1, 0, "x").unwrap();
        let err = client.send_and_receive(&get).unwrap_err();
        assert!(matches!(err, PsError::Protocol { .. }));
        assert!(client.use_ps());
    }

    #[test]
    fn test_mismatched_reply_type_is_protocol_error() {
        let get = Message::new(1, 0, MessageType::ReqGet, MessageKind::Default, Vec::new());
        let wrong = get.reply(Vec::new());
        let wrong = Message { msg_type: MessageType::RepAdd, ..wrong };
        let mut client = scripted(vec![echo_reply("I am SOCKNET!"), wrong]);
        client.connect(1, 0, "x").unwrap();
        assert!(matches!(client.send_and_receive(&get), Err(PsError::Protocol { .. })));
    }

    #[test]
    fn test_disconnect_is_noop_when_disconnected() {
        let mut client = scripted(Vec::new());
        client.disconnect().unwrap();
        client.disconnect().unwrap();
    }

    #[test]
    fn test_coordinator_sends_quit() {
        let quit_reply = Message::command(0, 0, MessageCmd::Quit).reply(Vec::new());
        let mut client = scripted(vec![echo_reply("I am SOCKNET!"), quit_reply]);
        client.connect(0, 0, "x").unwrap();
        client.disconnect().unwrap();
        assert!(!client.use_ps());
        client.disconnect().unwrap();
    }
}
