//! # UI ↔ engine requests
//!
//! Two shapes only: fire-and-forget `Command`s and call-and-return
//! `Query`s. Every call carries a `RequestId`; the engine answers each with
//! exactly one `Reply`, which the UI-side `ReplyPump` routes to the waiting
//! caller.
//!
//! ```text
//! EngineClient ──Request──▶ crossbeam ──▶ EngineEndpoint (audio, try_recv)
//!      ▲                                        │
//!      └── oneshot ◀── ReplyPump ◀── tokio mpsc ◀┘ (unbounded, never blocks)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::RpcConfig;
use crate::graph::DanglingPointer;
use crate::model::BoxId;
use crate::telemetry::TransportRecord;
use crate::{Error, Result};

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Identifies every operation on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    Play = 1,
    Pause = 2,
    Seek = 3,
    NoteOn = 4,
    NoteOff = 5,
    QueryPosition = 16,
    QueryProcessingOrder = 17,
    QueryBoxCount = 18,
    QueryIntegrity = 19,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play,
    Pause,
    /// Move the playhead, in ticks.
    Seek { ticks: f64 },
    NoteOn { track: BoxId, pitch: u8, velocity: f32 },
    NoteOff { track: BoxId, pitch: u8 },
}

impl Command {
    pub fn method(&self) -> Method {
        match self {
            Command::Play => Method::Play,
            Command::Pause => Method::Pause,
            Command::Seek { .. } => Method::Seek,
            Command::NoteOn { .. } => Method::NoteOn,
            Command::NoteOff { .. } => Method::NoteOff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Position,
    ProcessingOrder,
    BoxCount,
    VerifyIntegrity,
}

impl Query {
    pub fn method(&self) -> Method {
        match self {
            Query::Position => Method::QueryPosition,
            Query::ProcessingOrder => Method::QueryProcessingOrder,
            Query::BoxCount => Method::QueryBoxCount,
            Query::VerifyIntegrity => Method::QueryIntegrity,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryReply {
    Position(TransportRecord),
    ProcessingOrder(Vec<BoxId>),
    BoxCount(u64),
    /// Integrity of the engine's mirror graph.
    Integrity(std::result::Result<usize, Vec<DanglingPointer>>),
}

impl QueryReply {
    /// The query method this payload answers.
    pub fn method(&self) -> Method {
        match self {
            QueryReply::Position(_) => Method::QueryPosition,
            QueryReply::ProcessingOrder(_) => Method::QueryProcessingOrder,
            QueryReply::BoxCount(_) => Method::QueryBoxCount,
            QueryReply::Integrity(_) => Method::QueryIntegrity,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Fire(Command),
    Call { id: RequestId, query: Query },
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Fire(command) => command.method(),
            Request::Call { query, .. } => query.method(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: RequestId,
    pub payload: QueryReply,
}

// ============================================================================
// EngineControl
// ============================================================================

fn unexpected(reply: QueryReply) -> Error {
    Error::Rpc(format!("unexpected reply: {reply:?}"))
}

/// Control surface of an audio engine, as seen from the UI.
#[async_trait]
pub trait EngineControl: Send + Sync {
    /// Fire-and-forget. Never waits for the engine.
    fn send(&self, command: Command) -> Result<()>;

    /// Call-and-return.
    async fn query(&self, query: Query) -> Result<QueryReply>;

    fn play(&self) -> Result<()> {
        self.send(Command::Play)
    }

    fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    fn seek(&self, ticks: f64) -> Result<()> {
        self.send(Command::Seek { ticks })
    }

    fn note_on(&self, track: BoxId, pitch: u8, velocity: f32) -> Result<()> {
        self.send(Command::NoteOn { track, pitch, velocity })
    }

    fn note_off(&self, track: BoxId, pitch: u8) -> Result<()> {
        self.send(Command::NoteOff { track, pitch })
    }

    async fn position(&self) -> Result<TransportRecord> {
        match self.query(Query::Position).await? {
            QueryReply::Position(record) => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    async fn processing_order(&self) -> Result<Vec<BoxId>> {
        match self.query(Query::ProcessingOrder).await? {
            QueryReply::ProcessingOrder(order) => Ok(order),
            other => Err(unexpected(other)),
        }
    }

    async fn box_count(&self) -> Result<u64> {
        match self.query(Query::BoxCount).await? {
            QueryReply::BoxCount(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }
}

// ============================================================================
// UI side
// ============================================================================

/// Waiting callers by id, with the method each one expects back.
type PendingTable = Arc<Mutex<HashMap<RequestId, (Method, oneshot::Sender<Result<QueryReply>>)>>>;

/// UI-side handle. Cheap to clone.
#[derive(Clone)]
pub struct EngineClient {
    requests: Sender<Request>,
    pending: PendingTable,
    next_id: Arc<AtomicU64>,
    max_pending: usize,
}

impl EngineClient {
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl EngineControl for EngineClient {
    fn send(&self, command: Command) -> Result<()> {
        self.requests
            .send(Request::Fire(command))
            .map_err(|_| Error::Disconnected)
    }

    async fn query(&self, query: Query) -> Result<QueryReply> {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                return Err(Error::Rpc(format!(
                    "{} queries already pending",
                    pending.len()
                )));
            }
            pending.insert(id, (query.method(), tx));
        }
        if self.requests.send(Request::Call { id, query }).is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::Disconnected);
        }
        rx.await.map_err(|_| Error::Disconnected)?
    }
}

/// Routes replies to waiting callers. Run it on the UI runtime.
pub struct ReplyPump {
    replies: mpsc::UnboundedReceiver<Reply>,
    pending: PendingTable,
}

impl ReplyPump {
    /// Route replies until the engine side is dropped, then fail every
    /// call still waiting.
    pub async fn run(mut self) {
        while let Some(reply) = self.replies.recv().await {
            self.dispatch(reply);
        }
        let abandoned = {
            let mut pending = self.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        debug!(abandoned, "engine gone, reply pump stopped");
    }

    /// Route whatever has arrived, without waiting. Returns the number of
    /// replies routed.
    pub fn try_pump(&mut self) -> usize {
        let mut routed = 0;
        while let Ok(reply) = self.replies.try_recv() {
            self.dispatch(reply);
            routed += 1;
        }
        routed
    }

    fn dispatch(&self, reply: Reply) {
        let waiter = self.pending.lock().remove(&reply.id);
        let Some((expected, tx)) = waiter else {
            warn!(id = reply.id.0, "reply for unknown request");
            return;
        };
        let answered = reply.payload.method();
        let outcome = if answered == expected {
            Ok(reply.payload)
        } else {
            warn!(id = reply.id.0, ?expected, ?answered, "reply does not answer its request");
            Err(Error::Rpc(format!("expected {expected:?} reply, got {answered:?}")))
        };
        if tx.send(outcome).is_err() {
            debug!(id = reply.id.0, "caller stopped waiting");
        }
    }
}

// ============================================================================
// Engine side
// ============================================================================

/// Audio-side end. Both directions are non-blocking.
pub struct EngineEndpoint {
    requests: Receiver<Request>,
    replies: mpsc::UnboundedSender<Reply>,
}

impl EngineEndpoint {
    /// Next waiting request, if any. `Err(Disconnected)` once every
    /// client is gone.
    pub fn try_recv(&self) -> Result<Option<Request>> {
        match self.requests.try_recv() {
            Ok(request) => Ok(Some(request)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Disconnected),
        }
    }

    pub fn reply(&self, id: RequestId, payload: QueryReply) -> Result<()> {
        self.replies
            .send(Reply { id, payload })
            .map_err(|_| Error::Disconnected)
    }
}

/// Connected client, reply pump and engine endpoint.
pub fn channel(config: &RpcConfig) -> (EngineClient, ReplyPump, EngineEndpoint) {
    let (request_tx, request_rx) = crossbeam_channel::unbounded();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
    let client = EngineClient {
        requests: request_tx,
        pending: Arc::clone(&pending),
        next_id: Arc::new(AtomicU64::new(1)),
        max_pending: config.max_pending,
    };
    let pump = ReplyPump { replies: reply_rx, pending };
    let endpoint = EngineEndpoint { requests: request_rx, replies: reply_tx };
    (client, pump, endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_methods_are_distinct() {
        let fires = [
            Command::Play,
            Command::Pause,
            Command::Seek { ticks: 0.0 },
            Command::NoteOn { track: BoxId::new(), pitch: 60, velocity: 1.0 },
            Command::NoteOff { track: BoxId::new(), pitch: 60 },
        ];
        let mut tags: Vec<u8> = fires.iter().map(|c| c.method() as u8).collect();
        tags.extend(
            [Query::Position, Query::ProcessingOrder, Query::BoxCount, Query::VerifyIntegrity]
                .iter()
                .map(|q| q.method() as u8),
        );
        let mut unique = tags.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), tags.len());
    }

    #[tokio::test]
    async fn test_query_is_correlated_by_id() {
        let (client, mut pump, endpoint) = channel(&RpcConfig::default());
        client.play().unwrap();

        let caller = tokio::spawn({
            let client = client.clone();
            async move { client.box_count().await }
        });

        // engine side: serve until the call shows up
        let mut served = false;
        while !served {
            match endpoint.try_recv().unwrap() {
                Some(Request::Fire(command)) => assert_eq!(command, Command::Play),
                Some(Request::Call { id, query }) => {
                    assert_eq!(query, Query::BoxCount);
                    endpoint.reply(id, QueryReply::BoxCount(7)).unwrap();
                    served = true;
                }
                None => tokio::task::yield_now().await,
            }
        }
        while pump.try_pump() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(caller.await.unwrap().unwrap(), 7);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_table_is_bounded() {
        let (client, _pump, _endpoint) = channel(&RpcConfig { max_pending: 1 });
        let first = tokio::spawn({
            let client = client.clone();
            async move { client.query(Query::Position).await }
        });
        while client.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        let err = client.query(Query::Position).await.unwrap_err();
        assert!(matches!(err, Error::Rpc(_)));
        first.abort();
    }

    #[tokio::test]
    async fn test_dropped_engine_fails_waiting_calls() {
        let (client, pump, endpoint) = channel(&RpcConfig::default());
        let pump = tokio::spawn(pump.run());
        let caller = tokio::spawn({
            let client = client.clone();
            async move { client.query(Query::BoxCount).await }
        });
        while client.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        drop(endpoint);
        pump.await.unwrap();
        assert!(matches!(caller.await.unwrap(), Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn test_reply_of_wrong_method_fails_the_call() {
        let (client, mut pump, endpoint) = channel(&RpcConfig::default());
        let caller = tokio::spawn({
            let client = client.clone();
            async move { client.query(Query::Position).await }
        });
        let id = loop {
            match endpoint.try_recv().unwrap() {
                Some(Request::Call { id, query }) => {
                    assert_eq!(query.method(), Method::QueryPosition);
                    break id;
                }
                Some(other) => panic!("unexpected request {other:?}"),
                None => tokio::task::yield_now().await,
            }
        };
        endpoint.reply(id, QueryReply::BoxCount(3)).unwrap();
        while pump.try_pump() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(matches!(caller.await.unwrap(), Err(Error::Rpc(_))));
        assert_eq!(client.pending_count(), 0);
    }
}
