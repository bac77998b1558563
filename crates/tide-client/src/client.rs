use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tide_protocol::{Frame, Message, ServerStatus, TideCodec, PROTOCOL_VERSION};
use tide_types::{Invalidation, ObjectRecord, Oid, SessionId, Tid, TxId};

use crate::cache::{CacheStats, ObjectCache};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::resync::ResyncReport;

/// Buffered invalidations per subscriber before it starts lagging.
const EVENT_BUFFER: usize = 256;

/// What a reply does to the cache when the reader task receives it.
enum CacheEffect {
    None,
    Load,
    Commit(Vec<(Oid, Vec<u8>)>),
    Resync,
}

struct Pending {
    reply: oneshot::Sender<ClientResult<Message>>,
    effect: CacheEffect,
}

#[derive(Default)]
struct PendingTable {
    requests: HashMap<u64, Pending>,
    closed: bool,
}

/// One established connection.
struct Link {
    session: SessionId,
    store: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<PendingTable>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Link {
    async fn call(
        &self,
        message: Message,
        effect: CacheEffect,
        limit: Option<Duration>,
    ) -> ClientResult<Message> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        {
            let mut table = self.pending.lock().expect("pending table poisoned");
            if table.closed {
                return Err(ClientError::ConnectionLost);
            }
            table.requests.insert(id, Pending { reply, effect });
        }

        let sent = {
            let mut writer = self.writer.lock().await;
            TideCodec::write_frame(&mut *writer, &Frame::new(id, message)).await
        };
        if let Err(e) = sent {
            debug!(request_id = id, error = %e, "request write failed");
            self.forget(id);
            return Err(ClientError::ConnectionLost);
        }

        let outcome = match limit {
            Some(limit) => match timeout(limit, response).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.forget(id);
                    return Err(ClientError::Timeout);
                }
            },
            None => response.await,
        };
        outcome.unwrap_or(Err(ClientError::ConnectionLost))
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .requests
            .remove(&id);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Receives every frame of a connection and applies its cache effects in
/// wire order: pushed invalidations, loaded records, own commits and resync
/// results. Completes the matching request afterwards, so a caller never
/// observes a reply before the cache reflects it.
async fn read_replies(
    mut reader: OwnedReadHalf,
    pending: Arc<Mutex<PendingTable>>,
    cache: Arc<Mutex<ObjectCache>>,
    events: broadcast::Sender<Invalidation>,
    alive: Arc<AtomicBool>,
) {
    let reason = loop {
        let frame = match TideCodec::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "server closed the connection".to_string(),
            Err(e) => break e.to_string(),
        };

        if frame.is_push() {
            match frame.message {
                Message::Invalidate { tid, oids } => {
                    cache
                        .lock()
                        .expect("cache poisoned")
                        .apply_invalidation(tid, &oids);
                    debug!(%tid, oids = oids.len(), "invalidation applied");
                    let _ = events.send(Invalidation::new(tid, oids));
                }
                other => debug!(message = other.type_name(), "ignoring unexpected push"),
            }
            continue;
        }

        let waiting = pending
            .lock()
            .expect("pending table poisoned")
            .requests
            .remove(&frame.request_id);
        match waiting {
            Some(p) => {
                let result = apply_reply(&cache, p.effect, frame.message);
                let _ = p.reply.send(result);
            }
            None => debug!(request_id = frame.request_id, "reply for abandoned request"),
        }
    };

    alive.store(false, Ordering::Release);
    let mut table = pending.lock().expect("pending table poisoned");
    table.closed = true;
    let in_flight = table.requests.len();
    for (_, p) in table.requests.drain() {
        let _ = p.reply.send(Err(ClientError::ConnectionLost));
    }
    warn!(%reason, in_flight, "connection lost");
}

fn apply_reply(
    cache: &Mutex<ObjectCache>,
    effect: CacheEffect,
    message: Message,
) -> ClientResult<Message> {
    if let Message::Error {
        code,
        message,
        oids,
    } = message
    {
        return Err(ClientError::from_remote(code, message, oids));
    }

    let mut cache = cache.lock().expect("cache poisoned");
    match (effect, &message) {
        (CacheEffect::Load, Message::Loaded { record }) => {
            cache.insert(record.clone());
        }
        (CacheEffect::Commit(writes), Message::Committed { tid }) => {
            // Every earlier commit was announced before this reply.
            cache.advance(*tid);
            for (oid, state) in writes {
                cache.insert(ObjectRecord::new(oid, *tid, state));
            }
        }
        (CacheEffect::Resync, reply) => ResyncReport::from_reply(reply)?.apply(&mut cache),
        _ => {}
    }
    Ok(message)
}

fn unexpected(expected: &'static str, got: &Message) -> ClientError {
    ClientError::UnexpectedReply {
        expected,
        got: got.type_name(),
    }
}

/// Connection to a Tide server with a coherent local object cache.
///
/// Reads are served from the cache when possible. Every invalidation the
/// server pushes is applied by a single reader task in the order it was
/// sent, interleaved correctly with load replies, so a load never returns a
/// state the client has already seen invalidated.
///
/// After a disconnect, every call fails with
/// [`ClientError::StorageUnavailable`] until [`reconnect`](Self::reconnect)
/// succeeds; the cache is not consulted in between.
pub struct Client {
    config: ClientConfig,
    cache: Arc<Mutex<ObjectCache>>,
    link: Mutex<Option<Arc<Link>>>,
    events: broadcast::Sender<Invalidation>,
    open_tx: Mutex<Option<TxId>>,
    last_commit: Mutex<Option<Tid>>,
}

impl Client {
    /// A disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            cache: Arc::new(Mutex::new(ObjectCache::new(config.cache_capacity))),
            config,
            link: Mutex::new(None),
            events,
            open_tx: Mutex::new(None),
            last_commit: Mutex::new(None),
        }
    }

    /// Connect, handshake and resynchronize.
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        let client = Self::new(config);
        client.reconnect().await?;
        Ok(client)
    }

    /// Drop the current connection (if any), open a new one, and bring the
    /// cache up to date with the server.
    ///
    /// On failure the cache is left untouched and the client stays
    /// disconnected.
    pub async fn reconnect(&self) -> ClientResult<ResyncReport> {
        self.take_link();
        *self.open_tx.lock().expect("client lock poisoned") = None;

        // Read before the handshake: pushes arriving on the new link move
        // the watermark past commits this resync still has to cover.
        let last_known_tid = self.last_tid();
        let link = self.open_link().await?;
        let reply = link
            .call(
                Message::Resync { last_known_tid },
                CacheEffect::Resync,
                Some(self.config.request_timeout()),
            )
            .await
            .map_err(|e| ClientError::StorageUnavailable(format!("resync failed: {e}")))?;
        let report = ResyncReport::from_reply(&reply)?;

        *self.link.lock().expect("client lock poisoned") = Some(link);
        Ok(report)
    }

    async fn open_link(&self) -> ClientResult<Arc<Link>> {
        let addr = self.config.addr.as_str();
        let stream = match timeout(self.config.connect_timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::StorageUnavailable(format!("{addr}: {e}"))),
            Err(_) => {
                return Err(ClientError::StorageUnavailable(format!(
                    "{addr}: connect timed out"
                )))
            }
        };
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let hello = Message::Handshake {
            version: PROTOCOL_VERSION,
            credentials: self.config.credentials(),
            read_only: self.config.read_only,
        };
        TideCodec::write_frame(&mut writer, &Frame::new(1, hello)).await?;
        let reply = timeout(self.config.connect_timeout(), TideCodec::read_frame(&mut reader))
            .await
            .map_err(|_| ClientError::StorageUnavailable(format!("{addr}: handshake timed out")))??;

        let (session, store, current_tid) = match reply.map(|frame| frame.message) {
            Some(Message::HandshakeAck {
                session,
                store,
                current_tid,
            }) => (session, store, current_tid),
            Some(Message::HandshakeRejected { reason }) => {
                return Err(ClientError::HandshakeRejected(reason))
            }
            Some(other) => return Err(unexpected("HandshakeAck", &other)),
            None => return Err(ClientError::ConnectionLost),
        };
        info!(%session, %store, %current_tid, addr, "connected");

        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_replies(
            reader,
            Arc::clone(&pending),
            Arc::clone(&self.cache),
            self.events.clone(),
            Arc::clone(&alive),
        ));
        Ok(Arc::new(Link {
            session,
            store,
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(2),
            alive,
            reader,
        }))
    }

    fn take_link(&self) -> Option<Arc<Link>> {
        self.link.lock().expect("client lock poisoned").take()
    }

    fn link(&self) -> ClientResult<Arc<Link>> {
        match self.link.lock().expect("client lock poisoned").as_ref() {
            Some(link) if link.is_alive() => Ok(Arc::clone(link)),
            _ => Err(ClientError::StorageUnavailable("not connected".into())),
        }
    }

    async fn call(&self, message: Message, effect: CacheEffect) -> ClientResult<Message> {
        self.link()?
            .call(message, effect, Some(self.config.request_timeout()))
            .await
    }

    /// Like `call`, but waits as long as the server needs. For requests
    /// queued behind the commit lock.
    async fn call_unbounded(&self, message: Message) -> ClientResult<Message> {
        self.link()?.call(message, CacheEffect::None, None).await
    }

    /// Close the connection. The cache is kept for the next reconnect.
    pub async fn close(&self) {
        if let Some(link) = self.take_link() {
            let mut writer = link.writer.lock().await;
            let _ = writer.shutdown().await;
            info!(session = %link.session, "disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link().is_ok()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.link().ok().map(|link| link.session)
    }

    pub fn store_name(&self) -> Option<String> {
        self.link().ok().map(|link| link.store.clone())
    }

    /// Newest commit whose invalidations the cache has applied.
    pub fn last_tid(&self) -> Tid {
        self.cache.lock().expect("cache poisoned").last_tid()
    }

    /// Tid of the last transaction this client committed.
    pub fn last_transaction(&self) -> Option<Tid> {
        *self.last_commit.lock().expect("client lock poisoned")
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().expect("cache poisoned").stats()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().expect("cache poisoned").len()
    }

    pub fn is_cached(&self, oid: Oid) -> bool {
        self.cache.lock().expect("cache poisoned").contains(oid)
    }

    /// Invalidations pushed by the server from now on, after they have been
    /// applied to the cache.
    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.events.subscribe()
    }

    /// Newest committed state of `oid`, from the cache or the server.
    pub async fn load(&self, oid: Oid) -> ClientResult<ObjectRecord> {
        let link = self.link()?;
        if let Some(record) = self.cache.lock().expect("cache poisoned").get(oid) {
            return Ok(record);
        }
        let reply = link
            .call(
                Message::Load { oid },
                CacheEffect::Load,
                Some(self.config.request_timeout()),
            )
            .await?;
        match reply {
            Message::Loaded { record } => Ok(record),
            other => Err(unexpected("Loaded", &other)),
        }
    }

    pub async fn new_oids(&self, count: u32) -> ClientResult<Vec<Oid>> {
        match self.call(Message::NewOids { count }, CacheEffect::None).await? {
            Message::Oids { oids } => Ok(oids),
            other => Err(unexpected("Oids", &other)),
        }
    }

    pub async fn new_oid(&self) -> ClientResult<Oid> {
        self.new_oids(1)
            .await?
            .into_iter()
            .next()
            .ok_or(ClientError::UnexpectedReply {
                expected: "at least one oid",
                got: "Oids",
            })
    }

    /// Start a transaction. A transaction this client began and never
    /// resolved is aborted first.
    pub async fn begin(&self) -> ClientResult<Transaction<'_>> {
        let abandoned = self.open_tx.lock().expect("client lock poisoned").take();
        if let Some(tx) = abandoned {
            debug!(%tx, "aborting abandoned transaction");
            self.call(Message::Abort { tx }, CacheEffect::None).await?;
        }
        match self.call(Message::Begin, CacheEffect::None).await? {
            Message::TxBegun { tx } => {
                *self.open_tx.lock().expect("client lock poisoned") = Some(tx);
                Ok(Transaction {
                    client: self,
                    tx,
                    writes: Vec::new(),
                    state: TransactionState::Open,
                })
            }
            other => Err(unexpected("TxBegun", &other)),
        }
    }

    /// Run a whole transaction writing `(oid, basis, state)` triples.
    /// Aborts it on any failure.
    pub async fn commit(&self, writes: Vec<(Oid, Tid, Vec<u8>)>) -> ClientResult<Tid> {
        let mut txn = self.begin().await?;
        let outcome = async {
            for (oid, basis, state) in writes {
                txn.store(oid, basis, state).await?;
            }
            txn.vote().await?;
            txn.finish().await
        }
        .await;
        if outcome.is_err() && txn.state() != TransactionState::Aborted {
            let _ = txn.abort().await;
        }
        outcome
    }

    fn resolved(&self, tx: TxId, committed: Option<Tid>) {
        let mut open = self.open_tx.lock().expect("client lock poisoned");
        if *open == Some(tx) {
            *open = None;
        }
        if let Some(tid) = committed {
            *self.last_commit.lock().expect("client lock poisoned") = Some(tid);
        }
    }

    pub async fn ping(&self) -> ClientResult<Tid> {
        match self.call(Message::Ping, CacheEffect::None).await? {
            Message::Pong { current_tid } => Ok(current_tid),
            other => Err(unexpected("Pong", &other)),
        }
    }

    pub async fn status(&self) -> ClientResult<ServerStatus> {
        match self.call(Message::Status, CacheEffect::None).await? {
            Message::StatusReport(status) => Ok(status),
            other => Err(unexpected("StatusReport", &other)),
        }
    }

    /// Wait until no commit is in progress on the server; returns its
    /// current tid.
    pub async fn quiesce(&self) -> ClientResult<Tid> {
        match self.call_unbounded(Message::Quiesce).await? {
            Message::Quiesced { tid } => Ok(tid),
            other => Err(unexpected("Quiesced", &other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Voted,
    Committed(Tid),
    Aborted,
}

impl TransactionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Voted => "voted",
            Self::Committed(_) => "committed",
            Self::Aborted => "aborted",
        }
    }
}

/// A transaction in progress on the server.
///
/// Writes are buffered server-side; the client keeps a copy so the cache can
/// be updated with the committed states once finish succeeds.
pub struct Transaction<'a> {
    client: &'a Client,
    tx: TxId,
    writes: Vec<(Oid, Vec<u8>)>,
    state: TransactionState,
}

impl Transaction<'_> {
    pub fn id(&self) -> TxId {
        self.tx
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn require(&self, wanted: TransactionState) -> ClientResult<()> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(ClientError::TransactionState(self.state.name()))
        }
    }

    fn note_failure(&mut self, err: &ClientError) {
        if matches!(err, ClientError::Conflict { .. } | ClientError::Aborted(_)) {
            self.state = TransactionState::Aborted;
            self.client.resolved(self.tx, None);
        }
    }

    /// Propose `state` for `oid`, written against the client's view `basis`.
    pub async fn store(
        &mut self,
        oid: Oid,
        basis: Tid,
        state: impl Into<Vec<u8>>,
    ) -> ClientResult<()> {
        self.require(TransactionState::Open)?;
        let state = state.into();
        let request = Message::Store {
            tx: self.tx,
            oid,
            basis,
            state: state.clone(),
        };
        if let Err(e) = self.client.call(request, CacheEffect::None).await {
            self.note_failure(&e);
            return Err(e);
        }
        match self.writes.iter_mut().find(|(o, _)| *o == oid) {
            Some(existing) => existing.1 = state,
            None => self.writes.push((oid, state)),
        }
        Ok(())
    }

    /// Validate the transaction. May wait for other writers to finish.
    pub async fn vote(&mut self) -> ClientResult<()> {
        self.require(TransactionState::Open)?;
        match self.client.call_unbounded(Message::Vote { tx: self.tx }).await {
            Ok(_) => {
                self.state = TransactionState::Voted;
                Ok(())
            }
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    /// Commit a voted transaction.
    pub async fn finish(&mut self) -> ClientResult<Tid> {
        self.require(TransactionState::Voted)?;
        let writes = std::mem::take(&mut self.writes);
        let reply = self
            .client
            .call(Message::Finish { tx: self.tx }, CacheEffect::Commit(writes))
            .await;
        match reply {
            Ok(Message::Committed { tid }) => {
                self.state = TransactionState::Committed(tid);
                self.client.resolved(self.tx, Some(tid));
                Ok(tid)
            }
            Ok(other) => Err(unexpected("Committed", &other)),
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    /// Abandon the transaction. Aborting twice is harmless.
    pub async fn abort(&mut self) -> ClientResult<()> {
        if let TransactionState::Committed(_) = self.state {
            return Err(ClientError::TransactionState("committed"));
        }
        self.client
            .call(Message::Abort { tx: self.tx }, CacheEffect::None)
            .await?;
        self.state = TransactionState::Aborted;
        self.writes.clear();
        self.client.resolved(self.tx, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tide_protocol::ErrorCode;

    fn cache() -> Mutex<ObjectCache> {
        Mutex::new(ObjectCache::new(8))
    }

    #[test]
    fn commit_reply_caches_own_writes() {
        let cache = cache();
        let writes = vec![(Oid::new(1), b"a".to_vec()), (Oid::new(2), b"b".to_vec())];
        let committed = Message::Committed { tid: Tid::new(4) };
        let reply = apply_reply(&cache, CacheEffect::Commit(writes), committed).unwrap();
        assert!(matches!(reply, Message::Committed { .. }));

        let mut cache = cache.into_inner().unwrap();
        assert_eq!(cache.last_tid(), Tid::new(4));
        assert_eq!(
            cache.get(Oid::new(2)).unwrap(),
            ObjectRecord::new(Oid::new(2), Tid::new(4), b"b".to_vec())
        );
    }

    #[test]
    fn error_reply_maps_and_leaves_cache_alone() {
        let cache = cache();
        let err = apply_reply(
            &cache,
            CacheEffect::Commit(vec![(Oid::new(1), b"a".to_vec())]),
            Message::Error {
                code: ErrorCode::Conflict,
                message: "conflict".into(),
                oids: vec![Oid::new(1)],
            },
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::Conflict { oids } if oids == vec![Oid::new(1)]));
        assert!(cache.lock().unwrap().is_empty());
    }

    #[test]
    fn load_reply_older_than_an_invalidation_is_not_cached() {
        let cache = cache();
        cache.lock().unwrap().apply_invalidation(Tid::new(5), &[Oid::new(3)]);
        let stale = ObjectRecord::new(Oid::new(3), Tid::new(2), b"old".to_vec());
        apply_reply(&cache, CacheEffect::Load, Message::Loaded { record: stale }).unwrap();
        assert!(!cache.lock().unwrap().contains(Oid::new(3)));
    }

    #[test]
    fn resync_reply_clears_on_full_invalidate() {
        let cache = cache();
        cache
            .lock()
            .unwrap()
            .insert(ObjectRecord::new(Oid::new(1), Tid::ZERO, b"x".to_vec()));
        let full = Message::FullInvalidate {
            current_tid: Tid::new(9),
        };
        apply_reply(&cache, CacheEffect::Resync, full).unwrap();
        let cache = cache.into_inner().unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.last_tid(), Tid::new(9));
    }
}
