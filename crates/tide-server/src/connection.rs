use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tide_protocol::{
    ErrorCode, Frame, Message, ProtocolError, ServerStatus, TideCodec, MAX_HANDSHAKE_SIZE,
    PROTOCOL_VERSION,
};
use tide_store::StoreResult;
use tide_types::{Oid, Tid};

use crate::context::StoreContext;
use crate::coordinator::TxStatus;
use crate::error::{CommitError, CommitResult, ServerError, ServerResult};
use crate::resync::{plan_resync, ResyncOutcome};
use crate::session::{DisconnectSignal, Session};

/// Upper bound on oids handed out by a single `NewOids` request.
const MAX_OIDS_PER_REQUEST: u32 = 1000;

/// Enqueues replies for one connection. Never blocks; a connection whose
/// queue is full is closed.
#[derive(Clone)]
struct Responder {
    outbound: mpsc::Sender<Frame>,
    disconnect: DisconnectSignal,
}

impl Responder {
    fn reply(&self, request_id: u64, message: Message) {
        match self.outbound.try_send(Frame::new(request_id, message)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(request_id, "outbound queue full; closing connection");
                self.disconnect.trigger();
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Map a commit failure to the error reply the client sees.
pub fn commit_error_reply(err: &CommitError) -> Message {
    let (code, oids) = match err {
        CommitError::StaleBasis { oid, .. } => (ErrorCode::StaleBasis, vec![*oid]),
        CommitError::Conflict { oids } => (ErrorCode::Conflict, oids.clone()),
        CommitError::Aborted(_) => (ErrorCode::Aborted, Vec::new()),
        CommitError::UnknownTransaction(_) => (ErrorCode::UnknownTransaction, Vec::new()),
        CommitError::InvalidState { .. } => (ErrorCode::InvalidState, Vec::new()),
        CommitError::ReadOnly => (ErrorCode::ReadOnly, Vec::new()),
        CommitError::Store(_) => (ErrorCode::Storage, Vec::new()),
    };
    Message::Error {
        code,
        message: err.to_string(),
        oids,
    }
}

/// Serve one client connection until it closes.
///
/// After the handshake the connection runs as three tasks: this one reads
/// requests, a writer drains the outbound queue, and a transaction worker
/// executes transaction commands in arrival order. Loads, resyncs and oid
/// allocation run on short-lived blocking tasks so they proceed while a
/// vote is waiting for the commit lock.
///
/// On close, the worker is cancelled first (which drops any pending lock
/// wait), then every transaction the session left open is aborted.
pub async fn handle_connection<S>(
    ctx: Arc<StoreContext>,
    stream: S,
    peer: String,
) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let session = match timeout(
        ctx.config().handshake_timeout(),
        handshake(&ctx, &mut reader, &mut writer, peer),
    )
    .await
    {
        Ok(session) => Arc::new(session?),
        Err(_) => return Err(ServerError::Handshake("timed out waiting for handshake".into())),
    };
    let id = session.id();

    let (outbound, outbound_rx) = mpsc::channel(ctx.config().outbound_queue);
    let disconnect = DisconnectSignal::new();
    ctx.broadcaster()
        .register(id, outbound.clone(), disconnect.clone());
    let responder = Responder {
        outbound,
        disconnect: disconnect.clone(),
    };

    let writer_task = tokio::spawn(write_loop(
        writer,
        Arc::clone(&session),
        outbound_rx,
        disconnect.clone(),
    ));
    let (commands, command_rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(transaction_worker(
        Arc::clone(&ctx),
        Arc::clone(&session),
        command_rx,
        responder.clone(),
    ));

    let result = read_loop(&ctx, &session, &mut reader, &commands, &responder).await;

    ctx.broadcaster().unregister(id);
    worker.abort();
    let _ = worker.await;
    let aborted = ctx.coordinator().abort_session(id);
    disconnect.trigger();
    let _ = writer_task.await;

    match &result {
        Ok(()) => info!(session = %id, peer = session.peer(), aborted, "session closed"),
        Err(e) => warn!(
            session = %id,
            peer = session.peer(),
            aborted,
            error = %e,
            "session failed"
        ),
    }
    result
}

async fn handshake<R, W>(
    ctx: &StoreContext,
    reader: &mut R,
    writer: &mut W,
    peer: String,
) -> ServerResult<Session>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let frame = TideCodec::read_frame_limited(reader, MAX_HANDSHAKE_SIZE)
        .await?
        .ok_or(ProtocolError::ConnectionClosed)?;
    let request_id = frame.request_id;

    let (version, credentials, read_only) = match frame.message {
        Message::Handshake {
            version,
            credentials,
            read_only,
        } => (version, credentials, read_only),
        other => {
            reject(writer, request_id, "expected Handshake").await;
            return Err(ProtocolError::UnexpectedMessage {
                expected: "Handshake",
                got: other.type_name(),
            }
            .into());
        }
    };

    if version != PROTOCOL_VERSION {
        reject(
            writer,
            request_id,
            &format!("unsupported protocol version {version}"),
        )
        .await;
        return Err(ProtocolError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: version,
        }
        .into());
    }

    let identity = match ctx.authenticator().authenticate(&credentials).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(%peer, credentials = credentials.display_name(), "handshake rejected");
            reject(writer, request_id, &e.to_string()).await;
            return Err(e);
        }
    };

    let current_tid = ctx.backend().current_tid()?;
    let session = Session::new(
        peer,
        identity,
        read_only || ctx.config().read_only,
        current_tid,
    );
    let ack = Message::HandshakeAck {
        session: session.id(),
        store: ctx.name().to_string(),
        current_tid,
    };
    TideCodec::write_frame(writer, &Frame::new(request_id, ack)).await?;

    info!(
        session = %session.id(),
        peer = session.peer(),
        user = %session.identity().name,
        read_only = session.is_read_only(),
        "session opened"
    );
    Ok(session)
}

async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, request_id: u64, reason: &str) {
    let frame = Frame::new(
        request_id,
        Message::HandshakeRejected {
            reason: reason.to_string(),
        },
    );
    let _ = TideCodec::write_frame(writer, &frame).await;
}

async fn write_loop<W>(
    mut writer: W,
    session: Arc<Session>,
    mut outbound: mpsc::Receiver<Frame>,
    disconnect: DisconnectSignal,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = disconnect.triggered() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Message::Invalidate { tid, .. } | Message::Committed { tid } = &frame.message {
            session.observe_tid(*tid);
        }
        if let Err(e) = TideCodec::write_frame(&mut writer, &frame).await {
            debug!(error = %e, "write failed");
            disconnect.trigger();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(
    ctx: &Arc<StoreContext>,
    session: &Arc<Session>,
    reader: &mut R,
    commands: &mpsc::UnboundedSender<Frame>,
    responder: &Responder,
) -> ServerResult<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = responder.disconnect.triggered() => return Ok(()),
            frame = TideCodec::read_frame(&mut *reader) => frame?,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        debug!(
            session = %session.id(),
            request_id = frame.request_id,
            message = frame.message.type_name(),
            "request"
        );
        dispatch(ctx, session, frame, commands, responder);
    }
}

fn dispatch(
    ctx: &Arc<StoreContext>,
    session: &Arc<Session>,
    frame: Frame,
    commands: &mpsc::UnboundedSender<Frame>,
    responder: &Responder,
) {
    let request_id = frame.request_id;
    if frame.message.is_transactional() {
        if commands.send(frame).is_err() {
            responder.reply(
                request_id,
                Message::error(ErrorCode::Aborted, "transaction worker stopped"),
            );
        }
        return;
    }

    match frame.message {
        Message::Load { oid } => spawn_load(Arc::clone(ctx), request_id, oid, responder.clone()),
        Message::Resync { last_known_tid } => spawn_resync(
            Arc::clone(ctx),
            Arc::clone(session),
            request_id,
            last_known_tid,
            responder.clone(),
        ),
        Message::NewOids { count } => {
            if session.is_read_only() {
                responder.reply(
                    request_id,
                    commit_error_reply(&CommitError::ReadOnly),
                );
            } else {
                spawn_new_oids(Arc::clone(ctx), request_id, count, responder.clone());
            }
        }
        Message::Ping => {
            let reply = match ctx.backend().current_tid() {
                Ok(current_tid) => Message::Pong { current_tid },
                Err(e) => Message::error(ErrorCode::Storage, e.to_string()),
            };
            responder.reply(request_id, reply);
        }
        Message::Status => {
            let reply = match ctx.status() {
                Ok(status) => Message::StatusReport(ServerStatus {
                    session_tid: session.last_known_tid(),
                    ..status
                }),
                Err(e) => Message::error(ErrorCode::Storage, e.to_string()),
            };
            responder.reply(request_id, reply);
        }
        Message::Quiesce => {
            let ctx = Arc::clone(ctx);
            let responder = responder.clone();
            tokio::spawn(async move {
                let reply = match ctx.coordinator().quiesce().await {
                    Ok(tid) => Message::Quiesced { tid },
                    Err(e) => commit_error_reply(&e),
                };
                responder.reply(request_id, reply);
            });
        }
        other => responder.reply(
            request_id,
            Message::error(
                ErrorCode::Protocol,
                format!("unexpected {} from client", other.type_name()),
            ),
        ),
    }
}

/// Read an object and enqueue the reply with commits excluded, so a commit
/// touching it is announced either before the reply (and the reply carries
/// the new state) or after it.
fn spawn_load(ctx: Arc<StoreContext>, request_id: u64, oid: Oid, responder: Responder) {
    tokio::task::spawn_blocking(move || {
        ctx.record_load();
        ctx.coordinator().read_consistent(|backend| {
            let reply = match backend.load(oid) {
                Ok(Some(record)) => Message::Loaded { record },
                Ok(None) => Message::Error {
                    code: ErrorCode::NotFound,
                    message: format!("object {oid} not found"),
                    oids: vec![oid],
                },
                Err(e) => {
                    warn!(%oid, error = %e, "load failed");
                    Message::error(ErrorCode::Storage, e.to_string())
                }
            };
            responder.reply(request_id, reply);
        });
    });
}

fn spawn_resync(
    ctx: Arc<StoreContext>,
    session: Arc<Session>,
    request_id: u64,
    last_known: Tid,
    responder: Responder,
) {
    tokio::task::spawn_blocking(move || {
        let policy = &ctx.config().resync;
        ctx.coordinator().read_consistent(|backend| {
            let reply = match plan_resync(last_known, backend, ctx.broadcaster(), policy) {
                Ok(outcome) => {
                    session.observe_tid(outcome.current_tid());
                    match outcome {
                        ResyncOutcome::Incremental { current_tid, oids } => {
                            Message::ResyncIncremental { current_tid, oids }
                        }
                        ResyncOutcome::FullInvalidate { current_tid, reason } => {
                            info!(
                                session = %session.id(),
                                %last_known,
                                ?reason,
                                "client must drop its cache"
                            );
                            Message::FullInvalidate { current_tid }
                        }
                    }
                }
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "resync failed");
                    Message::error(ErrorCode::Storage, e.to_string())
                }
            };
            responder.reply(request_id, reply);
        });
    });
}

fn spawn_new_oids(ctx: Arc<StoreContext>, request_id: u64, count: u32, responder: Responder) {
    tokio::task::spawn_blocking(move || {
        let count = count.clamp(1, MAX_OIDS_PER_REQUEST);
        let backend = ctx.backend();
        let reply = match (0..count)
            .map(|_| backend.new_oid())
            .collect::<StoreResult<Vec<Oid>>>()
        {
            Ok(oids) => Message::Oids { oids },
            Err(e) => Message::error(ErrorCode::Storage, e.to_string()),
        };
        responder.reply(request_id, reply);
    });
}

/// Executes the connection's transaction commands one at a time.
///
/// A transaction that has voted holds the store's commit lock, so it must
/// finish or abort within `transaction_timeout` of taking the lock. Other
/// traffic does not extend that window. On expiry the transaction is
/// aborted and the connection is closed.
async fn transaction_worker(
    ctx: Arc<StoreContext>,
    session: Arc<Session>,
    mut commands: mpsc::UnboundedReceiver<Frame>,
    responder: Responder,
) {
    let stall_limit = ctx.config().transaction_timeout();
    loop {
        let voted = session
            .open_transaction()
            .filter(|tx| ctx.coordinator().status_of(*tx) == Some(TxStatus::Voted));

        let next = match voted {
            Some(tx) => {
                let held = ctx.coordinator().lock().held_for(tx).unwrap_or_default();
                let remaining = stall_limit.saturating_sub(held);
                let next = if remaining.is_zero() {
                    None
                } else {
                    timeout(remaining, commands.recv()).await.ok()
                };
                match next {
                    Some(next) => next,
                    None => {
                        warn!(
                            session = %session.id(),
                            %tx,
                            timeout_secs = stall_limit.as_secs(),
                            "voted transaction stalled; aborting"
                        );
                        let _ = ctx.coordinator().abort(session.id(), tx);
                        session.close_transaction(tx);
                        responder.disconnect.trigger();
                        return;
                    }
                }
            }
            None => commands.recv().await,
        };
        let Some(frame) = next else {
            return;
        };

        let reply = match execute(&ctx, &session, frame.message).await {
            Ok(reply) => reply,
            Err(e) => commit_error_reply(&e),
        };
        responder.reply(frame.request_id, reply);
    }
}

async fn execute(ctx: &StoreContext, session: &Session, message: Message) -> CommitResult<Message> {
    let coordinator = ctx.coordinator();
    let id = session.id();
    match message {
        Message::Begin => {
            if let Some(open) = session.open_transaction() {
                if let Some(status @ (TxStatus::Pending | TxStatus::Voted)) =
                    coordinator.status_of(open)
                {
                    return Err(CommitError::InvalidState {
                        tx: open,
                        status: status.as_str(),
                        operation: "begin another transaction",
                    });
                }
            }
            let tx = coordinator.begin(id, session.is_read_only());
            session.set_open_transaction(Some(tx));
            Ok(Message::TxBegun { tx })
        }
        Message::Store {
            tx,
            oid,
            basis,
            state,
        } => {
            coordinator.store(id, tx, oid, basis, state)?;
            Ok(Message::Ok)
        }
        Message::Vote { tx } => {
            coordinator.vote(id, tx).await?;
            Ok(Message::Ok)
        }
        Message::Finish { tx } => {
            let tid = run_blocking(|| coordinator.finish(id, tx))?;
            session.close_transaction(tx);
            Ok(Message::Committed { tid })
        }
        Message::Abort { tx } => {
            coordinator.abort(id, tx)?;
            session.close_transaction(tx);
            Ok(Message::Ok)
        }
        other => Ok(Message::error(
            ErrorCode::Protocol,
            format!("{} is not a transaction command", other.type_name()),
        )),
    }
}

/// Run synchronous disk work from a connection task. On the multi-thread
/// runtime the worker hands its other tasks off first. The call stays inside
/// the current poll, so cancelling the caller cannot interrupt it halfway.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tide_protocol::Credentials;
    use tide_store::InMemoryBackend;
    use tide_types::SessionId;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    use crate::auth::{AllowAll, StaticTokens};
    use crate::config::ServerConfig;

    fn context(config: ServerConfig) -> Arc<StoreContext> {
        let backend = Arc::new(InMemoryBackend::new());
        Arc::new(StoreContext::new(config, backend, Arc::new(AllowAll)).unwrap())
    }

    /// Minimal protocol client over an in-memory pipe.
    struct Peer {
        stream: DuplexStream,
        next_id: u64,
        pushes: Vec<Message>,
        server: JoinHandle<ServerResult<()>>,
    }

    impl Peer {
        fn attach(ctx: &Arc<StoreContext>) -> Self {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let server = tokio::spawn(handle_connection(Arc::clone(ctx), server, "test".into()));
            Self {
                stream: client,
                next_id: 0,
                pushes: Vec::new(),
                server,
            }
        }

        async fn connect(ctx: &Arc<StoreContext>) -> Self {
            let mut peer = Self::attach(ctx);
            let ack = peer
                .request(Message::Handshake {
                    version: PROTOCOL_VERSION,
                    credentials: Credentials::Anonymous,
                    read_only: false,
                })
                .await;
            assert!(matches!(ack, Message::HandshakeAck { .. }), "got {}", ack.type_name());
            peer
        }

        async fn request(&mut self, message: Message) -> Message {
            self.next_id += 1;
            let id = self.next_id;
            TideCodec::write_frame(&mut self.stream, &Frame::new(id, message))
                .await
                .unwrap();
            loop {
                let frame = TideCodec::read_frame(&mut self.stream)
                    .await
                    .unwrap()
                    .expect("server closed connection");
                if frame.request_id == id {
                    return frame.message;
                }
                assert!(frame.is_push());
                self.pushes.push(frame.message);
            }
        }

        async fn next_push(&mut self) -> Message {
            if !self.pushes.is_empty() {
                return self.pushes.remove(0);
            }
            let frame = TideCodec::read_frame(&mut self.stream).await.unwrap().unwrap();
            assert!(frame.is_push());
            frame.message
        }

        async fn begin(&mut self) -> tide_types::TxId {
            match self.request(Message::Begin).await {
                Message::TxBegun { tx } => tx,
                other => panic!("unexpected {}", other.type_name()),
            }
        }
    }

    #[tokio::test]
    async fn full_commit_over_the_wire() {
        let ctx = context(ServerConfig::default());
        let mut peer = Peer::connect(&ctx).await;

        let tx = peer.begin().await;
        let reply = peer
            .request(Message::Store {
                tx,
                oid: Oid::new(1),
                basis: Tid::ZERO,
                state: b"hello".to_vec(),
            })
            .await;
        assert!(matches!(reply, Message::Ok));
        assert!(matches!(peer.request(Message::Vote { tx }).await, Message::Ok));
        match peer.request(Message::Finish { tx }).await {
            Message::Committed { tid } => assert_eq!(tid, Tid::new(1)),
            other => panic!("unexpected {}", other.type_name()),
        }

        match peer.request(Message::Load { oid: Oid::new(1) }).await {
            Message::Loaded { record } => {
                assert_eq!(record.tid, Tid::new(1));
                assert_eq!(record.state, b"hello");
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        match peer.request(Message::Load { oid: Oid::new(2) }).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn other_sessions_receive_invalidations() {
        let ctx = context(ServerConfig::default());
        let mut writer = Peer::connect(&ctx).await;
        let mut reader = Peer::connect(&ctx).await;

        let tx = writer.begin().await;
        writer
            .request(Message::Store {
                tx,
                oid: Oid::new(9),
                basis: Tid::ZERO,
                state: vec![1],
            })
            .await;
        writer.request(Message::Vote { tx }).await;
        writer.request(Message::Finish { tx }).await;

        match reader.next_push().await {
            Message::Invalidate { tid, oids } => {
                assert_eq!(tid, Tid::new(1));
                assert_eq!(oids, vec![Oid::new(9)]);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        assert!(writer.pushes.is_empty());
    }

    #[tokio::test]
    async fn stale_vote_reports_conflicting_oids() {
        let ctx = context(ServerConfig {
            eager_conflict_detection: false,
            ..ServerConfig::default()
        });
        let mut a = Peer::connect(&ctx).await;
        let mut b = Peer::connect(&ctx).await;

        let tx_b = b.begin().await;
        b.request(Message::Store {
            tx: tx_b,
            oid: Oid::new(1),
            basis: Tid::ZERO,
            state: b"b".to_vec(),
        })
        .await;

        let tx_a = a.begin().await;
        a.request(Message::Store {
            tx: tx_a,
            oid: Oid::new(1),
            basis: Tid::ZERO,
            state: b"a".to_vec(),
        })
        .await;
        a.request(Message::Vote { tx: tx_a }).await;
        a.request(Message::Finish { tx: tx_a }).await;

        match b.request(Message::Vote { tx: tx_b }).await {
            Message::Error { code, oids, .. } => {
                assert_eq!(code, ErrorCode::Conflict);
                assert_eq!(oids, vec![Oid::new(1)]);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        // Abort after a failed vote is still fine.
        assert!(matches!(b.request(Message::Abort { tx: tx_b }).await, Message::Ok));
    }

    #[tokio::test]
    async fn one_open_transaction_per_session() {
        let ctx = context(ServerConfig::default());
        let mut peer = Peer::connect(&ctx).await;
        let tx = peer.begin().await;
        match peer.request(Message::Begin).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidState),
            other => panic!("unexpected {}", other.type_name()),
        }
        peer.request(Message::Abort { tx }).await;
        peer.begin().await;
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let ctx = context(ServerConfig::default());
        let mut peer = Peer::attach(&ctx);
        let reply = peer
            .request(Message::Handshake {
                version: PROTOCOL_VERSION + 1,
                credentials: Credentials::Anonymous,
                read_only: false,
            })
            .await;
        assert!(matches!(reply, Message::HandshakeRejected { .. }));
        assert!(matches!(
            peer.server.await.unwrap(),
            Err(ServerError::Protocol(ProtocolError::VersionMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn oversized_handshake_is_refused() {
        let ctx = context(ServerConfig::default());
        let mut peer = Peer::attach(&ctx);
        let announced = (MAX_HANDSHAKE_SIZE as u32 + 2).to_be_bytes();
        peer.stream.write_all(&announced).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), peer.server)
            .await
            .expect("server should give up on the handshake")
            .unwrap();
        assert!(matches!(
            result,
            Err(ServerError::Protocol(ProtocolError::MessageTooLarge { .. }))
        ));
        assert_eq!(ctx.broadcaster().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let ctx = Arc::new(
            StoreContext::new(
                ServerConfig::default(),
                Arc::new(InMemoryBackend::new()),
                Arc::new(StaticTokens::new(vec!["good".to_string()], false)),
            )
            .unwrap(),
        );
        let mut peer = Peer::attach(&ctx);
        let reply = peer
            .request(Message::Handshake {
                version: PROTOCOL_VERSION,
                credentials: Credentials::Token("bad".into()),
                read_only: false,
            })
            .await;
        assert!(matches!(reply, Message::HandshakeRejected { .. }));
        assert!(matches!(peer.server.await.unwrap(), Err(ServerError::AuthFailed(_))));
    }

    #[tokio::test]
    async fn read_only_sessions_cannot_write() {
        let ctx = context(ServerConfig {
            read_only: true,
            ..ServerConfig::default()
        });
        let mut peer = Peer::connect(&ctx).await;
        let tx = peer.begin().await;
        match peer
            .request(Message::Store {
                tx,
                oid: Oid::new(1),
                basis: Tid::ZERO,
                state: vec![],
            })
            .await
        {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::ReadOnly),
            other => panic!("unexpected {}", other.type_name()),
        }
        match peer.request(Message::NewOids { count: 1 }).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::ReadOnly),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn status_reports_what_the_session_was_sent() {
        let ctx = context(ServerConfig::default());
        let mut writer = Peer::connect(&ctx).await;
        let mut reader = Peer::connect(&ctx).await;

        for oid in 1..=2 {
            let tx = writer.begin().await;
            writer
                .request(Message::Store {
                    tx,
                    oid: Oid::new(oid),
                    basis: Tid::ZERO,
                    state: vec![1],
                })
                .await;
            writer.request(Message::Vote { tx }).await;
            writer.request(Message::Finish { tx }).await;
        }

        // Both pushes are written before the ping reply.
        reader.request(Message::Ping).await;
        assert_eq!(reader.pushes.len(), 2);
        match reader.request(Message::Status).await {
            Message::StatusReport(status) => {
                assert_eq!(status.session_tid, Tid::new(2));
                assert_eq!(status.current_tid, Tid::new(2));
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        match writer.request(Message::Status).await {
            Message::StatusReport(status) => assert_eq!(status.session_tid, Tid::new(2)),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn resync_ping_status_and_oids() {
        let ctx = context(ServerConfig::default());
        let mut peer = Peer::connect(&ctx).await;

        match peer.request(Message::NewOids { count: 3 }).await {
            Message::Oids { oids } => assert_eq!(oids.len(), 3),
            other => panic!("unexpected {}", other.type_name()),
        }
        match peer
            .request(Message::Resync {
                last_known_tid: Tid::new(5),
            })
            .await
        {
            Message::FullInvalidate { current_tid } => assert_eq!(current_tid, Tid::ZERO),
            other => panic!("unexpected {}", other.type_name()),
        }
        match peer.request(Message::Resync { last_known_tid: Tid::ZERO }).await {
            Message::ResyncIncremental { current_tid, oids } => {
                assert_eq!(current_tid, Tid::ZERO);
                assert!(oids.is_empty());
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        assert!(matches!(peer.request(Message::Ping).await, Message::Pong { .. }));
        match peer.request(Message::Status).await {
            Message::StatusReport(status) => assert_eq!(status.sessions, 1),
            other => panic!("unexpected {}", other.type_name()),
        }
        assert!(matches!(
            peer.request(Message::Quiesce).await,
            Message::Quiesced { .. }
        ));
    }

    #[tokio::test]
    async fn dropping_a_waiting_connection_leaves_the_queue() {
        let ctx = context(ServerConfig::default());
        let holder = SessionId::new();
        let coordinator = ctx.coordinator();
        let held = coordinator.begin(holder, false);
        coordinator
            .store(holder, held, Oid::new(1), Tid::ZERO, vec![1])
            .unwrap();
        coordinator.vote(holder, held).await.unwrap();

        let mut peer = Peer::connect(&ctx).await;
        let tx = peer.begin().await;
        peer.request(Message::Store {
            tx,
            oid: Oid::new(2),
            basis: Tid::ZERO,
            state: vec![2],
        })
        .await;
        peer.next_id += 1;
        TideCodec::write_frame(&mut peer.stream, &Frame::new(peer.next_id, Message::Vote { tx }))
            .await
            .unwrap();
        while coordinator.lock().waiters() == 0 {
            tokio::task::yield_now().await;
        }

        let Peer { stream, server, .. } = peer;
        drop(stream);
        server.await.unwrap().unwrap();

        assert_eq!(coordinator.lock().waiters(), 0);
        assert_eq!(coordinator.status_of(tx), None);
        assert_eq!(coordinator.lock().holder(), Some(held));
        assert_eq!(ctx.broadcaster().subscriber_count(), 0);
    }

    /// Backend whose appends take a while.
    struct SlowDisk {
        inner: InMemoryBackend,
        delay: Duration,
    }

    impl tide_store::StorageBackend for SlowDisk {
        fn name(&self) -> &str {
            "slow"
        }
        fn load(&self, oid: Oid) -> StoreResult<Option<tide_types::ObjectRecord>> {
            self.inner.load(oid)
        }
        fn store_batch(&self, tid: Tid, writes: &[(Oid, Vec<u8>)]) -> StoreResult<()> {
            std::thread::sleep(self.delay);
            self.inner.store_batch(tid, writes)
        }
        fn current_tid(&self) -> StoreResult<Tid> {
            self.inner.current_tid()
        }
        fn iterate_since(&self, since: Tid) -> StoreResult<Vec<tide_types::Invalidation>> {
            self.inner.iterate_since(since)
        }
        fn new_oid(&self) -> StoreResult<Oid> {
            self.inner.new_oid()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn slow_commit_does_not_stall_other_connections() {
        let backend = Arc::new(SlowDisk {
            inner: InMemoryBackend::new(),
            delay: Duration::from_millis(800),
        });
        let ctx = Arc::new(
            StoreContext::new(ServerConfig::default(), backend, Arc::new(AllowAll)).unwrap(),
        );
        let mut writer = Peer::connect(&ctx).await;
        let mut other = Peer::connect(&ctx).await;

        let tx = writer.begin().await;
        writer
            .request(Message::Store {
                tx,
                oid: Oid::new(1),
                basis: Tid::ZERO,
                state: vec![1],
            })
            .await;
        writer.request(Message::Vote { tx }).await;
        let finishing =
            tokio::spawn(async move { writer.request(Message::Finish { tx }).await });

        // Give the finish time to reach the backend.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        assert!(matches!(other.request(Message::Ping).await, Message::Pong { .. }));
        let waited = started.elapsed();
        assert!(waited < Duration::from_millis(500), "ping waited {waited:?}");

        match finishing.await.unwrap() {
            Message::Committed { tid } => assert_eq!(tid, Tid::new(1)),
            reply => panic!("unexpected {}", reply.type_name()),
        }
    }

    #[tokio::test]
    async fn stalled_voter_is_aborted_and_disconnected() {
        let ctx = context(ServerConfig {
            transaction_timeout_secs: 1,
            ..ServerConfig::default()
        });
        let mut peer = Peer::connect(&ctx).await;
        let tx = peer.begin().await;
        peer.request(Message::Store {
            tx,
            oid: Oid::new(1),
            basis: Tid::ZERO,
            state: vec![1],
        })
        .await;
        peer.request(Message::Vote { tx }).await;
        assert!(ctx.coordinator().lock().holder().is_some());

        let closed = tokio::time::timeout(Duration::from_secs(5), peer.server)
            .await
            .expect("connection should close");
        closed.unwrap().unwrap();
        assert_eq!(ctx.coordinator().lock().holder(), None);
        assert!(ctx.backend().load(Oid::new(1)).unwrap().is_none());
    }

    #[tokio::test]
    async fn traffic_does_not_extend_a_voted_transaction() {
        let ctx = context(ServerConfig {
            transaction_timeout_secs: 1,
            ..ServerConfig::default()
        });
        let mut peer = Peer::connect(&ctx).await;
        let tx = peer.begin().await;
        peer.request(Message::Store {
            tx,
            oid: Oid::new(1),
            basis: Tid::ZERO,
            state: vec![1],
        })
        .await;
        peer.request(Message::Vote { tx }).await;

        // Rejected begins keep the worker busy past the deadline.
        let started = tokio::time::Instant::now();
        while started.elapsed() < Duration::from_millis(2500) {
            let begin = Frame::new(99, Message::Begin);
            let sent = TideCodec::write_frame(&mut peer.stream, &begin).await;
            if sent.is_err() || peer.server.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        let closed = tokio::time::timeout(Duration::from_secs(5), peer.server)
            .await
            .expect("connection should close");
        closed.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(2500));
        assert_eq!(ctx.coordinator().lock().holder(), None);
        assert_eq!(ctx.coordinator().status_of(tx), None);
        assert!(ctx.backend().load(Oid::new(1)).unwrap().is_none());
    }
}
