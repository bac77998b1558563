use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use tide_store::StorageBackend;

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::context::StoreContext;
use crate::error::ServerResult;

/// Tide storage server for a single store.
pub struct TideServer {
    ctx: Arc<StoreContext>,
    connections: Arc<Semaphore>,
}

impl TideServer {
    pub fn new(
        config: ServerConfig,
        backend: Arc<dyn StorageBackend>,
        authenticator: Arc<dyn Authenticator>,
    ) -> ServerResult<Self> {
        config.validate()?;
        let connections = Arc::new(Semaphore::new(config.max_connections));
        let ctx = Arc::new(StoreContext::new(config, backend, authenticator)?);
        Ok(Self { ctx, connections })
    }

    /// Open the configured storage and authenticator.
    pub fn from_config(config: ServerConfig) -> ServerResult<Self> {
        let backend = config.storage.open(config.read_only)?;
        let authenticator = config.auth.authenticator();
        Self::new(config, backend, authenticator)
    }

    pub fn config(&self) -> &ServerConfig {
        self.ctx.config()
    }

    pub fn context(&self) -> &Arc<StoreContext> {
        &self.ctx
    }

    /// Accept connections on `listener` until the process ends.
    pub async fn serve(self, listener: TcpListener) -> ServerResult<()> {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// open keep running until their clients leave.
    pub async fn serve_with_shutdown<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            addr = %listener.local_addr()?,
            store = self.ctx.name(),
            backend = self.ctx.backend().name(),
            current_tid = %self.ctx.backend().current_tid()?,
            "tide server listening"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; no longer accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let permit = match Arc::clone(&self.connections).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(
                                %peer,
                                limit = self.ctx.config().max_connections,
                                "connection limit reached; refusing"
                            );
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(ctx, stream, peer.to_string()).await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                        drop(permit);
                    });
                }
            }
        }
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn run(self) -> ServerResult<()> {
        let listener = TcpListener::bind(self.ctx.config().bind_addr).await?;
        self.serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tide_protocol::{Credentials, Frame, Message, TideCodec, PROTOCOL_VERSION};
    use tide_store::InMemoryBackend;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    use crate::auth::AllowAll;

    async fn start(config: ServerConfig) -> (std::net::SocketAddr, oneshot::Sender<()>) {
        let backend = Arc::new(InMemoryBackend::new());
        let server = TideServer::new(config, backend, Arc::new(AllowAll)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(server.serve_with_shutdown(listener, async {
            let _ = stopped.await;
        }));
        (addr, stop)
    }

    async fn handshake(stream: &mut TcpStream) -> Option<Message> {
        let hello = Message::Handshake {
            version: PROTOCOL_VERSION,
            credentials: Credentials::Anonymous,
            read_only: false,
        };
        TideCodec::write_frame(stream, &Frame::new(1, hello)).await.ok()?;
        TideCodec::read_frame(stream).await.ok().flatten().map(|f| f.message)
    }

    #[test]
    fn server_construction() {
        let server = TideServer::from_config(ServerConfig::default()).unwrap();
        assert_eq!(server.config().store_name, "main");
        assert_eq!(server.context().backend().name(), "memory");
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = ServerConfig {
            outbound_queue: 0,
            ..ServerConfig::default()
        };
        assert!(TideServer::from_config(config).is_err());
    }

    #[tokio::test]
    async fn serves_tcp_clients() {
        let (addr, _stop) = start(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(handshake(&mut stream).await, Some(Message::HandshakeAck { .. })));

        TideCodec::write_frame(&mut stream, &Frame::new(2, Message::Ping))
            .await
            .unwrap();
        let reply = TideCodec::read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(reply.request_id, 2);
        assert!(matches!(reply.message, Message::Pong { .. }));
    }

    #[tokio::test]
    async fn refuses_connections_over_the_limit() {
        let (addr, _stop) = start(ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        })
        .await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        assert!(handshake(&mut first).await.is_some());

        let mut second = TcpStream::connect(addr).await.unwrap();
        let refused = tokio::time::timeout(Duration::from_secs(5), handshake(&mut second))
            .await
            .unwrap();
        assert!(refused.is_none());
    }

    #[tokio::test]
    async fn stops_accepting_after_shutdown() {
        let (addr, stop) = start(ServerConfig::default()).await;
        stop.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
