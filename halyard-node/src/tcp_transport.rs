use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use halyard_core::peer::unreachable;
use halyard_core::{NodeId, PeerHandler, PeerRequest, PeerResponse, PeerTransport, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, trace, warn};

use crate::wire::{read_frame, write_frame, Envelope};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IDLE_PER_PEER: usize = 4;

/// Outbound peer calls over TCP.
///
/// Connections are pooled per peer; each carries one request at a time, so a
/// long-poll never delays other traffic to the same peer.
#[derive(Debug)]
pub struct TcpTransport {
    me: NodeId,
    addrs: HashMap<NodeId, SocketAddr>,
    idle: DashMap<NodeId, Arc<Mutex<Vec<TcpStream>>>>,
}

impl TcpTransport {
    pub fn new(me: impl Into<NodeId>, addrs: HashMap<NodeId, SocketAddr>) -> Self {
        Self {
            me: me.into(),
            addrs,
            idle: DashMap::new(),
        }
    }

    fn pool(&self, to: &str) -> Arc<Mutex<Vec<TcpStream>>> {
        Arc::clone(self.idle.entry(to.to_string()).or_default().value())
    }

    async fn connect(&self, to: &str) -> Result<TcpStream> {
        let Some(addr) = self.addrs.get(to) else {
            return Err(unreachable(to, "no address configured"));
        };
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                trace!(target = "peer", from = %self.me, to, addr = %addr, "connected");
                Ok(stream)
            }
            Ok(Err(e)) => Err(unreachable(to, e)),
            Err(_) => Err(unreachable(to, "connect timed out")),
        }
    }

    async fn exchange(&self, stream: &mut TcpStream, request: PeerRequest) -> Result<PeerResponse> {
        let env = Envelope {
            from: self.me.clone(),
            request,
        };
        write_frame(stream, &env).await?;
        match read_frame(stream).await? {
            Some(resp) => Ok(resp),
            None => Err(halyard_core::StoreError::Transport("connection closed by peer".to_string())),
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn call(&self, to: &str, request: PeerRequest) -> Result<PeerResponse> {
        let pool = self.pool(to);
        let pooled = pool.lock().await.pop();
        let mut stream = match pooled {
            Some(stream) => stream,
            None => self.connect(to).await?,
        };
        // a broken stream is dropped; the next call reconnects
        let resp = self.exchange(&mut stream, request).await?;
        let mut idle = pool.lock().await;
        if idle.len() < IDLE_PER_PEER {
            idle.push(stream);
        }
        Ok(resp)
    }
}

/// Accepts peer connections and hands every request to the node's handler.
pub struct PeerServer {
    listener: TcpListener,
    handler: Arc<dyn PeerHandler>,
}

impl PeerServer {
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn PeerHandler>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` flips to true.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(target = "peer", addr = %addr, "peer server listening");
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let _ = stream.set_nodelay(true);
                        let handler = Arc::clone(&self.handler);
                        tokio::spawn(serve_connection(stream, remote, handler));
                    }
                    Err(e) => {
                        warn!(target = "peer", error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
        debug!(target = "peer", "peer server stopped");
    }
}

async fn serve_connection(mut stream: TcpStream, remote: SocketAddr, handler: Arc<dyn PeerHandler>) {
    loop {
        let env: Envelope = match read_frame(&mut stream).await {
            Ok(Some(env)) => env,
            Ok(None) => break,
            Err(e) => {
                debug!(target = "peer", remote = %remote, error = %e, "dropping peer connection");
                break;
            }
        };
        let resp = handler.handle(&env.from, env.request).await;
        if let Err(e) = write_frame(&mut stream, &resp).await {
            debug!(target = "peer", remote = %remote, error = %e, "reply failed");
            break;
        }
    }
}
