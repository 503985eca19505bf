//! TCP front door: accepts sockets and runs one router per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use arbor_protocol::{Frame, FrameCodec};

use crate::router::Connection;
use crate::shared::BrokerShared;
use crate::BrokerResult;

/// Listening broker endpoint.
pub struct Server {
    shared: Arc<BrokerShared>,
    listener: TcpListener,
}

impl Server {
    /// Bind the listener; `addr` may use port 0 to pick a free port.
    pub async fn bind(addr: SocketAddr, shared: Arc<BrokerShared>) -> BrokerResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "broker listening");
        Ok(Self { shared, listener })
    }

    /// The actual bound address.
    pub fn local_addr(&self) -> BrokerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> BrokerResult<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                handle_connection(shared, stream, peer).await;
            });
        }
    }
}

/// Frame pump for one socket. Inbound frames are processed strictly in
/// arrival order; outbound frames drain from the connection's queue so
/// broadcasts never block on a slow reader's socket inline.
async fn handle_connection(shared: Arc<BrokerShared>, stream: TcpStream, peer: SocketAddr) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = %err, "failed to set nodelay");
    }
    let trusted = peer.ip().is_loopback();
    let (read_half, write_half) = stream.into_split();

    let (sender, mut outbound) = mpsc::unbounded_channel::<Frame>();
    let conn_id = shared.registry.insert(sender);
    let mut connection = Connection::new(Arc::clone(&shared), conn_id, trusted);
    debug!(conn = conn_id, %peer, "connection accepted");

    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(write_half, FrameCodec);
        while let Some(frame) = outbound.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut frames = FramedRead::new(read_half, FrameCodec);
    while let Some(next) = frames.next().await {
        match next {
            Ok(frame) => connection.on_frame(frame).await,
            Err(err) => {
                // Frame-level violation: close the socket, no response.
                warn!(conn = conn_id, %peer, error = %err, "protocol violation");
                break;
            }
        }
    }

    connection.close();
    writer.abort();
    debug!(conn = conn_id, %peer, "connection closed");
}
