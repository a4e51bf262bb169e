use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::protocol::wire::RpcMessage;

/// Datagrams are small; this comfortably holds any message the protocol
/// emits while satisfying the 1 KiB receive floor.
const RECV_BUFFER: usize = 1024;

/// The sending half of the node's network seam.
///
/// Inbound traffic arrives as `(RpcMessage, SocketAddr)` pairs on the
/// channel handed to the implementation's receive loop; the protocol layer
/// never touches sockets directly, which keeps it drivable from tests.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, addr: SocketAddr, message: &RpcMessage) -> Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

/// JSON datagrams over a tokio UDP socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Spawn the receive loop, forwarding well-formed datagrams to `tx`.
    ///
    /// Malformed datagrams are logged and dropped; they never terminate the
    /// loop. The task exits when the receiving side goes away.
    pub fn spawn_recv_loop(&self, tx: mpsc::Sender<(RpcMessage, SocketAddr)>) {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUFFER];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => match serde_json::from_slice::<RpcMessage>(&buf[..len]) {
                        Ok(message) => {
                            if tx.send((message, src)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("discarding malformed datagram from {src}: {e}"),
                    },
                    Err(e) => warn!("udp receive error: {e}"),
                }
            }
        });
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, addr: SocketAddr, message: &RpcMessage) -> Result<()> {
        let bytes = serde_json::to_vec(message)?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
