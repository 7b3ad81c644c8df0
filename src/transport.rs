//! # UDP Transport
//!
//! Plain tokio UDP socket behind the [`Transport`] trait.
//!
//! ```text
//! Transport::send ──encode──► mpsc (bounded) ──► writer task ──► send_to
//!
//! recv_from ──► receive task ──► DhtNode::incoming_datagram
//! ```
//!
//! `send` only encodes and enqueues, so it is safe to call from synchronous
//! code paths. A full queue drops the datagram with an error instead of
//! blocking the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::messages::{self, MAX_DATAGRAM_SIZE, Message};
use crate::node::DhtNode;
use crate::protocols::Transport;

/// Datagrams waiting for the writer task.
const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    outbound: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    writer: AbortHandle,
}

impl UdpTransport {
    /// Bind `addr` and start the writer task.
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr().context("failed to read local address")?;

        let (outbound, mut queue) = mpsc::channel::<(SocketAddr, Vec<u8>)>(OUTBOUND_QUEUE_CAPACITY);
        let writer_socket = socket.clone();
        let writer = tokio::spawn(async move {
            while let Some((to, bytes)) = queue.recv().await {
                if let Err(e) = writer_socket.send_to(&bytes, to).await {
                    warn!(%to, error = %e, "failed to send datagram");
                }
            }
        })
        .abort_handle();

        Ok(Arc::new(Self {
            socket,
            local,
            outbound,
            writer,
        }))
    }

    /// Feed every received datagram to `node` until aborted.
    pub fn serve(&self, node: DhtNode) -> AbortHandle {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        trace!(%from, len, "datagram received");
                        node.incoming_datagram(from, &buf[..len]);
                    }
                    // ICMP unreachable surfaces here on some platforms.
                    Err(e) => debug!(error = %e, "receive failed"),
                }
            }
        })
        .abort_handle()
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: SocketAddr, message: Message) -> Result<()> {
        let bytes = messages::encode(&message).context("failed to encode message")?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            bail!("encoded message of {} bytes exceeds datagram limit", bytes.len());
        }
        self.outbound
            .try_send((to, bytes))
            .map_err(|e| anyhow!("outbound queue unavailable: {e}"))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}
