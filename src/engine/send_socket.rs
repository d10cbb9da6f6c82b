use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::protocol::frame::Frame;

/// This is an abstraction for sending a frame on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_frame(&self, to: SocketAddr, frame: Frame) -> anyhow::Result<()>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_frame(&self, to: SocketAddr, frame: Frame) -> anyhow::Result<()> {
        trace!("UDP socket: sending {:?} to {:?}", frame, to);
        self.send_to(&frame.to_bytes(), to).await?;
        Ok(())
    }
}
