use anyhow::Result;
use async_trait::async_trait;

/// Raw transport primitive driven by a [`ResilientConnection`](super::ResilientConnection).
///
/// Implementations only know how to open one link; reconnection, buffering
/// and failure accounting live in the connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new link to `endpoint`
    async fn connect(&self, endpoint: &str) -> Result<Link>;
}

/// Outbound half of a link
#[async_trait]
pub trait LinkSender: Send {
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Inbound half of a link
#[async_trait]
pub trait LinkReceiver: Send {
    /// Next inbound message, `Ok(None)` once the peer has closed the link
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

/// An established link, split so that sending never waits on receiving
pub struct Link {
    pub sender: Box<dyn LinkSender>,
    pub receiver: Box<dyn LinkReceiver>,
}

impl Link {
    pub fn new(sender: impl LinkSender + 'static, receiver: impl LinkReceiver + 'static) -> Self {
        Self {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
        }
    }
}

/// Receiver for links that never deliver inbound traffic
pub struct SilentReceiver;

#[async_trait]
impl LinkReceiver for SilentReceiver {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        futures::future::pending().await
    }
}
