use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};
use zeromq::{PullSocket, PushSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use super::transport::{Link, LinkReceiver, LinkSender, SilentReceiver, Transport};

/// Configuration for the ZeroMQ transport
#[derive(Debug, Clone)]
pub struct ZmqTransportConfig {
    /// Endpoint the service pushes replies to (e.g. "tcp://127.0.0.1:5556")
    pub reply_endpoint: Option<String>,
    /// Socket connect timeout
    pub connect_timeout: Duration,
}

impl Default for ZmqTransportConfig {
    fn default() -> Self {
        Self {
            reply_endpoint: None,
            connect_timeout: Duration::from_millis(5000),
        }
    }
}

/// ZeroMQ transport using a PUSH socket toward the transcription service
/// and an optional PULL socket for its replies
#[derive(Debug, Clone, Default)]
pub struct ZmqTransport {
    config: ZmqTransportConfig,
}

impl ZmqTransport {
    pub fn new(config: ZmqTransportConfig) -> Self {
        Self { config }
    }

    /// Transport that also pulls replies from `reply_endpoint`
    pub fn with_reply_endpoint(reply_endpoint: impl Into<String>) -> Self {
        Self::new(ZmqTransportConfig {
            reply_endpoint: Some(reply_endpoint.into()),
            ..Default::default()
        })
    }

    pub fn config(&self) -> &ZmqTransportConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for ZmqTransport {
    async fn connect(&self, endpoint: &str) -> Result<Link> {
        let mut push_socket = PushSocket::new();
        tokio::time::timeout(self.config.connect_timeout, push_socket.connect(endpoint))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout connecting push socket"))?
            .with_context(|| format!("Failed to connect push socket to {}", endpoint))?;

        let sender = ZmqSender { socket: push_socket };

        let Some(reply_endpoint) = self.config.reply_endpoint.as_deref() else {
            info!("Connected to ZeroMQ endpoint {}", endpoint);
            return Ok(Link::new(sender, SilentReceiver));
        };

        let mut pull_socket = PullSocket::new();
        tokio::time::timeout(self.config.connect_timeout, pull_socket.connect(reply_endpoint))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout connecting pull socket"))?
            .with_context(|| format!("Failed to connect pull socket to {}", reply_endpoint))?;

        info!(
            "Connected to ZeroMQ endpoints: push={}, pull={}",
            endpoint, reply_endpoint
        );
        Ok(Link::new(sender, ZmqReceiver { socket: pull_socket }))
    }
}

struct ZmqSender {
    socket: PushSocket,
}

#[async_trait]
impl LinkSender for ZmqSender {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let message = ZmqMessage::from(payload.to_vec());
        self.socket
            .send(message)
            .await
            .context("Failed to push message via ZeroMQ")
    }
}

struct ZmqReceiver {
    socket: PullSocket,
}

#[async_trait]
impl LinkReceiver for ZmqReceiver {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let message = self
            .socket
            .recv()
            .await
            .context("Failed to receive message from ZeroMQ")?;

        match message.get(0) {
            Some(frame) => Ok(Some(frame.to_vec())),
            None => {
                debug!("Received empty ZeroMQ message");
                Ok(Some(Vec::new()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zmq_transport_config_default() {
        let config = ZmqTransportConfig::default();
        assert!(config.reply_endpoint.is_none());
        assert_eq!(config.connect_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_with_reply_endpoint() {
        let transport = ZmqTransport::with_reply_endpoint("tcp://127.0.0.1:5556");
        assert_eq!(
            transport.config().reply_endpoint.as_deref(),
            Some("tcp://127.0.0.1:5556")
        );
    }

    #[tokio::test]
    async fn test_connect_without_service_fails() {
        let transport = ZmqTransport::new(ZmqTransportConfig {
            reply_endpoint: None,
            connect_timeout: Duration::from_millis(100),
        });

        // Nothing listens here, so the attempt must fail rather than hang
        let result = transport.connect("tcp://127.0.0.1:65011").await;
        assert!(result.is_err());
    }
}
