//! Listen-mode transport
//!
//! For peripherals that dial us instead of the other way round. The transport
//! accepts one peer at a time and treats everything that arrives until the
//! line has been quiet for `quiet_ms` as one message. Then the peer is closed
//! and the listener accepts the next one. Those closures are routine, so the
//! transport advertises transient disconnects.

use super::{
    DeviceDescriptor, EventSink, Transport, TransportCapabilities, TransportError, TransportKind,
};
use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Listen transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Address to bind when the device carries none
    pub bind: String,
    /// Silence after the last chunk that completes a message
    pub quiet_ms: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:4352".to_string(),
            quiet_ms: 500,
        }
    }
}

/// Accept-one-message listen transport
pub struct ListenTransport {
    config: ListenConfig,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    reader: Option<CancellationToken>,
}

impl ListenTransport {
    pub fn new(config: ListenConfig) -> Self {
        Self {
            config,
            listener: None,
            local_addr: None,
            reader: None,
        }
    }

    /// Address actually bound, once connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Descriptor for listening on `bind`
    pub fn device_for(bind: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(format!("listen:{bind}"), TransportKind::Listen)
            .with_name("Incoming connections")
            .with_address(bind)
    }
}

#[async_trait]
impl Transport for ListenTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Listen
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::LISTEN
    }

    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), TransportError> {
        let bind = device.address.as_deref().unwrap_or(&self.config.bind);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("bind {bind}: {e}")))?;

        self.local_addr = listener.local_addr().ok();
        info!(addr = ?self.local_addr, "Listening for peripheral");
        self.listener = Some(listener);
        Ok(())
    }

    async fn send(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("listen transport is receive-only"))
    }

    async fn begin_receiving(&mut self, sink: EventSink) -> Result<(), TransportError> {
        let listener = self.listener.take().ok_or(TransportError::NotConnected)?;
        let cancel = CancellationToken::new();
        let quiet = Duration::from_millis(self.config.quiet_ms);

        tokio::spawn(accept_loop(listener, quiet, sink, cancel.clone()));
        self.reader = Some(cancel);
        Ok(())
    }

    fn end_receiving(&mut self) {
        if let Some(cancel) = self.reader.take() {
            cancel.cancel();
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.end_receiving();
        self.listener = None;
        self.local_addr = None;
        Ok(())
    }

    async fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(vec![Self::device_for(&self.config.bind)])
    }
}

async fn accept_loop(
    listener: TcpListener,
    quiet: Duration,
    sink: EventSink,
    cancel: CancellationToken,
) {
    loop {
        let (peer, addr) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    sink.error(TransportError::IoError(e));
                    continue;
                }
            },
        };

        debug!(%addr, "Peer connected");
        if !receive_message(peer, quiet, &sink, &cancel).await {
            break;
        }
        debug!(%addr, "Message complete, accepting next peer");
        sink.disconnected();
    }
}

/// Forward chunks until the peer goes quiet or closes. `false` on cancel.
async fn receive_message(
    mut peer: TcpStream,
    quiet: Duration,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> bool {
    let mut buf = BytesMut::with_capacity(4096);
    let mut received = false;

    loop {
        buf.clear();
        let read = tokio::select! {
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(quiet), if received => return true,
            read = peer.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => return true,
            Ok(_) => {
                received = true;
                sink.data(buf.split().freeze());
            }
            Err(e) => {
                sink.error(TransportError::IoError(e));
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::TransportEvent;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_accepts_one_message_per_peer() {
        let mut transport = ListenTransport::new(ListenConfig {
            bind: "127.0.0.1:0".to_string(),
            quiet_ms: 50,
        });
        let device = ListenTransport::device_for("127.0.0.1:0");
        transport.connect(&device).await.unwrap();
        let addr = transport.local_addr().unwrap();

        let (sink, mut rx) = EventSink::pair(1);
        transport.begin_receiving(sink).await.unwrap();

        for message in [&b"first"[..], &b"second"[..]] {
            let mut peer = TcpStream::connect(addr).await.unwrap();
            peer.write_all(message).await.unwrap();

            let mut collected = Vec::new();
            loop {
                match rx.recv().await.unwrap().event {
                    TransportEvent::Data(bytes) => collected.extend_from_slice(&bytes),
                    TransportEvent::Disconnected => break,
                    TransportEvent::Error(e) => panic!("unexpected error: {e}"),
                }
            }
            assert_eq!(collected, message);
        }

        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_is_receive_only() {
        let mut transport = ListenTransport::new(ListenConfig::default());
        assert!(transport.capabilities().reports_transient_disconnects);
        assert!(matches!(
            transport.send(b"x").await,
            Err(TransportError::Unsupported(_))
        ));
        let devices = transport.enumerate_devices().await.unwrap();
        assert_eq!(devices[0].address.as_deref(), Some("0.0.0.0:4352"));
    }
}
