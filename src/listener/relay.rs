//! PQC relay responder
//!
//! Reads sealed relay frames, opens them with the secret negotiated with the
//! connecting peer and forwards each payload to the destination carried
//! inside the frame. One upstream connection is opened per destination and
//! reused for the rest of the relay connection.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

use super::{ConnectionHandler, ConnectionSession};
use crate::config::QuantdogConfig;
use crate::error::{Error, Result};
use crate::relay::{self, RelayFrame};
use crate::secrets::SecretStore;

/// Bytes of each payload shown in trace logs
const TRACE_PREVIEW_LEN: usize = 32;

pub struct PqcRelayResponder {
    store: Arc<SecretStore>,
    io_timeout: Duration,
    forward_connect_timeout: Duration,
    max_frame_len: usize,
}

impl PqcRelayResponder {
    pub fn new(store: Arc<SecretStore>) -> Self {
        Self {
            store,
            io_timeout: Duration::from_secs(30),
            forward_connect_timeout: Duration::from_secs(5),
            max_frame_len: 65536,
        }
    }

    pub fn from_config(config: &QuantdogConfig, store: Arc<SecretStore>) -> Self {
        Self {
            store,
            io_timeout: config.io_timeout(),
            forward_connect_timeout: config.forward_connect_timeout(),
            max_frame_len: config.listener.max_frame_len,
        }
    }

    async fn upstream<'a>(
        &self,
        upstreams: &'a mut HashMap<SocketAddrV4, TcpStream>,
        destination: SocketAddrV4,
    ) -> Result<&'a mut TcpStream> {
        if !upstreams.contains_key(&destination) {
            let stream = match timeout(self.forward_connect_timeout, TcpStream::connect(destination)).await {
                Ok(stream) => stream?,
                Err(_) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connect to {} timed out", destination),
                    )))
                }
            };
            let _ = stream.set_nodelay(true);
            debug!("Forwarding to {}", destination);
            upstreams.insert(destination, stream);
        }
        upstreams
            .get_mut(&destination)
            .ok_or_else(|| Error::Frame(format!("no upstream for {}", destination)))
    }
}

#[async_trait]
impl ConnectionHandler for PqcRelayResponder {
    async fn handle(&self, session: ConnectionSession) -> Result<()> {
        let peer = session.peer();
        let mut frames = FramedRead::new(session.stream, relay::codec(self.max_frame_len));
        let mut upstreams: HashMap<SocketAddrV4, TcpStream> = HashMap::new();

        let result = self.relay_frames(peer, &mut frames, &mut upstreams).await;

        for (destination, mut stream) in upstreams {
            if let Err(e) = stream.shutdown().await {
                warn!("Closing upstream {} failed: {}", destination, e);
            }
        }
        result
    }
}

impl PqcRelayResponder {
    async fn relay_frames(
        &self,
        peer: IpAddr,
        frames: &mut FramedRead<TcpStream, LengthDelimitedCodec>,
        upstreams: &mut HashMap<SocketAddrV4, TcpStream>,
    ) -> Result<()> {
        let mut relayed = 0usize;
        loop {
            let sealed = match timeout(self.io_timeout, frames.next()).await {
                Ok(Some(Ok(sealed))) => sealed,
                Ok(Some(Err(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                    return Err(Error::Frame(e.to_string()))
                }
                Ok(Some(Err(e))) => return Err(Error::Io(e)),
                Ok(None) => break,
                Err(_) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no frame within {:?}", self.io_timeout),
                    )))
                }
            };

            // Looked up per frame so a renegotiated secret takes effect
            let secret = self.store.get(&peer).ok_or(Error::SecretNotFound(peer))?;
            let frame = RelayFrame::open(&sealed, &secret)?;
            trace!(
                "Frame for {}: {}",
                frame.destination,
                hex::encode(&frame.payload[..frame.payload.len().min(TRACE_PREVIEW_LEN)])
            );

            let upstream = self.upstream(upstreams, frame.destination).await?;
            upstream.write_all(&frame.payload).await?;
            relayed += 1;
        }

        debug!("Relayed {} frame(s) from {}", relayed, peer);
        Ok(())
    }
}
