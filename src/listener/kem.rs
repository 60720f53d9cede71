//! KEM responder
//!
//! Answers one handshake per connection and stores the resulting secret
//! under the connecting peer's address.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::info;

use super::{ConnectionHandler, ConnectionSession};
use crate::config::QuantdogConfig;
use crate::error::{Error, Result};
use crate::handshake;
use crate::secrets::SecretStore;

pub struct KemResponder {
    store: Arc<SecretStore>,
    io_timeout: Duration,
}

impl KemResponder {
    pub fn new(store: Arc<SecretStore>, io_timeout: Duration) -> Self {
        Self { store, io_timeout }
    }

    pub fn from_config(config: &QuantdogConfig, store: Arc<SecretStore>) -> Self {
        Self::new(store, config.io_timeout())
    }
}

#[async_trait]
impl ConnectionHandler for KemResponder {
    async fn handle(&self, mut session: ConnectionSession) -> Result<()> {
        let peer = session.peer();
        let secret = match timeout(
            self.io_timeout,
            handshake::respond(&mut session.stream, peer, &self.store),
        )
        .await
        {
            Ok(result) => result.map_err(|source| Error::Handshake { peer, source })?,
            Err(_) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no complete handshake within {:?}", self.io_timeout),
                )))
            }
        };

        info!(
            "Responded to {} handshake from {} (session {})",
            secret.algorithm(),
            peer,
            secret.session_id()
        );
        Ok(())
    }
}
