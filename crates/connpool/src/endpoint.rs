//! An upstream server the pool may anchor a session on.

use std::sync::Arc;

use tokio_util::codec::Framed;
use tunnel::fabric::Role;
use tunnel::frame::FrameCodec;
use tunnel::{auth, Fabric, NetDialer, Session, TunnelConfig};

use crate::Error;

/// `(dialer, address, credentials)` — everything needed to stand up one
/// authenticated session.
pub struct Endpoint {
    dialer: Arc<dyn NetDialer>,
    address: String,
    username: String,
    password: String,
}

impl Endpoint {
    pub fn new(
        dialer: Arc<dyn NetDialer>,
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Endpoint {
        Endpoint {
            dialer,
            address: address.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Dial, authenticate, and spawn a client fabric on the substrate.
    pub(crate) async fn create(&self, cfg: Arc<TunnelConfig>) -> Result<Session, Error> {
        tracing::debug!(address = %self.address, "connecting endpoint");

        let stream = self
            .dialer
            .dial_timeout("tcp", &self.address, cfg.dial_timeout)
            .await?;

        let mut framed = Framed::new(stream, FrameCodec);
        auth::client_handshake(&mut framed, &self.username, &self.password, &cfg).await?;

        let session = Fabric::spawn(framed, Role::Client, cfg)?;
        tracing::debug!(address = %self.address, "auth passed, session up");
        Ok(session)
    }
}
