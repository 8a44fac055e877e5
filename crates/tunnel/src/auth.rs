//! The one-shot credential exchange run on a freshly connected substrate,
//! before any fabric exists: the client sends AUTH, the server answers
//! RESULT, and either side abandons the substrate on failure or timeout.

use std::collections::HashMap;

use futures::{SinkExt, TryStreamExt};
use tokio_util::codec::Framed;

use crate::dialer::ByteStream;
use crate::frame::{Auth, Errno, Frame, FrameCodec, FrameType};
use crate::{Error, TunnelConfig};

/// Username/password table. An empty table accepts everyone.
#[derive(Debug, Default)]
pub struct Authenticator {
    users: HashMap<String, String>,
}

impl Authenticator {
    pub fn open() -> Authenticator {
        Authenticator::default()
    }

    pub fn new(users: HashMap<String, String>) -> Authenticator {
        Authenticator { users }
    }

    pub fn auth_pass(&self, username: &str, password: &str) -> bool {
        if self.users.is_empty() {
            return true;
        }
        self.users.get(username).map(String::as_str) == Some(password)
    }
}

/// Server side: read exactly one frame, which must be AUTH, check it, and
/// reply. The whole exchange is bounded by `auth_timeout`; expiry abandons
/// the substrate without a reply.
pub async fn server_handshake(
    framed: &mut Framed<Box<dyn ByteStream>, FrameCodec>,
    auth: &Authenticator,
    cfg: &TunnelConfig,
) -> Result<(), Error> {
    tokio::time::timeout(cfg.auth_timeout, server_exchange(framed, auth))
        .await
        .map_err(|_| Error::AuthTimeout)?
}

async fn server_exchange(
    framed: &mut Framed<Box<dyn ByteStream>, FrameCodec>,
    auth: &Authenticator,
) -> Result<(), Error> {
    let frame = framed.try_next().await?.ok_or(Error::Closed)?;
    if frame.frame_type != FrameType::Auth {
        return Err(Error::UnexpectedFrame(frame.frame_type));
    }
    let creds = frame.decode_auth()?;

    if !auth.auth_pass(&creds.username, &creds.password) {
        tracing::info!(username = %creds.username, "auth rejected");
        framed
            .send(Frame::result(frame.streamid, Errno::Auth))
            .await?;
        return Err(Error::AuthFailed);
    }

    framed
        .send(Frame::result(frame.streamid, Errno::None))
        .await?;
    tracing::debug!(username = %creds.username, "auth passed");
    Ok(())
}

/// Client side: send AUTH, read one RESULT. Anything but RESULT(NONE)
/// within the timeout fails the substrate.
pub async fn client_handshake(
    framed: &mut Framed<Box<dyn ByteStream>, FrameCodec>,
    username: &str,
    password: &str,
    cfg: &TunnelConfig,
) -> Result<(), Error> {
    tokio::time::timeout(
        cfg.auth_timeout,
        client_exchange(framed, username, password),
    )
    .await
    .map_err(|_| Error::AuthTimeout)?
}

async fn client_exchange(
    framed: &mut Framed<Box<dyn ByteStream>, FrameCodec>,
    username: &str,
    password: &str,
) -> Result<(), Error> {
    let auth = Auth {
        username: username.to_string(),
        password: password.to_string(),
    };
    framed.send(Frame::auth(0, &auth)?).await?;

    let frame = framed.try_next().await?.ok_or(Error::Closed)?;
    if frame.frame_type != FrameType::Result {
        return Err(Error::UnexpectedFrame(frame.frame_type));
    }
    match frame.decode_result()? {
        Errno::None => Ok(()),
        errno => {
            tracing::warn!(?errno, "auth refused by server");
            Err(Error::AuthFailed)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_table_accepts_all() {
        let auth = Authenticator::open();
        assert!(auth.auth_pass("anyone", "anything"));
    }

    #[test]
    fn test_table_checks_exact_pair() {
        let auth = Authenticator::new(HashMap::from([(
            "alice".to_string(),
            "secret".to_string(),
        )]));
        assert!(auth.auth_pass("alice", "secret"));
        assert!(!auth.auth_pass("alice", "wrong"));
        assert!(!auth.auth_pass("bob", "secret"));
    }
}
