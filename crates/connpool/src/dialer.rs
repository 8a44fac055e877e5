//! The pool's dialing policy: pick the least-loaded session, and grow the
//! pool when every session is busy or the floor is not met. Creation is
//! serialized and re-checks its precondition under the lock, so concurrent
//! `get()` callers cannot stampede the endpoints.

use std::io;
use std::sync::{Arc, RwLock};

use rand::Rng;
use tunnel::{ByteStream, Conn, NetDialer, Session, TunnelConfig};

use crate::endpoint::Endpoint;
use crate::pool::Pool;
use crate::Error;

/// Pool sizing knobs. Zeroes fall back to the defaults.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of sessions kept in the pool.
    pub min_sess: usize,
    /// Soft ceiling of streams per session before the pool grows.
    pub max_conn: usize,
    /// Sweep multiplier: a creation attempts `dial_retry * endpoints` dials.
    pub dial_retry: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_sess: 1,
            max_conn: 32,
            dial_retry: 2,
        }
    }
}

/// Shared handle to the pool and its creation policy. Clones are cheap and
/// refer to the same pool.
#[derive(Clone)]
pub struct Dialer {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Pool,
    min_sess: usize,
    max_conn: usize,
    dial_retry: usize,
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    // Serializes session creation; predicates re-check under this lock.
    create_lock: tokio::sync::Mutex<()>,
    cfg: Arc<TunnelConfig>,
}

impl Dialer {
    pub fn new(pool_cfg: PoolConfig, cfg: Arc<TunnelConfig>) -> Dialer {
        let defaults = PoolConfig::default();
        Dialer {
            inner: Arc::new(Inner {
                pool: Pool::new(),
                min_sess: if pool_cfg.min_sess == 0 {
                    defaults.min_sess
                } else {
                    pool_cfg.min_sess
                },
                max_conn: if pool_cfg.max_conn == 0 {
                    defaults.max_conn
                } else {
                    pool_cfg.max_conn
                },
                dial_retry: if pool_cfg.dial_retry == 0 {
                    defaults.dial_retry
                } else {
                    pool_cfg.dial_retry
                },
                endpoints: RwLock::new(Vec::new()),
                create_lock: tokio::sync::Mutex::new(()),
                cfg,
            }),
        }
    }

    pub fn add_endpoint(&self, endpoint: Endpoint) {
        self.inner.endpoints.write().unwrap().push(Arc::new(endpoint));
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// Select a session, creating or growing the pool as the policy asks.
    pub async fn get(&self) -> Result<Session, Error> {
        if self.inner.pool.is_empty() {
            self.create_session(|dialer| dialer.inner.pool.is_empty())
                .await?;
        }

        let Some((session, load)) = self.inner.pool.least_loaded() else {
            return Err(Error::NoSession);
        };

        if load > self.inner.max_conn || self.inner.pool.len() < self.inner.min_sess {
            // Grow in the background; the predicate re-check under the
            // creation lock keeps concurrent callers from over-creating.
            let dialer = self.clone();
            tokio::spawn(async move {
                let result = dialer
                    .create_session(|dialer| {
                        if dialer.inner.pool.len() < dialer.inner.min_sess {
                            return true;
                        }
                        match dialer.inner.pool.least_loaded() {
                            Some((_, load)) => load > dialer.inner.max_conn,
                            None => true,
                        }
                    })
                    .await;
                if let Err(err) = result {
                    tracing::warn!(%err, "background session creation failed");
                }
            });
        }

        Ok(session)
    }

    /// Create one session if `predicate` still holds under the creation
    /// lock. Endpoints are swept circularly from a random offset; the first
    /// success wins.
    async fn create_session(&self, predicate: impl Fn(&Dialer) -> bool) -> Result<(), Error> {
        let _guard = self.inner.create_lock.lock().await;
        if !predicate(self) {
            return Ok(());
        }

        let endpoints: Vec<Arc<Endpoint>> = self.inner.endpoints.read().unwrap().clone();
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }

        let start = rand::thread_rng().gen_range(0..endpoints.len());
        let attempts = self.inner.dial_retry * endpoints.len();

        for i in 0..attempts {
            let endpoint = &endpoints[(start + i) % endpoints.len()];
            match endpoint.create(self.inner.cfg.clone()).await {
                Ok(session) => {
                    tracing::info!(peer = %session.peer_addr(), "session created");
                    self.inner.pool.add(session.clone());

                    // Deregister when the fabric dies, however it dies.
                    let dialer = self.clone();
                    tokio::spawn(async move {
                        session.closed().await;
                        tracing::warn!(peer = %session.peer_addr(), "session quit");
                        let _ = dialer.inner.pool.remove(&session);
                    });
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(endpoint = %endpoint.address(), %err, "endpoint failed");
                }
            }
        }

        tracing::error!("can't connect to any server");
        Err(Error::NoReachableServer)
    }

    /// Open a tunneled stream to `(network, address)` through the pool.
    pub async fn dial(&self, network: &str, address: &str) -> Result<Conn, Error> {
        let session = self.get().await?;
        Ok(session.dial(network, address).await?)
    }
}

/// The pool is itself an endpoint dialer, so front-ends compose over it
/// the same way they would over a plain TCP dialer.
#[async_trait::async_trait]
impl NetDialer for Dialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<Box<dyn ByteStream>> {
        let conn = Dialer::dial(self, network, address)
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        Ok(Box::new(conn))
    }
}
