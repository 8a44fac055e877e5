//! Client-side session management: a pool of live fabrics across one or
//! more upstream endpoints, an autoscaling policy driven by `MinSess` and
//! `MaxConn`, and a dialer façade that hands out tunneled streams.

mod dialer;
mod endpoint;
mod pool;

pub use dialer::{Dialer, PoolConfig};
pub use endpoint::Endpoint;
pub use pool::Pool;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sessions in pool but none can be picked")]
    NoSession,
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("session not found in pool")]
    SessionNotFound,
    #[error("no reachable server")]
    NoReachableServer,
    #[error(transparent)]
    Tunnel(#[from] tunnel::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
