//! Networking layer: transport seam, sessions, and the session pool.

pub mod pool;
pub mod session;
pub mod transport;

pub use pool::{PooledSession, SessionPool};
pub use session::{BrowserIdentity, SAFE_COOKIE, Session};
pub use transport::{
    PageTransport, RawPage, ReqwestSessionFactory, ReqwestTransport, SessionFactory,
    TransportError,
};
