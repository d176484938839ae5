//! Cluster join subsystem.
//!
//! # Data Flow
//! ```text
//! JoinSpec (per enabled role)
//!     → discover.rs (descriptor → concrete addresses)
//!     → join fn injected by the role's subsystem
//!     → retry.rs (attempt / sleep / attempt ...)
//!     → success: task exits
//!     → exhausted: role pushed onto the fatal channel
//! ```
//!
//! # Design Decisions
//! - Success means the join returned no error; zero peers still counts
//! - A failed resolution is a failed attempt, not an abort
//! - One coordinator per role, launched after the role is serving

pub mod discover;
pub mod retry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;

pub use discover::{Discover, DiscoveryProvider, Resolver};
pub use retry::{JoinOutcome, RetryJoiner};

/// Agent role a join belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to join and how persistently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSpec {
    pub role: Role,
    /// Address literals or `provider=...` discovery descriptors.
    pub addresses: Vec<String>,
    /// 0 retries forever.
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("no addresses to join")]
    NoAddresses,

    #[error("invalid discovery descriptor {descriptor:?}: {reason}")]
    Descriptor { descriptor: String, reason: String },

    #[error("unknown discovery provider {0:?}")]
    UnknownProvider(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("failed to reach {address}: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("join rejected: {0}")]
    Rejected(String),
}

/// The role-specific join operation: addresses in, peers contacted out.
pub type JoinFn =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<usize, JoinError>> + Send + Sync>;
