//! Rotating proxy front door
//!
//! Per-tenant listeners on a reserved port range. Each inbound connection
//! selects the next live upstream proxy and bridges bytes across protocols.

pub mod handler;
pub mod http3;
pub mod manager;
pub mod server;
pub mod socks;
pub mod tls;

pub use manager::ListenerManager;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::models::RotatorNext;
use crate::repository::RotatorRepository;

/// Selection contract between the listeners and the rotation selector:
/// the next alive upstream for `(user, rotator)`.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn next(&self, user_id: i64, rotator_id: i64) -> Result<RotatorNext>;
}

/// Database-backed source, one rotation per call
pub struct RepositorySource {
    repo: RotatorRepository,
}

impl RepositorySource {
    pub fn new(repo: RotatorRepository) -> Self {
        Self { repo }
    }

    pub fn shared(repo: RotatorRepository) -> Arc<dyn UpstreamSource> {
        Arc::new(Self::new(repo))
    }
}

#[async_trait]
impl UpstreamSource for RepositorySource {
    async fn next(&self, user_id: i64, rotator_id: i64) -> Result<RotatorNext> {
        self.repo.next_proxy(user_id, rotator_id).await
    }
}
