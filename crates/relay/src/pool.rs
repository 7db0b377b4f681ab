//! Bounded browser pool.
//!
//! A semaphore caps how many Chromium processes run at once. Leases tie a
//! browser context to its permit so capacity is returned exactly when the
//! context goes away. Draining acquires every permit, which both blocks
//! new launches and waits out sessions already holding one.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::info;

use pagebridge_core::{config::BrowserConfig, Error, Result};

use crate::browser::BrowserContext;

pub struct BrowserPool {
    config: BrowserConfig,
    data_root: PathBuf,
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// A live browser context plus the pool permit that admitted it.
pub struct ContextLease {
    context: BrowserContext,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl ContextLease {
    pub fn context(&self) -> &BrowserContext {
        &self.context
    }

    /// Shut the browser down and release the permit.
    pub async fn close(self) {
        self.context.close().await;
    }
}

impl BrowserPool {
    pub fn new(config: BrowserConfig, data_root: PathBuf) -> Self {
        let capacity = config.max_concurrency.max(1);
        Self {
            config,
            data_root,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Launch a browser for `user_id`, waiting for pool capacity first.
    /// Fails once the pool has been drained.
    pub async fn acquire(&self, user_id: &str) -> Result<ContextLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Browser("pool is shut down".to_string()))?;

        // Unique dir per launch keeps stale profile locks from a crashed
        // run out of the way and isolates concurrent users.
        let data_dir = self
            .data_root
            .join(format!("{}-{}", sanitize(user_id), uuid::Uuid::new_v4()));
        let context = BrowserContext::launch(&self.config, &data_dir).await?;
        Ok(ContextLease {
            context,
            _permit: permit,
        })
    }

    /// True when at least one lease is outstanding.
    pub fn has_active(&self) -> bool {
        self.permits.available_permits() < self.capacity
    }

    /// Wait for all outstanding leases to be released, then refuse any
    /// further acquisitions.
    pub async fn drain_and_close(&self) -> Result<()> {
        info!(capacity = self.capacity, "draining browser pool");
        let _all = self
            .permits
            .acquire_many(self.capacity as u32)
            .await
            .map_err(|_| Error::Browser("pool already closed".to_string()))?;
        self.permits.close();
        info!("browser pool closed");
        Ok(())
    }
}

fn sanitize(user_id: &str) -> String {
    user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(capacity: usize) -> BrowserPool {
        let config = BrowserConfig {
            max_concurrency: capacity,
            ..Default::default()
        };
        BrowserPool::new(config, std::env::temp_dir())
    }

    #[test]
    fn test_capacity_floor_is_one() {
        let pool = test_pool(0);
        assert_eq!(pool.capacity, 1);
    }

    #[tokio::test]
    async fn test_drain_closes_pool_to_new_acquires() {
        let pool = test_pool(2);
        pool.drain_and_close().await.unwrap();
        assert!(pool.acquire("u1").await.is_err());
    }

    #[tokio::test]
    async fn test_drain_waits_for_outstanding_permit() {
        let pool = Arc::new(test_pool(2));
        let held = pool.permits.clone().acquire_owned().await.unwrap();
        assert!(pool.has_active());

        let drainer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.drain_and_close().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!drainer.is_finished());

        drop(held);
        drainer.await.unwrap().unwrap();
    }

    #[test]
    fn test_sanitize_user_id() {
        assert_eq!(sanitize("123456789"), "123456789");
        assert_eq!(sanitize("a/b:c"), "a_b_c");
    }
}
