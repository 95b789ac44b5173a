//! In-process lease pool for channel accounts
//!
//! Every free account is backed by one semaphore permit. Leasing takes a permit and an
//! address together; dropping the lease puts the address back before the permit, so a
//! woken waiter always finds an address.

use crate::{Result, SubmissionError};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Default)]
struct PoolState {
    free: VecDeque<String>,
    members: HashSet<String>,
}

/// Channel accounts available to this process
pub struct ChannelAccountPool {
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
}

impl Default for ChannelAccountPool {
    fn default() -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            permits: Arc::new(Semaphore::new(0)),
        }
    }
}

impl ChannelAccountPool {
    /// Create an empty pool
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a pool holding `addresses`
    pub fn with_accounts<I, S>(addresses: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self::new();
        for address in addresses {
            pool.add(address);
        }
        pool
    }

    /// Make an account available. Adding a known account is a no-op.
    pub fn add(&self, address: impl Into<String>) -> bool {
        let address = address.into();
        let mut state = self.state.lock();
        if !state.members.insert(address.clone()) {
            return false;
        }
        state.free.push_back(address);
        self.permits.add_permits(1);
        true
    }

    /// Wait for a free account and lease it
    pub async fn lease(self: &Arc<Self>) -> Result<ChannelAccountLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SubmissionError::NoChannelAccountsAvailable)?;
        self.take(permit)
    }

    /// Lease a free account if there is one right now
    pub fn try_lease(self: &Arc<Self>) -> Option<ChannelAccountLease> {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        self.take(permit).ok()
    }

    fn take(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Result<ChannelAccountLease> {
        let address = self
            .state
            .lock()
            .free
            .pop_front()
            .ok_or(SubmissionError::NoChannelAccountsAvailable)?;
        debug!(channel_account = %address, "Leased channel account");
        Ok(ChannelAccountLease {
            pool: self.clone(),
            address: Some(address),
            _permit: permit,
        })
    }

    /// Remove a free account so nothing can lease it again. Returns `false` when the
    /// account is not in the pool.
    pub fn take_for_removal(&self, address: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.members.contains(address) {
            return Ok(false);
        }

        let position = state
            .free
            .iter()
            .position(|a| a == address)
            .ok_or_else(|| SubmissionError::ChannelAccountInUse(address.to_string()))?;
        let permit = self
            .permits
            .try_acquire()
            .map_err(|_| SubmissionError::ChannelAccountInUse(address.to_string()))?;
        permit.forget();

        state.free.remove(position);
        state.members.remove(address);
        Ok(true)
    }

    /// Whether the account is managed by this pool
    pub fn contains(&self, address: &str) -> bool {
        self.state.lock().members.contains(address)
    }

    /// Accounts in the pool, leased or not
    pub fn size(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Accounts free to lease
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    fn release(&self, address: String) {
        let mut state = self.state.lock();
        if state.members.contains(&address) {
            state.free.push_back(address);
        }
    }
}

/// Exclusive use of one channel account, released on drop
pub struct ChannelAccountLease {
    pool: Arc<ChannelAccountPool>,
    address: Option<String>,
    _permit: OwnedSemaphorePermit,
}

impl ChannelAccountLease {
    /// Leased address
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or_default()
    }
}

impl Drop for ChannelAccountLease {
    fn drop(&mut self) {
        if let Some(address) = self.address.take() {
            debug!(channel_account = %address, "Released channel account");
            self.pool.release(address);
        }
    }
}

impl std::fmt::Debug for ChannelAccountLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAccountLease")
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_leased_account_is_invisible_until_released() {
        let pool = ChannelAccountPool::with_accounts(["a", "b"]);

        let first = pool.lease().await.unwrap();
        let second = pool.lease().await.unwrap();
        assert_ne!(first.address(), second.address());
        assert_eq!(pool.available(), 0);
        assert!(pool.try_lease().is_none());

        let released = first.address().to_string();
        drop(first);
        let third = pool.lease().await.unwrap();
        assert_eq!(third.address(), released);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let pool = ChannelAccountPool::with_accounts(["only"]);
        let held = pool.lease().await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.lease().await.map(|l| l.address().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiting.is_finished());

        drop(held);
        assert_eq!(waiting.await.unwrap().unwrap(), "only");
    }

    #[tokio::test]
    async fn test_cancelled_lease_future_releases_nothing_twice() {
        let pool = ChannelAccountPool::with_accounts(["a"]);
        let lease = pool.lease().await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(5), pool.lease()).await;
        assert!(timed_out.is_err());

        drop(lease);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_lease().is_some());
    }

    #[test]
    fn test_take_for_removal() {
        let pool = ChannelAccountPool::with_accounts(["a", "b"]);
        let lease = pool.try_lease().unwrap();
        assert_eq!(lease.address(), "a");

        assert!(matches!(
            pool.take_for_removal("a"),
            Err(SubmissionError::ChannelAccountInUse(_))
        ));
        assert!(pool.take_for_removal("b").unwrap());
        assert!(!pool.take_for_removal("missing").unwrap());
        assert_eq!(pool.size(), 1);

        drop(lease);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_lease().is_some());
    }

    #[test]
    fn test_add_is_idempotent() {
        let pool = ChannelAccountPool::new();
        assert!(pool.add("a"));
        assert!(!pool.add("a"));
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.available(), 1);
    }
}
