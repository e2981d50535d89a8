//! Client permission checks.
//!
//! A client is identified by its origin. Sources are consulted in a fixed
//! order: the admin-managed allow-list, then a stored user decision, then an
//! interactive prompt. The first source that answers decides. The allow-list
//! is read on every check; the user's outcome is memoized per origin in a
//! [`PermissionCache`], so concurrent and repeated checks for the same origin
//! share one answer and never prompt twice.

pub mod decision_store;
pub mod managed_registry;
pub mod policy_or_prompting;
pub mod trusted_clients;
pub mod user_prompting;

pub use decision_store::{DecisionStore, JsonFileDecisionStore, MemoryDecisionStore};
pub use managed_registry::{AllowList, ManagedRegistry};
pub use policy_or_prompting::PolicyOrPromptingChecker;
pub use trusted_clients::{TrustedClientInfo, TrustedClientsRegistry};
pub use user_prompting::{PromptRequest, UserPrompt, UserPromptingChecker};

use crate::Result;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Shared outcome of one permission check: `Ok(())` grants, a
/// [`ConduitError::PermissionDenied`](crate::ConduitError::PermissionDenied)
/// denies.
pub type PermissionCheck = Shared<BoxFuture<'static, Result<()>>>;

/// Decides whether a client may talk to the server.
pub trait PermissionsChecker: Send + Sync {
    /// Start, or join, the check for `origin`. `None` is the application
    /// itself.
    ///
    /// Must not block: the returned future does the work.
    fn check(&self, origin: Option<&str>) -> PermissionCheck;
}

/// Per-origin memo of permission checks.
#[derive(Default)]
pub struct PermissionCache {
    checks: Mutex<HashMap<String, PermissionCheck>>,
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PermissionCheck>> {
        self.checks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The memoized check for `origin`, created with `start` if there is none.
    ///
    /// `start` runs under the cache lock; it should only build the future.
    pub fn get_or_start<F>(&self, origin: &str, start: F) -> PermissionCheck
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>>,
    {
        let mut checks = self.lock();
        if let Some(check) = checks.get(origin) {
            return check.clone();
        }
        let check = start().shared();
        checks.insert(origin.to_string(), check.clone());
        check
    }

    /// Forget the outcome for `origin`, so the next check starts over.
    pub fn forget(&self, origin: &str) -> bool {
        self.lock().remove(origin).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_cache_memoizes_per_origin() {
        let cache = PermissionCache::new();
        let started = AtomicUsize::new(0);
        let start = || {
            started.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(())).boxed()
        };

        let a = cache.get_or_start("https://a.example", start);
        let b = cache.get_or_start("https://a.example", start);
        let c = cache.get_or_start("https://c.example", start);

        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(a.await, Ok(()));
        assert_eq!(b.await, Ok(()));
        assert_eq!(c.await, Ok(()));
        assert_eq!(cache.len(), 2);

        assert!(cache.forget("https://a.example"));
        assert_eq!(cache.len(), 1);
    }
}
