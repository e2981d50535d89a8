use super::managed_registry::ManagedRegistry;
use super::user_prompting::UserPromptingChecker;
use super::{PermissionCache, PermissionCheck, PermissionsChecker};
use futures::FutureExt;
use std::sync::Arc;
use tracing::debug;

/// The production checker: the admin allow-list first, then the user.
///
/// The allow-list is consulted on every check, so policy changes apply to
/// later checks in both directions. Only the user step is memoized per
/// origin. A check waiting on the user is raced against later allow-list
/// updates; if the origin gets allowed meanwhile, the check is granted, the
/// open prompt is closed and the abandoned user check is forgotten.
#[derive(Clone)]
pub struct PolicyOrPromptingChecker {
    cache: Arc<PermissionCache>,
    managed: Arc<ManagedRegistry>,
    user: Arc<UserPromptingChecker>,
}

impl PolicyOrPromptingChecker {
    pub fn new(
        cache: Arc<PermissionCache>,
        managed: Arc<ManagedRegistry>,
        user: Arc<UserPromptingChecker>,
    ) -> Self {
        Self {
            cache,
            managed,
            user,
        }
    }

    /// Memo of the user decisions, by origin.
    pub fn cache(&self) -> &Arc<PermissionCache> {
        &self.cache
    }
}

impl PermissionsChecker for PolicyOrPromptingChecker {
    fn check(&self, origin: Option<&str>) -> PermissionCheck {
        let Some(origin) = origin else {
            debug!("Granted permissions for the client with no origin");
            return futures::future::ready(Ok(())).boxed().shared();
        };

        let cache = Arc::clone(&self.cache);
        let managed = Arc::clone(&self.managed);
        let user = Arc::clone(&self.user);
        let origin = origin.to_string();
        async move {
            debug!("Checking permissions for client {}...", origin);
            if managed.loaded().await.contains(&origin) {
                debug!("Granted permissions for client {} through the allow-list", origin);
                return Ok(());
            }
            debug!("No permissions found for client {} through the allow-list", origin);

            let allowed_later = managed.allowed_later(origin.clone());
            let user_check = cache.get_or_start(&origin, || user.check(origin.clone()));
            tokio::select! {
                biased;
                () = allowed_later => {
                    debug!("Granted permissions for client {} after an allow-list update", origin);
                    cache.forget(&origin);
                    user.cancel_prompt_if_pending(&origin).await;
                    Ok(())
                }
                outcome = user_check => outcome,
            }
        }
        .boxed()
        .shared()
    }
}
