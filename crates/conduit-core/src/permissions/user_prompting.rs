//! Permission source backed by stored user decisions and an interactive
//! prompt.

use super::decision_store::DecisionStore;
use super::trusted_clients::TrustedClientsRegistry;
use crate::messaging::origin::{client_info_link, client_name_for_log};
use crate::{ConduitError, Result};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// What the prompt shows about a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptRequest {
    pub origin: String,
    pub is_client_known: bool,
    pub client_name: String,
    pub client_info_link: String,
}

/// Interactive permission prompt.
#[async_trait::async_trait]
pub trait UserPrompt: Send + Sync {
    /// Ask the user about a client. `Ok(true)` grants, `Ok(false)` rejects, an
    /// error means the prompt was dismissed or could not be shown.
    async fn prompt(&self, request: PromptRequest) -> Result<bool>;

    /// Close the outstanding prompt for `origin`, if any.
    async fn cancel(&self, _origin: &str) {}
}

type StoredDecisions = Shared<BoxFuture<'static, Arc<HashMap<String, bool>>>>;

/// Checks a client against the stored decisions and prompts the user when
/// there is none.
///
/// Known clients flagged `autoapprove` are granted without asking. A grant
/// from the prompt is persisted; a rejection or a dismissed prompt is not.
pub struct UserPromptingChecker {
    trusted: Arc<TrustedClientsRegistry>,
    store: Arc<dyn DecisionStore>,
    prompt: Arc<dyn UserPrompt>,
    stored: StoredDecisions,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl UserPromptingChecker {
    pub fn new(
        trusted: Arc<TrustedClientsRegistry>,
        store: Arc<dyn DecisionStore>,
        prompt: Arc<dyn UserPrompt>,
    ) -> Self {
        let stored = {
            let store = Arc::clone(&store);
            async move {
                let decisions = match store.load().await {
                    Ok(decisions) => decisions,
                    Err(e) => {
                        warn!("Failed to load the stored user decisions: {}", e);
                        HashMap::new()
                    }
                };
                info!(
                    "Loaded {} stored user decision(s)",
                    decisions.len()
                );
                Arc::new(decisions)
            }
            .boxed()
            .shared()
        };
        Self {
            trusted,
            store,
            prompt,
            stored,
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a prompt for `origin` is currently shown.
    pub fn is_prompt_pending(&self, origin: &str) -> bool {
        self.pending().contains(origin)
    }

    /// Decide on `origin`. Not memoized; callers share the result.
    pub fn check(&self, origin: String) -> BoxFuture<'static, Result<()>> {
        let trusted = self.trusted.get_by_origin(&origin).cloned();
        let stored = self.stored.clone();
        let store = Arc::clone(&self.store);
        let prompt = Arc::clone(&self.prompt);
        let pending = Arc::clone(&self.pending);

        async move {
            if trusted.as_ref().is_some_and(|info| info.autoapprove) {
                info!("Granted permission to the auto-approved client {}", origin);
                return Ok(());
            }

            match stored.await.get(&origin) {
                Some(true) => {
                    info!("Granted permission to client {} due to the stored user selection", origin);
                    return Ok(());
                }
                Some(false) => {
                    info!("Rejected permission to client {} due to the stored user selection", origin);
                    return Err(ConduitError::permission_denied(
                        origin,
                        "rejected due to the stored user selection",
                    ));
                }
                None => debug!(
                    "No stored user selection for client {}, going to prompt the user",
                    origin
                ),
            }

            let request = match &trusted {
                Some(info) => PromptRequest {
                    origin: origin.clone(),
                    is_client_known: true,
                    client_name: info.name.clone(),
                    client_info_link: client_info_link(&origin),
                },
                None => PromptRequest {
                    origin: origin.clone(),
                    is_client_known: false,
                    client_name: client_name_for_log(Some(&origin)),
                    client_info_link: client_info_link(&origin),
                },
            };
            info!(
                "Showing the user prompt for the {} client {}",
                if request.is_client_known { "known" } else { "unknown" },
                origin
            );

            lock(&pending).insert(origin.clone());
            let answer = prompt.prompt(request).await;
            let was_pending = lock(&pending).remove(&origin);

            match answer {
                Ok(true) => {
                    info!("Granted permission to client {} by the user", origin);
                    let store_origin = origin.clone();
                    tokio::spawn(async move {
                        if let Err(e) = store.store_grant(&store_origin).await {
                            warn!("Failed to persist the grant for {}: {}", store_origin, e);
                        }
                    });
                    Ok(())
                }
                Ok(false) => {
                    info!("Rejected permission to client {} by the user", origin);
                    Err(ConduitError::permission_denied(origin, "rejected by the user"))
                }
                Err(e) => {
                    if was_pending {
                        info!("The prompt for client {} was dismissed: {}", origin, e);
                    }
                    Err(ConduitError::permission_denied(
                        origin,
                        "the permission prompt was dismissed",
                    ))
                }
            }
        }
        .boxed()
    }

    /// Close the prompt for `origin` if one is outstanding.
    pub fn cancel_prompt_if_pending(&self, origin: &str) -> BoxFuture<'static, ()> {
        if !self.pending().remove(origin) {
            return futures::future::ready(()).boxed();
        }
        info!(
            "Closing the prompt for client {}: permission was granted by the allow-list",
            origin
        );
        let prompt = Arc::clone(&self.prompt);
        let origin = origin.to_string();
        async move { prompt.cancel(&origin).await }.boxed()
    }
}

fn lock(pending: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}
