//! Demo server backend.
//!
//! Stands in for the privileged resource owner: it executes the remote calls
//! forwarded by the client handler registry.

use async_trait::async_trait;
use conduit_core::{ConduitError, RemoteCallDispatch, RemoteCallMessage, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Backend answering a handful of demo functions:
///
/// - `echo(args...)`: returns the arguments as an array
/// - `add(numbers...)`: returns their sum
/// - `fail(message)`: fails with `message`
/// - `list_clients()`: the handlers currently announced, by id
#[derive(Default)]
pub struct DemoBackend {
    clients: Mutex<BTreeMap<u64, String>>,
}

impl DemoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> MutexGuard<'_, BTreeMap<u64, String>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(arguments: &[Value]) -> Result<Value> {
        let mut sum = 0.0;
        for argument in arguments {
            sum += argument.as_f64().ok_or_else(|| {
                ConduitError::remote(format!("add: expected a number, got {}", argument))
            })?;
        }
        Ok(json!(sum))
    }
}

#[async_trait]
impl RemoteCallDispatch for DemoBackend {
    async fn dispatch(&self, handler_id: u64, call: RemoteCallMessage) -> Result<Value> {
        debug!(
            "DemoBackend: handler {} calls {}",
            handler_id,
            call.debug_representation()
        );
        match call.function_name.as_str() {
            "echo" => Ok(Value::Array(call.arguments)),
            "add" => Self::add(&call.arguments),
            "fail" => Err(ConduitError::remote(
                call.arguments
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("failed on request"),
            )),
            "list_clients" => {
                let clients: serde_json::Map<String, Value> = self
                    .clients()
                    .iter()
                    .map(|(id, name)| (id.to_string(), json!(name)))
                    .collect();
                Ok(Value::Object(clients))
            }
            other => Err(ConduitError::remote(format!("unknown function: {}", other))),
        }
    }

    async fn on_handler_created(&self, handler_id: u64, client_name_for_log: &str) {
        info!("DemoBackend: client {} connected", handler_id);
        self.clients()
            .insert(handler_id, client_name_for_log.to_string());
    }

    async fn on_handler_deleted(&self, handler_id: u64) {
        info!("DemoBackend: client {} disconnected", handler_id);
        self.clients().remove(&handler_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(function_name: &str, arguments: Vec<Value>) -> RemoteCallMessage {
        RemoteCallMessage::new(function_name, arguments)
    }

    #[tokio::test]
    async fn test_demo_functions() {
        let backend = DemoBackend::new();
        assert_eq!(
            backend.dispatch(1, call("echo", vec![json!("a"), json!(2)])).await,
            Ok(json!(["a", 2]))
        );
        assert_eq!(
            backend.dispatch(1, call("add", vec![json!(1), json!(2.5)])).await,
            Ok(json!(3.5))
        );
        assert_eq!(
            backend.dispatch(1, call("fail", vec![json!("no reader")])).await,
            Err(ConduitError::remote("no reader"))
        );
        assert!(backend.dispatch(1, call("add", vec![json!("x")])).await.is_err());
        assert!(backend.dispatch(1, call("reboot", vec![])).await.is_err());
    }

    #[tokio::test]
    async fn test_list_clients_tracks_handlers() {
        let backend = DemoBackend::new();
        backend.on_handler_created(3, "127.0.0.1").await;
        backend.on_handler_created(4, "127.0.0.2").await;
        backend.on_handler_deleted(3).await;

        assert_eq!(
            backend.dispatch(4, call("list_clients", vec![])).await,
            Ok(json!({"4": "127.0.0.2"}))
        );
    }
}
