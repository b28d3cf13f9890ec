//! Handler registrations and outcome mapping.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use super::cancellation::CancellationToken;
use super::messages::{ParameterStructures, ProgressToken, ResponseError};

pub type RequestFuture = BoxFuture<'static, anyhow::Result<Value>>;

pub type RequestHandler =
    Arc<dyn Fn(Option<Value>, CancellationToken) -> RequestFuture + Send + Sync>;

/// Receives every request without an exact handler, along with its method.
pub type StarRequestHandler =
    Arc<dyn Fn(String, Option<Value>, CancellationToken) -> RequestFuture + Send + Sync>;

pub type NotificationHandler = Arc<dyn Fn(Option<Value>) -> anyhow::Result<()> + Send + Sync>;

pub type StarNotificationHandler =
    Arc<dyn Fn(String, Option<Value>) -> anyhow::Result<()> + Send + Sync>;

pub type ProgressHandler = Arc<dyn Fn(Value) + Send + Sync>;

pub(crate) fn request_handler<F, Fut>(handler: F) -> RequestHandler
where
    F: Fn(Option<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |params, token| handler(params, token).boxed())
}

pub(crate) fn star_request_handler<F, Fut>(handler: F) -> StarRequestHandler
where
    F: Fn(String, Option<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |method, params, token| handler(method, params, token).boxed())
}

/// A handler plus the id of the registration that installed it.
#[derive(Clone)]
pub(crate) struct Registered<H> {
    pub id: u64,
    pub structures: ParameterStructures,
    pub handler: H,
}

/// Every handler installed on a connection.
#[derive(Default)]
pub(crate) struct HandlerTable {
    next_id: u64,
    pub requests: HashMap<String, Registered<RequestHandler>>,
    pub star_request: Option<Registered<StarRequestHandler>>,
    pub notifications: HashMap<String, Registered<NotificationHandler>>,
    pub star_notification: Option<Registered<StarNotificationHandler>>,
    pub progress: HashMap<ProgressToken, Registered<ProgressHandler>>,
}

impl HandlerTable {
    pub fn register<H>(&mut self, structures: ParameterStructures, handler: H) -> Registered<H> {
        self.next_id += 1;
        Registered {
            id: self.next_id,
            structures,
            handler,
        }
    }

    pub fn clear(&mut self) {
        self.requests.clear();
        self.star_request = None;
        self.notifications.clear();
        self.star_notification = None;
        self.progress.clear();
    }
}

/// Removes the entry under `key` only if it is still the registration `id`.
pub(crate) fn remove_if<K, H>(map: &mut HashMap<K, Registered<H>>, key: &K, id: u64)
where
    K: std::hash::Hash + Eq,
{
    if map.get(key).is_some_and(|entry| entry.id == id) {
        map.remove(key);
    }
}

pub(crate) fn take_if<H>(slot: &mut Option<Registered<H>>, id: u64) {
    if slot.as_ref().is_some_and(|entry| entry.id == id) {
        *slot = None;
    }
}

/// Maps a handler failure onto the error sent back to the peer.
pub(crate) fn response_error_for(method: &str, error: anyhow::Error) -> ResponseError {
    match error.downcast::<ResponseError>() {
        Ok(error) => error,
        Err(error) => {
            ResponseError::internal_error(format!("Request {method} failed with message: {error}"))
        }
    }
}

pub(crate) fn panic_error_for(method: &str) -> ResponseError {
    ResponseError::internal_error(format!(
        "Request {method} failed unexpectedly without providing any details."
    ))
}

/// Runs a request handler to completion, turning errors and panics into
/// response errors.
pub(crate) async fn run_request(method: &str, future: RequestFuture) -> Result<Value, ResponseError> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(response_error_for(method, error)),
        Err(_) => Err(panic_error_for(method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::messages::error_codes;
    use serde_json::json;

    #[tokio::test]
    async fn test_ok_value_passes_through() {
        let handler = request_handler(|params, _| async move { Ok(params.unwrap_or(Value::Null)) });
        let result = run_request("echo", handler(Some(json!([1])), CancellationToken::NONE)).await;
        assert_eq!(result.unwrap(), json!([1]));
    }

    #[tokio::test]
    async fn test_response_error_is_forwarded() {
        let handler = request_handler(|_, _| async {
            Err(anyhow::Error::new(
                ResponseError::new(error_codes::CONTENT_MODIFIED, "stale").with_data(json!(3)),
            ))
        });
        let err = run_request("m", handler(None, CancellationToken::NONE))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::CONTENT_MODIFIED);
        assert_eq!(err.message, "stale");
        assert_eq!(err.data, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_other_error_becomes_internal_error() {
        let handler = request_handler(|_, _| async { Err(anyhow::anyhow!("disk full")) });
        let err = run_request("save", handler(None, CancellationToken::NONE))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
        assert_eq!(err.message, "Request save failed with message: disk full");
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let handler = request_handler(|_, _| async { panic!("boom") });
        let err = run_request("crash", handler(None, CancellationToken::NONE))
            .await
            .unwrap_err();
        assert_eq!(
            err.message,
            "Request crash failed unexpectedly without providing any details."
        );
    }

    #[test]
    fn test_stale_registration_does_not_remove_newer_one() {
        let mut table = HandlerTable::default();
        let noop: NotificationHandler = Arc::new(|_| Ok(()));
        let first = table.register(ParameterStructures::Auto, noop.clone());
        let first_id = first.id;
        table.notifications.insert("a".to_string(), first);
        let second = table.register(ParameterStructures::Auto, noop);
        let second_id = second.id;
        table.notifications.insert("a".to_string(), second);

        remove_if(&mut table.notifications, &"a".to_string(), first_id);
        assert!(table.notifications.contains_key("a"));
        remove_if(&mut table.notifications, &"a".to_string(), second_id);
        assert!(table.notifications.is_empty());
    }
}
