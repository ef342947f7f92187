//! Request routing over a [`CapabilityRegistry`].

use futures_util::FutureExt as _;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::jsonrpc::{JSONRPC_VERSION, Request, RequestId, Response, RpcError};
use crate::registry::CapabilityRegistry;

/// Reserved method returning every capability definition.
pub const LIST_CAPABILITIES_METHOD: &str = "mcp/listTools";

/// Turns requests into responses. Never fails: every problem becomes an
/// error response.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Parse one inbound frame and dispatch it.
    ///
    /// Frames that are not a request shape get a ParseError keyed to the
    /// sentinel id.
    pub async fn handle_text(&self, text: &str) -> Response {
        let request: Request = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable session frame");
                return Response::err(RequestId::unknown(), RpcError::parse_error(e.to_string()));
            }
        };
        self.dispatch(request).await
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let Request {
            jsonrpc,
            id,
            method,
            params,
        } = request;

        if jsonrpc != JSONRPC_VERSION {
            return Response::err(id, RpcError::invalid_request("invalid jsonrpc version"));
        }

        if method == LIST_CAPABILITIES_METHOD {
            let defs = self.registry.definitions();
            return match serde_json::to_value(defs) {
                Ok(v) => Response::ok(id, v),
                Err(e) => Response::err(id, RpcError::internal(e.to_string())),
            };
        }

        let Some(entry) = self.registry.resolve(&method) else {
            return Response::err(id, RpcError::method_not_found(&method));
        };

        if let Err(violation) = entry.definition.input_schema.validate(&params) {
            tracing::debug!(capability = %method, %violation, "rejected params");
            return Response::err(id, RpcError::invalid_params(violation.to_string()));
        }

        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };

        let outcome = AssertUnwindSafe(entry.handler.call(params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => Response::ok(id, result),
            Ok(Err(e)) => {
                tracing::warn!(capability = %method, error = %e, "capability failed");
                Response::err(id, RpcError::internal(format!("{e:#}")))
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "capability panicked".to_string());
                tracing::error!(capability = %method, %detail, "capability panicked");
                Response::err(id, RpcError::internal(detail))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CapabilityDefinition;
    use crate::schema::InputSchema;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher(calls: Arc<AtomicUsize>) -> Dispatcher {
        let mut reg = CapabilityRegistry::new();
        reg.register_fn(
            CapabilityDefinition::new("echo", "Echo text")
                .with_schema(InputSchema::object().required_property("text", "string")),
            move |p| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "text": p["text"] }))
            },
        )
        .unwrap();
        reg.register_fn(CapabilityDefinition::new("fail", "Always fails"), |_| {
            anyhow::bail!("disk on fire")
        })
        .unwrap();
        reg.register_fn(CapabilityDefinition::new("boom", "Panics"), |_| {
            panic!("handler exploded")
        })
        .unwrap();
        Dispatcher::new(Arc::new(reg))
    }

    #[tokio::test]
    async fn lists_capabilities() {
        let d = dispatcher(Arc::default());
        let resp = d
            .dispatch(Request::new("1", LIST_CAPABILITIES_METHOD, json!({})))
            .await;
        let list = resp.result().unwrap().as_array().unwrap();
        let names: Vec<_> = list.iter().map(|d| d["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["boom", "echo", "fail"]);
        assert_eq!(list[1]["inputSchema"]["required"], json!(["text"]));
    }

    #[tokio::test]
    async fn unknown_method() {
        let d = dispatcher(Arc::default());
        let resp = d.dispatch(Request::new("2", "nope", json!({}))).await;
        assert_eq!(resp.id.as_str(), "2");
        assert_eq!(resp.error().unwrap().code, RpcError::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_params_never_reach_the_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(calls.clone());

        let resp = d.dispatch(Request::new("3", "echo", json!({}))).await;
        let err = resp.error().unwrap();
        assert_eq!(err.code, RpcError::INVALID_PARAMS);
        assert_eq!(err.message, "Missing required field: \"text\"");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let resp = d
            .dispatch(Request::new("4", "echo", json!({"text": "hi"})))
            .await;
        assert_eq!(resp.result(), Some(&json!({"text": "hi"})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_internal_errors() {
        let d = dispatcher(Arc::default());

        let resp = d.dispatch(Request::new("5", "fail", json!({}))).await;
        let err = resp.error().unwrap();
        assert_eq!(err.code, RpcError::INTERNAL_ERROR);
        assert!(err.message.contains("disk on fire"));

        let resp = d.dispatch(Request::new("6", "boom", json!({}))).await;
        let err = resp.error().unwrap();
        assert_eq!(err.code, RpcError::INTERNAL_ERROR);
        assert_eq!(err.message, "handler exploded");
    }

    #[tokio::test]
    async fn malformed_text_gets_parse_error_with_sentinel_id() {
        let d = dispatcher(Arc::default());
        let resp = d.handle_text("{not json").await;
        assert_eq!(resp.id, RequestId::unknown());
        assert_eq!(resp.error().unwrap().code, RpcError::PARSE_ERROR);

        let resp = d.handle_text(r#"{"jsonrpc":"2.0","id":"x"}"#).await;
        assert_eq!(resp.error().unwrap().code, RpcError::PARSE_ERROR);
    }

    #[tokio::test]
    async fn wrong_version_is_invalid_request() {
        let d = dispatcher(Arc::default());
        let mut req = Request::new("7", "echo", json!({"text": "a"}));
        req.jsonrpc = "1.0".into();
        let resp = d.dispatch(req).await;
        assert_eq!(resp.error().unwrap().code, RpcError::INVALID_REQUEST);
    }
}
