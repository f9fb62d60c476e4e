//! Minimal JSON-RPC 2.0 server over HTTP POST.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use error_stack::{Result, ResultExt};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warp::{http::StatusCode, hyper::body::Bytes, Filter};

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const HANDLER_ERROR: i64 = -32000;

#[derive(Debug)]
pub enum ServerError {
    Bind,
}

impl error_stack::Context for ServerError {}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind => f.write_str("failed to bind the rpc server"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub id: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub id: serde_json::Value,
}

impl RpcResponse {
    fn from_result(result: serde_json::Value, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn from_error(error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(error),
            id: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

impl RpcErrorObject {
    /// A generic handler failure, code `-32000`.
    pub fn handler(message: impl Into<String>) -> Self {
        Self {
            code: HANDLER_ERROR,
            message: message.into(),
        }
    }
}

type MethodHandler = Box<
    dyn Fn(
            serde_json::Value,
        ) -> BoxFuture<'static, std::result::Result<serde_json::Value, RpcErrorObject>>
        + Send
        + Sync,
>;

/// Dispatches requests to registered method handlers. Method names are
/// matched case-insensitively.
#[derive(Default)]
pub struct RpcServer {
    handlers: HashMap<String, MethodHandler>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<serde_json::Value, RpcErrorObject>>
            + Send
            + 'static,
    {
        let handler: MethodHandler = Box::new(move |params| Box::pin(handler(params)));
        self.handlers.insert(method.to_lowercase(), handler);
    }

    /// Serve until the token is cancelled.
    pub async fn run(self, address: SocketAddr, ct: CancellationToken) -> Result<(), ServerError> {
        let server = Arc::new(self);

        let route = warp::post()
            .and(warp::path::end())
            .and(warp::body::bytes())
            .then(move |body: Bytes| {
                let server = server.clone();
                async move { server.handle(body).await }
            });

        let (address, serving) = warp::serve(route)
            .try_bind_with_graceful_shutdown(address, async move { ct.cancelled().await })
            .change_context(ServerError::Bind)?;

        info!(address = %address, "read api listening");
        serving.await;

        Ok(())
    }

    async fn handle(&self, body: Bytes) -> warp::reply::Response {
        let request: RpcRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(_) => {
                let response = RpcResponse::from_error(RpcErrorObject {
                    code: PARSE_ERROR,
                    message: "Parse error".to_string(),
                });
                return reply_with(StatusCode::BAD_REQUEST, &response);
            }
        };

        let response = self.process(request).await;
        reply_with(StatusCode::OK, &response)
    }

    async fn process(&self, request: RpcRequest) -> RpcResponse {
        let Some(handler) = self.handlers.get(&request.method.to_lowercase()) else {
            return RpcResponse::from_error(RpcErrorObject {
                code: METHOD_NOT_FOUND,
                message: "method not found".to_string(),
            });
        };

        match handler(request.params).await {
            Ok(result) => RpcResponse::from_result(result, request.id),
            Err(error) => {
                warn!(method = %request.method, message = %error.message, "rpc handler failed");
                RpcResponse::from_error(error)
            }
        }
    }
}

fn reply_with(status: StatusCode, response: &RpcResponse) -> warp::reply::Response {
    use warp::Reply;
    warp::reply::with_status(warp::reply::json(response), status).into_response()
}
