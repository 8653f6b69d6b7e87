//! HTTP routing for guarded functions.
//!
//! Functions are registered by name with their [`RouteSpec`] and mounted at
//! `POST /api/functions/:name` (plus `OPTIONS` for preflight). Every response,
//! including 404/405 and transport-level rejections, is a JSON envelope with
//! CORS headers.
//!
//! ```text
//! TraceLayer ─► ensure_envelope ─► RequestBodyLimitLayer ─► dispatch ─► composer
//!                     ▲                      │
//!                     └── plain-text 413 ────┘  rewritten as PAYLOAD_TOO_LARGE
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{Extensions, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::domain::error::GuardError;
use crate::domain::request::{extract_client_ip, InboundRequest};
use crate::middleware::composer::{GuardResponse, HandlerComposer, HandlerContext, RouteSpec};
use crate::middleware::cors::{apply_cors, apply_security_headers};
use crate::validation::payload::ContentKind;

type ErasedHandler<D> =
    Arc<dyn Fn(Arc<HandlerComposer<D>>, InboundRequest) -> BoxFuture<'static, GuardResponse> + Send + Sync>;

struct RegisteredFunction<D> {
    route: Arc<RouteSpec>,
    handler: ErasedHandler<D>,
}

/// Named functions and their protection requirements
pub struct FunctionRegistry<D> {
    functions: HashMap<String, RegisteredFunction<D>>,
}

impl<D: Send + Sync + 'static> FunctionRegistry<D> {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Register `handler` under `route.name`, replacing any earlier one.
    pub fn register<I, O, F, Fut>(mut self, route: RouteSpec, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, HandlerContext<D>, InboundRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let name = route.name.clone();
        let route = Arc::new(route);
        let handler = Arc::new(handler);

        let erased_route = Arc::clone(&route);
        let erased: ErasedHandler<D> = Arc::new(move |composer, request| {
            let route = Arc::clone(&erased_route);
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                composer
                    .handle(&route, request, move |input, ctx, req| handler(input, ctx, req))
                    .await
            })
        });

        self.functions.insert(
            name,
            RegisteredFunction {
                route,
                handler: erased,
            },
        );
        self
    }

    pub fn route(&self, name: &str) -> Option<&RouteSpec> {
        self.functions.get(name).map(|f| f.route.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl<D: Send + Sync + 'static> Default for FunctionRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state of the function router
struct RouterState<D> {
    composer: Arc<HandlerComposer<D>>,
    functions: FunctionRegistry<D>,
    body_limit: usize,
}

/// Build the axum router serving `functions` through `composer`.
pub fn build_router<D: Send + Sync + 'static>(
    composer: Arc<HandlerComposer<D>>,
    functions: FunctionRegistry<D>,
) -> Router {
    let body_limit = composer.config().limits.largest_ceiling();
    let state = Arc::new(RouterState {
        composer,
        functions,
        body_limit,
    });

    Router::new()
        .route("/api/functions/:name", any(dispatch::<D>))
        .route("/health", get(health::<D>))
        .fallback(unknown_path::<D>)
        .with_state(Arc::clone(&state))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(middleware::from_fn_with_state(state, ensure_envelope::<D>))
        .layer(TraceLayer::new_for_http())
}

async fn dispatch<D: Send + Sync + 'static>(
    State(state): State<Arc<RouterState<D>>>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let mut inbound = inbound_request(&parts.method, &parts.headers, &parts.extensions, name.clone());

    let Some(function) = state.functions.functions.get(&name) else {
        debug!(function = %name, "Unknown function");
        return state
            .composer
            .reject(&GuardError::NotFound(name), &inbound)
            .into_response();
    };

    if parts.method != Method::POST && parts.method != Method::OPTIONS {
        let err = GuardError::MethodNotAllowed(parts.method.to_string());
        return state.composer.reject(&err, &inbound).into_response();
    }

    inbound.body = match axum::body::to_bytes(body, state.body_limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            let err = body_too_large(&state, &inbound);
            return state.composer.reject(&err, &inbound).into_response();
        }
    };

    (function.handler)(Arc::clone(&state.composer), inbound)
        .await
        .into_response()
}

async fn health<D: Send + Sync + 'static>(State(state): State<Arc<RouterState<D>>>) -> Response {
    Json(state.composer.health()).into_response()
}

async fn unknown_path<D: Send + Sync + 'static>(
    State(state): State<Arc<RouterState<D>>>,
    request: Request,
) -> Response {
    let (parts, _) = request.into_parts();
    let inbound = inbound_request(&parts.method, &parts.headers, &parts.extensions, parts.uri.path().to_string());
    let err = GuardError::NotFound(parts.uri.path().to_string());
    state.composer.reject(&err, &inbound).into_response()
}

/// Responses produced below the router (body-limit rejections) are turned
/// into envelopes; anything else missing CORS gets it here.
async fn ensure_envelope<D: Send + Sync + 'static>(
    State(state): State<Arc<RouterState<D>>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let function = request
        .uri()
        .path()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let inbound = inbound_request(request.method(), request.headers(), request.extensions(), function);

    let mut response = next.run(request).await;
    if response.status() == StatusCode::PAYLOAD_TOO_LARGE && !is_json(response.headers()) {
        debug!(function = %inbound.function, "Body rejected by transport limit");
        let err = body_too_large(&state, &inbound);
        return state.composer.reject(&err, &inbound).into_response();
    }

    if !response.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN) {
        let cors = &state.composer.config().cors;
        apply_cors(response.headers_mut(), cors, inbound.origin());
        apply_security_headers(response.headers_mut());
    }
    response
}

fn inbound_request(method: &Method, headers: &HeaderMap, extensions: &Extensions, function: String) -> InboundRequest {
    let connect = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    InboundRequest {
        method: method.clone(),
        function,
        headers: headers.clone(),
        body: Default::default(),
        source_ip: extract_client_ip(headers, connect),
    }
}

/// Oversize error reported against the ceiling for the request's content type.
fn body_too_large<D>(state: &RouterState<D>, inbound: &InboundRequest) -> GuardError {
    let kind = ContentKind::from_content_type(inbound.content_type());
    let limit = kind.limit(&state.composer.config().limits);
    GuardError::PayloadTooLarge {
        size: declared_length(&inbound.headers).unwrap_or(state.body_limit.saturating_add(1)),
        limit,
        content_kind: kind.as_str(),
    }
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}
