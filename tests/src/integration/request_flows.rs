//! # Request Flows
//!
//! Full HTTP exchanges through the router: threat screening happens on the
//! raw body before parsing, and every response carries CORS headers no matter
//! which stage produced it.
//!
//! ## Flow Tested:
//!
//! 1. **Pre-parse screening**: script markup inside valid JSON is rejected, handler never runs
//! 2. **Layered encodings**: sanitation unwraps what the capped detector passes
//! 3. **CORS everywhere**: 401, 400, 429, 200, 404 and transport 413 all carry the origin header
//! 4. **Declared oversize**: a `Content-Length` over the ceiling still yields the JSON envelope
//! 5. **Tracing headers**: caller ids are echoed back

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::response::Response;
    use axum::Router;
    use handler_guard::domain::config::{Environment, RatePolicy};
    use handler_guard::validation::sanitize_string;
    use handler_guard::{
        build_router, ApiKeyAuthenticator, FunctionRegistry, GuardConfig, HandlerComposer,
        HandlerContext, InboundRequest, Principal, RouteSpec,
    };
    use serde::Deserialize;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    #[derive(Debug, Deserialize)]
    struct Note {
        text: String,
    }

    struct Store {
        writes: AtomicU32,
    }

    async fn save_note(input: Note, ctx: HandlerContext<Store>, _req: InboundRequest) -> anyhow::Result<Value> {
        ctx.db.writes.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "saved": input.text, "by": ctx.principal.map(|p| p.user_id) }))
    }

    fn app(store: Arc<Store>) -> Router {
        let mut config = GuardConfig {
            environment: Environment::Development,
            ..GuardConfig::default()
        };
        config.rate_limit.default = RatePolicy::new(
            3,
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(600),
        );
        config.limits.max_default_bytes = 64;
        config.limits.max_json_bytes = 64;
        config.limits.max_text_bytes = 64;
        config.limits.max_form_bytes = 64;
        config.limits.max_multipart_bytes = 64;

        let auth = ApiKeyAuthenticator::new().with_key("k-1", Principal::new("writer").with_role("editor"));
        let composer = HandlerComposer::new(config, store).with_authenticator(Arc::new(auth));
        let functions = FunctionRegistry::new().register(RouteSpec::new("saveNote"), save_note);
        build_router(Arc::new(composer), functions)
    }

    fn store() -> Arc<Store> {
        Arc::new(Store {
            writes: AtomicU32::new(0),
        })
    }

    fn post(body: &str, api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/functions/saveNote")
            .header("content-type", "application/json")
            .header("origin", "https://notes.example.com")
            .header("x-forwarded-for", "203.0.113.50");
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn has_cors(response: &Response) -> bool {
        response.headers().contains_key("access-control-allow-origin")
    }

    // =============================================================================
    // INTEGRATION TESTS: PRE-PARSE SCREENING
    // =============================================================================

    #[tokio::test]
    async fn test_malicious_detection_on_pre_parse_body() {
        let store = store();
        let app = app(Arc::clone(&store));

        let response = app
            .oneshot(post(r#"{"text":"<script>alert(1)</script>"}"#, Some("k-1")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(has_cors(&response));
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "MALICIOUS_CONTENT");
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_encoded_payload_is_still_caught() {
        let store = store();
        let app = app(Arc::clone(&store));

        let response = app
            .oneshot(post(r#"{"text":"%253Cscript%253E"}"#, Some("k-1")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "MALICIOUS_CONTENT");
    }

    #[tokio::test]
    async fn test_deep_encoding_is_sanitized_to_a_fixpoint() {
        let store = store();
        let app = app(Arc::clone(&store));

        // Six percent layers: past the detector's decode cap
        let layered = r#"{"text":"%25252525253Cscript%25252525253E"}"#;
        let response = app.oneshot(post(layered, Some("k-1"))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let saved = json_body(response).await["data"]["saved"].as_str().unwrap().to_string();
        assert!(!saved.to_lowercase().contains("script"));
        assert_eq!(sanitize_string(&saved), saved);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    // =============================================================================
    // INTEGRATION TESTS: CORS ALWAYS PRESENT
    // =============================================================================

    #[tokio::test]
    async fn test_cors_always_present() {
        let store = store();
        let app = app(Arc::clone(&store));

        let unauthenticated = app.clone().oneshot(post(r#"{"text":"hi"}"#, None)).await.unwrap();
        assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert!(has_cors(&unauthenticated));

        let malformed = app.clone().oneshot(post(r#"{"text":"#, Some("k-1"))).await.unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        assert!(has_cors(&malformed));

        let ok = app.clone().oneshot(post(r#"{"text":"hi"}"#, Some("k-1"))).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert!(has_cors(&ok));
        let body = json_body(ok).await;
        assert_eq!(body["data"]["saved"], "hi");
        assert_eq!(body["data"]["by"], "writer");

        // The malformed request passed the limiter, so this is the third counted call
        let third = app.clone().oneshot(post(r#"{"text":"again"}"#, Some("k-1"))).await.unwrap();
        assert_eq!(third.status(), StatusCode::OK);

        let limited = app.clone().oneshot(post(r#"{"text":"hi"}"#, Some("k-1"))).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(has_cors(&limited));
        assert_eq!(limited.headers()["retry-after"], "120");

        assert_eq!(store.writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cors_on_transport_rejections() {
        let app = app(store());

        let not_found = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/functions/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert!(has_cors(&not_found));

        // Over the largest configured ceiling
        let big = format!(r#"{{"text":"{}"}}"#, "a".repeat(200));
        let too_large = app.oneshot(post(&big, Some("k-1"))).await.unwrap();
        assert_eq!(too_large.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(has_cors(&too_large));
        assert_eq!(too_large.headers()["x-content-type-options"], "nosniff");
    }

    #[tokio::test]
    async fn test_declared_oversize_gets_envelope() {
        let store = store();
        let app = app(Arc::clone(&store));

        let mut request = post(r#"{"text":"hi"}"#, Some("k-1"));
        request.headers_mut().insert("content-length", "4096".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(has_cors(&response));
        assert_eq!(response.headers()["content-type"], "application/json");
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "PAYLOAD_TOO_LARGE");
        assert_eq!(body["details"]["limit"], 64);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    // =============================================================================
    // INTEGRATION TESTS: TRACING HEADERS
    // =============================================================================

    #[tokio::test]
    async fn test_caller_ids_echoed() {
        let app = app(store());
        let mut request = post(r#"{"text":"hi"}"#, Some("k-1"));
        request.headers_mut().insert("x-request-id", "req-abc".parse().unwrap());
        request.headers_mut().insert("x-correlation-id", "flow-42".parse().unwrap());

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], "req-abc");
        assert_eq!(response.headers()["x-correlation-id"], "flow-42");
        assert!(response.headers().contains_key("x-response-time"));
    }
}
