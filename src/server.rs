use crate::composer::EmailComposer;
use crate::config::Config;
use crate::delivery::Mailer;
use crate::pages::{strip_status_param, Pages};
use crate::recaptcha::RecaptchaVerifier;
use crate::submit::{SubmissionRequest, SubmitHandler};
use anyhow::Context as _;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

/// Largest request body read from a submission.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared, read-only state behind every request.
pub struct AppState {
    pub config: Arc<Config>,
    pub submit: SubmitHandler,
    pub pages: Pages,
}

impl AppState {
    /// Load templates and build the pipeline. Any failure here is fatal.
    pub fn new(config: Config, mailer: Arc<dyn Mailer>) -> anyhow::Result<Self> {
        let composer = EmailComposer::from_file(&config.templates.email, &config)?;
        let test_form = config
            .enable_test_form
            .then_some(config.templates.test_form.as_path());
        let pages = Pages::load(
            &config.templates.status,
            test_form,
            &config.form_title,
            &config.recaptcha_site_key,
        )?;
        let verifier = config
            .recaptcha
            .as_ref()
            .map(RecaptchaVerifier::new)
            .transpose()
            .context("failed to build reCAPTCHA client")?;

        Ok(Self {
            config: Arc::new(config),
            submit: SubmitHandler::new(composer, mailer, verifier),
            pages,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/submit", any(submit))
        .route("/submit/:form_id", any(submit_form))
        .route("/health", get(health))
        .route("/status", get(status));
    if state.pages.has_test_form() {
        router = router.route("/test", get(test_form));
    }
    router
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn run(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received, draining connections");
}

async fn submit(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Body,
) -> Response {
    handle_submission(&state, method, headers, uri, peer, None, body).await
}

async fn submit_form(
    State(state): State<Arc<AppState>>,
    Path(form_id): Path<String>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Body,
) -> Response {
    handle_submission(&state, method, headers, uri, peer, Some(&form_id), body).await
}

async fn handle_submission(
    state: &AppState,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    peer: Option<ConnectInfo<SocketAddr>>,
    form_id: Option<&str>,
    body: Body,
) -> Response {
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| e.to_string());

    let request = SubmissionRequest {
        method: &method,
        headers: &headers,
        query: uri.query(),
        body: bytes.as_deref().map_err(String::as_str),
        peer: peer.map(|ConnectInfo(addr)| addr.ip()),
        form_id,
    };
    state.submit.handle(request).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    redirect: Option<String>,
}

async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> Response {
    let kind = query
        .kind
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| "success".to_string());
    let redirect = query
        .redirect
        .filter(|r| !r.is_empty())
        .or_else(|| {
            headers
                .get(header::REFERER)
                .and_then(|v| v.to_str().ok())
                .and_then(strip_status_param)
        })
        .unwrap_or_default();

    match state.pages.render_status(&kind, &redirect) {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            log::error!("Failed to render status page: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error rendering status page").into_response()
        }
    }
}

async fn test_form(State(state): State<Arc<AppState>>) -> Response {
    match state.pages.render_test_form() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            log::error!("Failed to render test form: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error rendering test form").into_response()
        }
    }
}

/// Origin allow-list plus the CORS response headers. Preflights stop here.
async fn cors(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .filter(|o| !o.is_empty())
        .cloned();
    let restricted = !state.config.allowed_origins.is_empty();

    if restricted {
        if let Some(origin) = &origin {
            let allowed = origin
                .to_str()
                .is_ok_and(|o| state.config.origin_allowed(o));
            if !allowed {
                log::debug!("Rejected request from origin {origin:?}");
                return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
            }
        }
    }

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    if !restricted {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    } else if let Some(origin) = origin {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, X-Requested-With"),
    );
    response
}
