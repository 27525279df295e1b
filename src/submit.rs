use crate::composer::{ComposeError, EmailComposer};
use crate::delivery::{DeliveryError, Mailer};
use crate::form::{FormError, SubmissionForm};
use crate::recaptcha::{RecaptchaVerifier, VerifyError};
use crate::validation::{validate, ValidationError};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::error::Error as StdError;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use url::{form_urlencoded, Url};

/// Query parameter appended to an explicit `_redirect` target.
pub const STATUS_PARAM: &str = "formfling_status";

/// Everything the pipeline needs from an incoming HTTP request.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionRequest<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
    pub query: Option<&'a str>,
    pub body: Result<&'a [u8], &'a str>,
    pub peer: Option<IpAddr>,
    pub form_id: Option<&'a str>,
}

#[derive(Debug)]
pub enum SubmissionResult {
    Sent,
    Rejected(Rejection),
    DeliveryFailed(SendError),
}

#[derive(Debug, Error)]
pub enum Rejection {
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error(transparent)]
    MalformedBody(FormError),
    #[error(transparent)]
    Invalid(ValidationError),
    #[error(transparent)]
    Unverified(VerifyError),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl SubmissionResult {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SubmissionResult::Sent => StatusCode::OK,
            SubmissionResult::Rejected(Rejection::MethodNotAllowed) => {
                StatusCode::METHOD_NOT_ALLOWED
            }
            SubmissionResult::Rejected(_) => StatusCode::BAD_REQUEST,
            SubmissionResult::DeliveryFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short reason shown to API callers. Never carries internal detail.
    pub fn error_tag(&self) -> Option<&'static str> {
        let tag = match self {
            SubmissionResult::Sent => return None,
            SubmissionResult::Rejected(Rejection::MethodNotAllowed) => "must be a post",
            SubmissionResult::Rejected(Rejection::MalformedBody(e)) if e.is_json() => {
                "failed to parse JSON"
            }
            SubmissionResult::Rejected(Rejection::MalformedBody(_)) => "failed to parse form",
            SubmissionResult::Rejected(Rejection::Invalid(_)) => "server rejected",
            SubmissionResult::Rejected(Rejection::Unverified(_)) => {
                "recaptcha verification failed"
            }
            SubmissionResult::DeliveryFailed(_) => "failed to send email",
        };
        Some(tag)
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            SubmissionResult::Sent => "success",
            _ => "error",
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

/// Drives a submission through sanitize, validate, verify, compose and
/// deliver, then shapes the answer for the caller.
pub struct SubmitHandler {
    composer: EmailComposer,
    mailer: Arc<dyn Mailer>,
    verifier: Option<RecaptchaVerifier>,
}

impl SubmitHandler {
    pub fn new(
        composer: EmailComposer,
        mailer: Arc<dyn Mailer>,
        verifier: Option<RecaptchaVerifier>,
    ) -> Self {
        Self {
            composer,
            mailer,
            verifier,
        }
    }

    pub async fn handle(&self, request: SubmissionRequest<'_>) -> Response {
        let (result, redirect) = self.process(request).await;
        let form_id = request.form_id.unwrap_or("default");

        match &result {
            SubmissionResult::Sent => log::info!("Message sent for form {form_id}"),
            SubmissionResult::Rejected(Rejection::MethodNotAllowed) => {
                log::debug!("Rejected {} request to form {form_id}", request.method)
            }
            SubmissionResult::Rejected(reason) => {
                log::info!("Rejected submission for form {form_id}: {reason}")
            }
            SubmissionResult::DeliveryFailed(e) => {
                log::error!("Failed to send email for form {form_id}: {}", error_chain(e))
            }
        }

        respond(&result, request.headers, redirect.as_deref())
    }

    /// Run the pipeline. Also returns the explicit redirect target, if the
    /// caller supplied one.
    pub async fn process(
        &self,
        request: SubmissionRequest<'_>,
    ) -> (SubmissionResult, Option<String>) {
        let query_redirect = request.query.and_then(redirect_from_query);

        if *request.method != Method::POST {
            let result = SubmissionResult::Rejected(Rejection::MethodNotAllowed);
            return (result, query_redirect);
        }

        let form = match parse_body(request) {
            Ok(form) => form.sanitized(),
            Err(e) => {
                let result = SubmissionResult::Rejected(Rejection::MalformedBody(e));
                return (result, query_redirect);
            }
        };
        let redirect = form.redirect().map(String::from).or(query_redirect);

        let result = self.submit(&form, request).await;
        (result, redirect)
    }

    async fn submit(
        &self,
        form: &SubmissionForm,
        request: SubmissionRequest<'_>,
    ) -> SubmissionResult {
        if let Err(e) = validate(form) {
            return SubmissionResult::Rejected(Rejection::Invalid(e));
        }

        if let Some(verifier) = &self.verifier {
            let token = form.recaptcha_token.as_deref().unwrap_or_default();
            let ip = caller_ip(request.headers, request.peer);
            if let Err(e) = verifier.verify(token, ip).await {
                return SubmissionResult::Rejected(Rejection::Unverified(e));
            }
        }

        let origin = header_str(request.headers, header::ORIGIN)
            .or_else(|| header_str(request.headers, header::REFERER))
            .unwrap_or_default();
        let now = chrono::Local::now().naive_local();

        let message = match self
            .composer
            .compose(form, origin, request.form_id.unwrap_or_default(), now)
        {
            Ok(message) => message,
            Err(e) => return SubmissionResult::DeliveryFailed(e.into()),
        };
        match self.mailer.deliver(&message).await {
            Ok(()) => SubmissionResult::Sent,
            Err(e) => SubmissionResult::DeliveryFailed(e.into()),
        }
    }
}

fn parse_body(request: SubmissionRequest<'_>) -> Result<SubmissionForm, FormError> {
    let body = request
        .body
        .map_err(|e| FormError::Unreadable(e.to_string()))?;
    let is_json = header_str(request.headers, header::CONTENT_TYPE)
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"));
    if is_json {
        SubmissionForm::from_json(body)
    } else {
        SubmissionForm::from_urlencoded(body)
    }
}

/// Build the HTTP answer: JSON for API callers, a 303 for browsers.
pub fn respond(result: &SubmissionResult, headers: &HeaderMap, redirect: Option<&str>) -> Response {
    if is_api_request(headers) {
        let body = ApiResponse {
            status: match result {
                SubmissionResult::Sent => "message sent",
                _ => "error",
            },
            error: result.error_tag(),
        };
        return (result.status_code(), Json(body)).into_response();
    }

    let referer = header_str(headers, header::REFERER);
    let target = redirect_target(result.outcome(), redirect, referer);
    let location = HeaderValue::try_from(target).unwrap_or_else(|_| {
        HeaderValue::from_static(match result {
            SubmissionResult::Sent => "/status?type=success",
            _ => "/status?type=error",
        })
    });
    (StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response()
}

/// Callers that want JSON back rather than a redirect.
pub fn is_api_request(headers: &HeaderMap) -> bool {
    if header_str(headers, "x-requested-with") == Some("XMLHttpRequest") {
        return true;
    }
    let media_type = header_str(headers, header::CONTENT_TYPE)
        .and_then(|ct| ct.split(';').next())
        .map(str::trim);
    if media_type.is_some_and(|mt| mt.eq_ignore_ascii_case("application/json")) {
        return true;
    }
    header_str(headers, header::ACCEPT).is_some_and(|accept| accept.contains("application/json"))
}

pub fn redirect_target(outcome: &str, explicit: Option<&str>, referer: Option<&str>) -> String {
    if let Some(target) = explicit.filter(|t| !t.is_empty()) {
        if let Some(url) = with_status_param(target, outcome) {
            return url;
        }
    }
    match referer.filter(|r| !r.is_empty()) {
        Some(referer) => format!(
            "/status?type={outcome}&redirect={}",
            form_urlencoded::byte_serialize(referer.as_bytes()).collect::<String>()
        ),
        None => format!("/status?type={outcome}"),
    }
}

/// Set `formfling_status` on `target`, replacing any existing value.
/// Relative targets keep their path untouched.
pub fn with_status_param(target: &str, outcome: &str) -> Option<String> {
    match Url::parse(target) {
        Ok(mut url) => {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != STATUS_PARAM)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(kept)
                .append_pair(STATUS_PARAM, outcome);
            Some(url.into())
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let (rest, fragment) = match target.split_once('#') {
                Some((rest, fragment)) => (rest, Some(fragment)),
                None => (target, None),
            };
            let (path, query) = rest.split_once('?').unwrap_or((rest, ""));

            let mut pairs = form_urlencoded::Serializer::new(String::new());
            for (k, v) in form_urlencoded::parse(query.as_bytes()) {
                if k != STATUS_PARAM {
                    pairs.append_pair(&k, &v);
                }
            }
            pairs.append_pair(STATUS_PARAM, outcome);

            let mut url = format!("{path}?{}", pairs.finish());
            if let Some(fragment) = fragment {
                url.push('#');
                url.push_str(fragment);
            }
            Some(url)
        }
        Err(e) => {
            log::debug!("Ignoring unusable redirect target {target:?}: {e}");
            None
        }
    }
}

/// First `X-Forwarded-For` hop, else the socket peer.
pub fn caller_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    header_str(headers, "x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .or(peer)
}

fn redirect_from_query(query: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "_redirect")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn header_str<K: header::AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn error_chain(error: &dyn StdError) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let detail = cause.to_string();
        if !text.contains(&detail) {
            text.push_str(": ");
            text.push_str(&detail);
        }
        source = cause.source();
    }
    text
}
