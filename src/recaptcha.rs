use crate::config::RecaptchaConfig;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";

/// Body returned by the `siteverify` endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SiteVerifyResponse {
    pub success: bool,
    pub score: f64,
    pub action: String,
    pub challenge_ts: Option<String>,
    pub hostname: String,
    #[serde(rename = "error-codes")]
    pub error_codes: Vec<String>,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("reCAPTCHA token is required")]
    TokenMissing,
    #[error("failed to verify reCAPTCHA: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("reCAPTCHA verification failed{}", codes_suffix(.0))]
    Rejected(Vec<String>),
    #[error("reCAPTCHA score too low: {score:.2} (minimum: {minimum:.2})")]
    ScoreTooLow { score: f64, minimum: f64 },
    #[error("reCAPTCHA action mismatch: expected {expected}, got {actual}")]
    ActionMismatch { expected: String, actual: String },
}

fn codes_suffix(codes: &[String]) -> String {
    if codes.is_empty() {
        String::new()
    } else {
        format!(": {}", codes.join(", "))
    }
}

/// reCAPTCHA v3 token checker. Only built when a secret key is configured.
pub struct RecaptchaVerifier {
    client: Client,
    secret_key: String,
    min_score: f64,
    action: String,
    verify_url: String,
}

impl RecaptchaVerifier {
    pub fn new(config: &RecaptchaConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("FormFling/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            secret_key: config.secret_key.clone(),
            min_score: config.min_score,
            action: config.action.clone(),
            verify_url: config.verify_url.clone(),
        })
    }

    pub async fn verify(&self, token: &str, remote_ip: Option<IpAddr>) -> Result<(), VerifyError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(VerifyError::TokenMissing);
        }

        let remote_ip = remote_ip.map(|ip| ip.to_string());
        let mut params = vec![("secret", self.secret_key.as_str()), ("response", token)];
        if let Some(ip) = remote_ip.as_deref() {
            params.push(("remoteip", ip));
        }

        let response: SiteVerifyResponse = self
            .client
            .post(&self.verify_url)
            .form(&params)
            .send()
            .await?
            .json()
            .await?;

        log::debug!(
            "reCAPTCHA response: success={} score={:.2} action={} hostname={} ts={:?}",
            response.success,
            response.score,
            response.action,
            response.hostname,
            response.challenge_ts
        );

        self.evaluate(&response)
    }

    /// Apply the acceptance rules to a decoded `siteverify` answer.
    pub fn evaluate(&self, response: &SiteVerifyResponse) -> Result<(), VerifyError> {
        if !response.success {
            return Err(VerifyError::Rejected(response.error_codes.clone()));
        }
        if response.score < self.min_score {
            return Err(VerifyError::ScoreTooLow {
                score: response.score,
                minimum: self.min_score,
            });
        }
        if !self.action.is_empty() && response.action != self.action {
            return Err(VerifyError::ActionMismatch {
                expected: self.action.clone(),
                actual: response.action.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier(min_score: f64, action: &str) -> RecaptchaVerifier {
        RecaptchaVerifier::new(&RecaptchaConfig {
            site_key: "site".into(),
            secret_key: "secret".into(),
            min_score,
            action: action.into(),
            verify_url: DEFAULT_VERIFY_URL.into(),
        })
        .unwrap()
    }

    fn answer(success: bool, score: f64, action: &str) -> SiteVerifyResponse {
        SiteVerifyResponse {
            success,
            score,
            action: action.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_accepts_good_score_and_action() {
        let v = verifier(0.5, "submit");
        assert!(v.evaluate(&answer(true, 0.9, "submit")).is_ok());
        assert!(v.evaluate(&answer(true, 0.5, "submit")).is_ok());
    }

    #[test]
    fn test_rejected_carries_error_codes() {
        let v = verifier(0.5, "submit");
        let mut resp = answer(false, 0.0, "");
        resp.error_codes = vec!["invalid-input-response".into(), "timeout-or-duplicate".into()];
        let err = v.evaluate(&resp).unwrap_err();
        assert_eq!(
            err.to_string(),
            "reCAPTCHA verification failed: invalid-input-response, timeout-or-duplicate"
        );

        let err = v.evaluate(&answer(false, 0.9, "submit")).unwrap_err();
        assert_eq!(err.to_string(), "reCAPTCHA verification failed");
    }

    #[test]
    fn test_score_too_low() {
        let v = verifier(0.5, "submit");
        match v.evaluate(&answer(true, 0.3, "submit")) {
            Err(e @ VerifyError::ScoreTooLow { .. }) => {
                assert_eq!(e.to_string(), "reCAPTCHA score too low: 0.30 (minimum: 0.50)");
            }
            other => panic!("Expected ScoreTooLow, got {other:?}"),
        }
    }

    #[test]
    fn test_action_mismatch() {
        let v = verifier(0.5, "submit");
        let err = v.evaluate(&answer(true, 0.9, "login")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "reCAPTCHA action mismatch: expected submit, got login"
        );
    }

    #[test]
    fn test_empty_expected_action_accepts_any() {
        let v = verifier(0.5, "");
        assert!(v.evaluate(&answer(true, 0.7, "whatever")).is_ok());
    }

    #[test]
    fn test_score_checked_before_action() {
        let v = verifier(0.5, "submit");
        assert!(matches!(
            v.evaluate(&answer(true, 0.1, "login")),
            Err(VerifyError::ScoreTooLow { .. })
        ));
    }

    #[tokio::test]
    async fn test_blank_token_is_missing() {
        let v = verifier(0.5, "submit");
        assert!(matches!(
            v.verify("   ", None).await,
            Err(VerifyError::TokenMissing)
        ));
    }

    #[test]
    fn test_response_decoding() {
        let body = r#"{"success":true,"score":0.7,"action":"submit",
            "challenge_ts":"2024-01-01T00:00:00Z","hostname":"example.com"}"#;
        let resp: SiteVerifyResponse = serde_json::from_str(body).unwrap();
        assert!(resp.success);
        assert_eq!(resp.hostname, "example.com");
        assert!(resp.error_codes.is_empty());

        let resp: SiteVerifyResponse =
            serde_json::from_str(r#"{"success":false,"error-codes":["bad-request"]}"#).unwrap();
        assert_eq!(resp.error_codes, vec!["bad-request".to_string()]);
    }
}
