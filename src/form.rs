use crate::sanitize::clean;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use url::form_urlencoded;

/// A contact form submission as received from the browser or an API client.
///
/// Only `name`, `email` and `message` are required, and that is enforced by
/// [`crate::validation::validate`], not by parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionForm {
    #[serde(deserialize_with = "nullable")]
    pub name: String,
    #[serde(deserialize_with = "nullable")]
    pub email: String,
    #[serde(deserialize_with = "nullable")]
    pub subject: String,
    #[serde(deserialize_with = "nullable")]
    pub message: String,
    #[serde(deserialize_with = "nullable")]
    pub phone: String,
    #[serde(deserialize_with = "nullable")]
    pub website: String,
    /// reCAPTCHA v3 token
    #[serde(
        rename = "g-recaptcha-response",
        alias = "recaptcha_token",
        skip_serializing
    )]
    pub recaptcha_token: Option<String>,
    /// Where browser submissions should land afterwards
    #[serde(rename = "_redirect", skip_serializing)]
    pub redirect: Option<String>,
}

#[derive(Debug, Error)]
pub enum FormError {
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid percent-encoding at byte {0}")]
    PercentEncoding(usize),
    #[error("failed to read request body: {0}")]
    Unreadable(String),
}

impl FormError {
    pub fn is_json(&self) -> bool {
        matches!(self, FormError::Json(_))
    }
}

impl SubmissionForm {
    pub fn from_json(body: &[u8]) -> Result<Self, FormError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Parse an `application/x-www-form-urlencoded` body. The first value of
    /// a repeated key wins and unknown keys are ignored.
    pub fn from_urlencoded(body: &[u8]) -> Result<Self, FormError> {
        check_percent_escapes(body)?;

        let mut form = SubmissionForm::default();
        let mut seen: Vec<String> = Vec::new();
        for (key, value) in form_urlencoded::parse(body) {
            if seen.iter().any(|k| *k == key) {
                continue;
            }
            seen.push(key.to_string());

            let value = value.into_owned();
            match key.as_ref() {
                "name" => form.name = value,
                "email" => form.email = value,
                "subject" => form.subject = value,
                "message" => form.message = value,
                "phone" => form.phone = value,
                "website" => form.website = value,
                "g-recaptcha-response" | "recaptcha_token" => {
                    form.recaptcha_token.get_or_insert(value);
                }
                "_redirect" => form.redirect = Some(value),
                _ => {}
            }
        }
        Ok(form)
    }

    /// Run every text field through the sanitizer.
    pub fn sanitized(mut self) -> Self {
        for field in [
            &mut self.name,
            &mut self.email,
            &mut self.subject,
            &mut self.message,
            &mut self.phone,
            &mut self.website,
        ] {
            *field = clean(field);
        }
        self
    }

    pub fn redirect(&self) -> Option<&str> {
        self.redirect.as_deref().filter(|r| !r.is_empty())
    }
}

fn nullable<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// `form_urlencoded` decodes a broken escape literally; a browser never
/// produces one, so treat it as a malformed body.
fn check_percent_escapes(body: &[u8]) -> Result<(), FormError> {
    let mut pos = 0;
    while pos < body.len() {
        if body[pos] == b'%' {
            let valid = body
                .get(pos + 1..pos + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return Err(FormError::PercentEncoding(pos));
            }
            pos += 3;
        } else {
            pos += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urlencoded_fields() {
        let body = b"name=John+Doe&email=john%40example.com&message=Hello%20there%2C%20friend\
                     &phone=123&website=https%3A%2F%2Fexample.com&subject=Hi&extra=ignored";
        let form = SubmissionForm::from_urlencoded(body).unwrap();
        assert_eq!(form.name, "John Doe");
        assert_eq!(form.email, "john@example.com");
        assert_eq!(form.message, "Hello there, friend");
        assert_eq!(form.phone, "123");
        assert_eq!(form.website, "https://example.com");
        assert_eq!(form.subject, "Hi");
        assert_eq!(form.recaptcha_token, None);
        assert_eq!(form.redirect(), None);
    }

    #[test]
    fn test_urlencoded_first_value_wins() {
        let form = SubmissionForm::from_urlencoded(b"name=first&name=second").unwrap();
        assert_eq!(form.name, "first");
    }

    #[test]
    fn test_urlencoded_token_and_redirect() {
        let body = b"g-recaptcha-response=tok123&_redirect=https%3A%2F%2Fex.com%2Fthanks";
        let form = SubmissionForm::from_urlencoded(body).unwrap();
        assert_eq!(form.recaptcha_token.as_deref(), Some("tok123"));
        assert_eq!(form.redirect(), Some("https://ex.com/thanks"));
    }

    #[test]
    fn test_urlencoded_rejects_broken_escape() {
        match SubmissionForm::from_urlencoded(b"%") {
            Err(FormError::PercentEncoding(0)) => {}
            other => panic!("Expected percent-encoding error, got {other:?}"),
        }
        assert!(SubmissionForm::from_urlencoded(b"name=a%zz").is_err());
        assert!(SubmissionForm::from_urlencoded(b"name=100%25").is_ok());
    }

    #[test]
    fn test_empty_urlencoded_body() {
        let form = SubmissionForm::from_urlencoded(b"").unwrap();
        assert_eq!(form, SubmissionForm::default());
    }

    #[test]
    fn test_json_body() {
        let body = br#"{"name":"Jane Doe","email":"jane@example.com","subject":"Test",
            "message":"Hello","phone":"","website":"","g-recaptcha-response":"abc","other":1}"#;
        let form = SubmissionForm::from_json(body).unwrap();
        assert_eq!(form.name, "Jane Doe");
        assert_eq!(form.email, "jane@example.com");
        assert_eq!(form.subject, "Test");
        assert_eq!(form.message, "Hello");
        assert_eq!(form.recaptcha_token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_json_missing_and_null_fields() {
        let form = SubmissionForm::from_json(br#"{"name":"A","phone":null}"#).unwrap();
        assert_eq!(form.name, "A");
        assert_eq!(form.phone, "");
        assert_eq!(form.email, "");
    }

    #[test]
    fn test_json_token_alias() {
        let form = SubmissionForm::from_json(br#"{"recaptcha_token":"xyz"}"#).unwrap();
        assert_eq!(form.recaptcha_token.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_invalid_json() {
        let err = SubmissionForm::from_json(br#"{"name": "John", "email": }"#).unwrap_err();
        assert!(err.is_json());
        assert!(SubmissionForm::from_json(b"[1,2,3]").is_err());
    }

    #[test]
    fn test_sanitized_cleans_every_text_field() {
        let form = SubmissionForm {
            name: " Bcc:Eve ".into(),
            email: "to:eve@example.com".into(),
            subject: "cc:subject".into(),
            message: "content-type: hello".into(),
            phone: "href 555".into(),
            website: " https://example.com ".into(),
            recaptcha_token: Some("to:token".into()),
            redirect: None,
        }
        .sanitized();
        assert_eq!(form.name, "Eve");
        assert_eq!(form.email, "eve@example.com");
        assert_eq!(form.subject, "subject");
        assert_eq!(form.message, ": hello");
        assert_eq!(form.phone, "555");
        assert_eq!(form.website, "https://example.com");
        // tokens are opaque and passed through untouched
        assert_eq!(form.recaptcha_token.as_deref(), Some("to:token"));
    }

    #[test]
    fn test_serialize_skips_control_fields() {
        let form = SubmissionForm {
            name: "John Doe".into(),
            recaptcha_token: Some("secret".into()),
            redirect: Some("https://example.com".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&form).unwrap();
        assert_eq!(
            json,
            r#"{"name":"John Doe","email":"","subject":"","message":"","phone":"","website":""}"#
        );
    }
}
