use crate::form::SubmissionForm;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

const MIN_MESSAGE_CHARS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("name is required")]
    NameRequired,
    #[error("email is required")]
    EmailRequired,
    #[error("email not valid")]
    EmailInvalid,
    #[error("message not valid")]
    MessageInvalid,
}

fn email_pattern() -> Option<&'static Regex> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").ok())
        .as_ref()
}

pub fn is_valid_email(email: &str) -> bool {
    email_pattern().is_some_and(|re| re.is_match(email))
}

/// Check a sanitized form. The first failing rule is reported.
pub fn validate(form: &SubmissionForm) -> Result<(), ValidationError> {
    if form.name.trim().is_empty() {
        return Err(ValidationError::NameRequired);
    }
    let email = form.email.trim();
    if email.is_empty() {
        return Err(ValidationError::EmailRequired);
    }
    if !is_valid_email(email) {
        return Err(ValidationError::EmailInvalid);
    }
    if form.message.trim().chars().count() < MIN_MESSAGE_CHARS {
        return Err(ValidationError::MessageInvalid);
    }
    Ok(())
}
