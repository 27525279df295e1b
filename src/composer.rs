use crate::config::{Config, Contact};
use crate::form::SubmissionForm;
use anyhow::Context as _;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{NaiveDate, NaiveDateTime};
use std::fs;
use std::path::Path;
use tera::{Context, Tera};
use thiserror::Error;

const TEMPLATE_NAME: &str = "email.html";

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("failed to render email template: {0}")]
    Render(#[from] tera::Error),
}

/// Renders submissions into complete RFC 5322 messages.
///
/// The template is compiled once; headers that only depend on configuration
/// are formatted up front.
pub struct EmailComposer {
    tera: Tera,
    from: String,
    to: String,
    subject: String,
    form_title: String,
}

impl EmailComposer {
    pub fn from_file(path: &Path, config: &Config) -> anyhow::Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to read email template {}", path.display()))?;
        Self::from_source(&source, config)
            .with_context(|| format!("email template {} does not render", path.display()))
    }

    /// Compile `source` and render it once against a sample submission.
    pub fn from_source(source: &str, config: &Config) -> Result<Self, ComposeError> {
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, source)?;

        let composer = Self {
            tera,
            from: mailbox(&config.delivery.from),
            to: mailbox(&config.delivery.to),
            subject: encode_word(&config.delivery.subject),
            form_title: config.form_title.clone(),
        };
        composer.compose(&sample_form(), "https://example.com", "", sample_time())?;
        Ok(composer)
    }

    pub fn compose(
        &self,
        form: &SubmissionForm,
        origin: &str,
        form_id: &str,
        now: NaiveDateTime,
    ) -> Result<Vec<u8>, ComposeError> {
        let mut context = Context::new();
        context.insert("form", form);
        context.insert("submitted_time", &now.format("%I:%M %p").to_string());
        context.insert("submitted_date", &now.format("%d %B %Y").to_string());
        context.insert("origin", origin);
        context.insert("form_title", &self.form_title);
        context.insert("form_id", form_id);

        let body = self.tera.render(TEMPLATE_NAME, &context)?;

        let mut message = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-version: 1.0\r\n\
             Content-Type: text/html; charset=\"UTF-8\"\r\n\r\n",
            self.from, self.to, self.subject
        );
        message.push_str(&body);
        Ok(message.into_bytes())
    }
}

/// `Name <addr>`, or the bare address when there is no display name.
fn mailbox(contact: &Contact) -> String {
    let name = contact.name.trim();
    if name.is_empty() {
        return contact.email.to_string();
    }
    format!("{} <{}>", display_name(name), contact.email)
}

fn display_name(name: &str) -> String {
    if !name.is_ascii() {
        return encode_word(name);
    }
    if name.contains(|c: char| "()<>[]:;@\\,.\"".contains(c)) {
        return format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""));
    }
    name.to_string()
}

/// RFC 2047 base64 encoded word for non-ASCII header text.
fn encode_word(text: &str) -> String {
    if text.is_ascii() {
        text.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(text))
    }
}

fn sample_form() -> SubmissionForm {
    SubmissionForm {
        name: "Template Check".into(),
        email: "check@example.com".into(),
        subject: "Template check".into(),
        message: "This message is rendered once at startup.".into(),
        ..Default::default()
    }
}

fn sample_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2006, 1, 2)
        .and_then(|d| d.and_hms_opt(15, 4, 5))
        .unwrap_or_default()
}
