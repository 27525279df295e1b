use crate::submit::STATUS_PARAM;
use anyhow::Context as _;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tera::{Context, Tera};
use url::Url;

const STATUS_TEMPLATE: &str = "status.html";
const TEST_FORM_TEMPLATE: &str = "test_form.html";

pub const SUCCESS_MESSAGE: &str = "Your message has been sent successfully!";
pub const ERROR_MESSAGE: &str = "There was an error sending your message. Please try again.";

#[derive(Debug, Serialize)]
struct StatusPage<'a> {
    status: &'a str,
    form_title: &'a str,
    message: &'a str,
    redirect_url: &'a str,
}

#[derive(Debug, Serialize)]
struct TestFormPage<'a> {
    site_key: &'a str,
    form_title: &'a str,
}

/// The HTML pages served next to the submit endpoint.
pub struct Pages {
    tera: Tera,
    form_title: String,
    site_key: String,
    test_form: bool,
}

impl Pages {
    pub fn new(
        status_source: &str,
        test_form_source: Option<&str>,
        form_title: &str,
        site_key: &str,
    ) -> tera::Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template(STATUS_TEMPLATE, status_source)?;
        if let Some(source) = test_form_source {
            tera.add_raw_template(TEST_FORM_TEMPLATE, source)?;
        }
        Ok(Self {
            tera,
            form_title: form_title.to_string(),
            site_key: site_key.to_string(),
            test_form: test_form_source.is_some(),
        })
    }

    /// Load the status template, and the test form template when `test_form`
    /// is set.
    pub fn load(
        status: &Path,
        test_form: Option<&Path>,
        form_title: &str,
        site_key: &str,
    ) -> anyhow::Result<Self> {
        let status_source = fs::read_to_string(status)
            .with_context(|| format!("failed to read status template {}", status.display()))?;
        let test_form_source = test_form
            .map(|path| {
                fs::read_to_string(path).with_context(|| {
                    format!("failed to read test form template {}", path.display())
                })
            })
            .transpose()?;

        let pages = Self::new(
            &status_source,
            test_form_source.as_deref(),
            form_title,
            site_key,
        )
        .context("failed to compile page templates")?;

        pages
            .render_status("success", "")
            .context("status template does not render")?;
        if pages.test_form {
            pages
                .render_test_form()
                .context("test form template does not render")?;
        }
        Ok(pages)
    }

    pub fn has_test_form(&self) -> bool {
        self.test_form
    }

    pub fn render_status(&self, status: &str, redirect_url: &str) -> tera::Result<String> {
        let message = if status == "success" {
            SUCCESS_MESSAGE
        } else {
            ERROR_MESSAGE
        };
        let page = StatusPage {
            status,
            form_title: &self.form_title,
            message,
            redirect_url: safe_link(redirect_url),
        };
        self.tera
            .render(STATUS_TEMPLATE, &Context::from_serialize(page)?)
    }

    pub fn render_test_form(&self) -> tera::Result<String> {
        let page = TestFormPage {
            site_key: &self.site_key,
            form_title: &self.form_title,
        };
        self.tera
            .render(TEST_FORM_TEMPLATE, &Context::from_serialize(page)?)
    }
}

/// Only http(s) and relative links may end up in an href.
fn safe_link(link: &str) -> &str {
    match Url::parse(link) {
        Ok(url) if !matches!(url.scheme(), "http" | "https") => "",
        _ => link,
    }
}

/// Referer with any `formfling_status` parameter removed, for the
/// go-back link. Unparseable referers are dropped.
pub fn strip_status_param(referer: &str) -> Option<String> {
    let mut url = Url::parse(referer).ok()?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != STATUS_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Some(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "{{ status }}|{{ form_title }}|{{ message }}|{{ redirect_url }}";

    fn pages() -> Pages {
        Pages::new(STATUS, Some("{{ form_title }}:{{ site_key }}"), "Contact Me", "site-key").unwrap()
    }

    #[test]
    fn test_success_page() {
        let html = pages().render_status("success", "https://example.com/contact").unwrap();
        assert_eq!(
            html,
            format!("success|Contact Me|{SUCCESS_MESSAGE}|https:&#x2F;&#x2F;example.com&#x2F;contact")
        );
    }

    #[test]
    fn test_error_page() {
        let html = pages().render_status("error", "").unwrap();
        assert_eq!(html, format!("error|Contact Me|{ERROR_MESSAGE}|"));
    }

    #[test]
    fn test_unknown_status_is_escaped() {
        let html = pages().render_status("<b>", "").unwrap();
        assert!(html.starts_with("&lt;b&gt;|"));
        assert!(html.contains(ERROR_MESSAGE));
    }

    #[test]
    fn test_script_links_are_dropped() {
        let html = pages().render_status("success", "javascript:alert(1)").unwrap();
        assert!(html.ends_with('|'));
        let html = pages().render_status("success", "/contact").unwrap();
        assert!(html.ends_with("|&#x2F;contact"));
    }

    #[test]
    fn test_test_form_page() {
        let pages = pages();
        assert!(pages.has_test_form());
        assert_eq!(pages.render_test_form().unwrap(), "Contact Me:site-key");
    }

    #[test]
    fn test_test_form_disabled() {
        let pages = Pages::new(STATUS, None, "Contact Me", "").unwrap();
        assert!(!pages.has_test_form());
        assert!(pages.render_test_form().is_err());
    }

    #[test]
    fn test_strip_status_param() {
        assert_eq!(
            strip_status_param("https://example.com/contact?formfling_status=success").as_deref(),
            Some("https://example.com/contact")
        );
        assert_eq!(
            strip_status_param("https://example.com/c?a=1&formfling_status=error&b=2").as_deref(),
            Some("https://example.com/c?a=1&b=2")
        );
        assert_eq!(
            strip_status_param("https://example.com/contact").as_deref(),
            Some("https://example.com/contact")
        );
        assert_eq!(strip_status_param("not a url"), None);
    }

    #[test]
    fn test_bundled_templates_load() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("web/templates");
        let pages = Pages::load(
            &root.join("status_template.html"),
            Some(&root.join("test_form_template.html")),
            "Contact Me",
            "site-key",
        )
        .unwrap();
        assert!(pages.render_status("success", "").unwrap().contains(SUCCESS_MESSAGE));
        assert!(pages.render_test_form().unwrap().contains("site-key"));
    }
}
