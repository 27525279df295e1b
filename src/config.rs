use crate::recaptcha::DEFAULT_VERIFY_URL;
use anyhow::{bail, Context};
use clap::builder::BoolishValueParser;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use lettre::Address;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub delivery: DeliveryConfig,
    /// Empty means any origin is accepted.
    pub allowed_origins: Vec<String>,
    pub form_title: String,
    pub templates: TemplatePaths,
    pub enable_test_form: bool,
    /// Present only when a secret key is configured.
    pub recaptcha: Option<RecaptchaConfig>,
    /// Public key for the test form widget, even without verification.
    pub recaptcha_site_key: String,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub require_tls: bool,
    pub from: Contact,
    pub to: Contact,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    pub email: Address,
}

#[derive(Debug, Clone)]
pub struct TemplatePaths {
    pub email: PathBuf,
    pub status: PathBuf,
    pub test_form: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RecaptchaConfig {
    pub site_key: String,
    pub secret_key: String,
    pub min_score: f64,
    pub action: String,
    pub verify_url: String,
}

fn text_arg(id: &'static str, env: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .long(id)
        .env(env)
        .value_name(env)
        .help(help)
        .action(ArgAction::Set)
}

fn flag_arg(id: &'static str, env: &'static str, help: &'static str) -> Arg {
    text_arg(id, env, help)
        .value_parser(BoolishValueParser::new())
        .num_args(0..=1)
        .default_value("false")
        .default_missing_value("true")
}

/// Command line definition. Every setting can also come from the environment.
pub fn command() -> Command {
    Command::new("formfling")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relays website contact form submissions to an inbox over SMTP")
        .arg(
            text_arg("port", "PORT", "HTTP listen port")
                .value_parser(value_parser!(u16))
                .default_value("8080"),
        )
        .arg(text_arg("smtp-host", "SMTP_HOST", "SMTP relay host").default_value("smtp.gmail.com"))
        .arg(
            text_arg("smtp-port", "SMTP_PORT", "SMTP relay port (465 = implicit TLS)")
                .value_parser(value_parser!(u16))
                .default_value("587"),
        )
        .arg(text_arg("smtp-username", "SMTP_USERNAME", "SMTP login"))
        .arg(text_arg("smtp-password", "SMTP_PASSWORD", "SMTP password").hide_env_values(true))
        .arg(
            text_arg("smtp-timeout", "SMTP_TIMEOUT", "SMTP session timeout in seconds")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("30"),
        )
        .arg(flag_arg(
            "smtp-require-tls",
            "SMTP_REQUIRE_TLS",
            "Refuse to send when the relay does not offer STARTTLS",
        ))
        .arg(text_arg("from-email", "FROM_EMAIL", "Sender address"))
        .arg(text_arg("from-name", "FROM_NAME", "Sender display name").default_value("FormFling"))
        .arg(text_arg("to-email", "TO_EMAIL", "Recipient address"))
        .arg(text_arg("to-name", "TO_NAME", "Recipient display name"))
        .arg(
            text_arg(
                "allowed-origins",
                "ALLOWED_ORIGINS",
                "Comma separated list of allowed origins, * for any",
            )
            .default_value("*"),
        )
        .arg(
            text_arg("form-title", "FORM_TITLE", "Title used in the subject and pages")
                .default_value("Contact Me"),
        )
        .arg(
            text_arg("email-template", "EMAIL_TEMPLATE", "Email body template")
                .value_parser(value_parser!(PathBuf))
                .default_value("./web/templates/email_template.html"),
        )
        .arg(
            text_arg("status-template", "STATUS_TEMPLATE", "Status page template")
                .value_parser(value_parser!(PathBuf))
                .default_value("./web/templates/status_template.html"),
        )
        .arg(
            text_arg("test-form-template", "TEST_FORM_TEMPLATE", "Test form template")
                .value_parser(value_parser!(PathBuf))
                .default_value("./web/templates/test_form_template.html"),
        )
        .arg(flag_arg(
            "enable-test-form",
            "ENABLE_TEST_FORM",
            "Serve a test form at /test",
        ))
        .arg(text_arg(
            "recaptcha-site-key",
            "RECAPTCHA_SITE_KEY",
            "reCAPTCHA v3 site key",
        ))
        .arg(
            text_arg(
                "recaptcha-secret-key",
                "RECAPTCHA_SECRET_KEY",
                "reCAPTCHA v3 secret key; enables verification",
            )
            .hide_env_values(true),
        )
        .arg(
            text_arg(
                "recaptcha-min-score",
                "RECAPTCHA_MIN_SCORE",
                "Lowest accepted reCAPTCHA score",
            )
            .value_parser(value_parser!(f64))
            .default_value("0.5"),
        )
        .arg(
            text_arg(
                "recaptcha-action",
                "RECAPTCHA_ACTION",
                "Expected reCAPTCHA action, empty to skip the check",
            )
            .default_value("submit"),
        )
        .arg(
            text_arg(
                "recaptcha-verify-url",
                "RECAPTCHA_VERIFY_URL",
                "reCAPTCHA siteverify endpoint",
            )
            .default_value(DEFAULT_VERIFY_URL),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check-config")
                .long("check-config")
                .help("Load configuration and templates, report and exit")
                .action(ArgAction::SetTrue),
        )
}

impl Config {
    pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        let username = non_empty(matches, "smtp-username");
        let password = non_empty(matches, "smtp-password");
        let (Some(username), Some(password)) = (username, password) else {
            bail!("SMTP_USERNAME and SMTP_PASSWORD are required");
        };

        let from_email = non_empty(matches, "from-email");
        let to_email = non_empty(matches, "to-email");
        let (Some(from_email), Some(to_email)) = (from_email, to_email) else {
            bail!("FROM_EMAIL and TO_EMAIL are required");
        };

        let from = Contact {
            name: string(matches, "from-name"),
            email: parse_address(&from_email, "FROM_EMAIL")?,
        };
        let to = Contact {
            name: string(matches, "to-name"),
            email: parse_address(&to_email, "TO_EMAIL")?,
        };

        let form_title = string(matches, "form-title");
        let delivery = DeliveryConfig {
            host: string(matches, "smtp-host"),
            port: copied(matches, "smtp-port")?,
            username,
            password,
            timeout: Duration::from_secs(copied(matches, "smtp-timeout")?),
            require_tls: copied(matches, "smtp-require-tls")?,
            from,
            to,
            subject: format!("New submission from {form_title}"),
        };

        let recaptcha_site_key = string(matches, "recaptcha-site-key");
        let recaptcha = non_empty(matches, "recaptcha-secret-key").map(|secret_key| {
            Ok::<_, anyhow::Error>(RecaptchaConfig {
                site_key: recaptcha_site_key.clone(),
                secret_key,
                min_score: copied(matches, "recaptcha-min-score")?,
                action: string(matches, "recaptcha-action"),
                verify_url: string(matches, "recaptcha-verify-url"),
            })
        });

        Ok(Config {
            port: copied(matches, "port")?,
            delivery,
            allowed_origins: parse_origins(&string(matches, "allowed-origins")),
            form_title,
            templates: TemplatePaths {
                email: path(matches, "email-template")?,
                status: path(matches, "status-template")?,
                test_form: path(matches, "test-form-template")?,
            },
            enable_test_form: copied(matches, "enable-test-form")?,
            recaptcha: recaptcha.transpose()?,
            recaptcha_site_key,
        })
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == origin)
    }
}

/// `*` or an empty list means no restriction.
pub fn parse_origins(raw: &str) -> Vec<String> {
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(String::from)
        .collect();
    if origins.iter().any(|o| o == "*") {
        Vec::new()
    } else {
        origins
    }
}

fn string(matches: &ArgMatches, id: &str) -> String {
    matches.get_one::<String>(id).cloned().unwrap_or_default()
}

fn non_empty(matches: &ArgMatches, id: &str) -> Option<String> {
    matches
        .get_one::<String>(id)
        .filter(|s| !s.trim().is_empty())
        .cloned()
}

fn copied<T: Copy + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> anyhow::Result<T> {
    matches
        .get_one::<T>(id)
        .copied()
        .with_context(|| format!("missing value for --{id}"))
}

fn path(matches: &ArgMatches, id: &str) -> anyhow::Result<PathBuf> {
    matches
        .get_one::<PathBuf>(id)
        .cloned()
        .with_context(|| format!("missing value for --{id}"))
}

fn parse_address(raw: &str, name: &str) -> anyhow::Result<Address> {
    raw.trim()
        .parse::<Address>()
        .with_context(|| format!("{name} is not a valid email address: {raw}"))
}
