use formfling::config::{command, Config};
use formfling::delivery::SmtpMailer;
use formfling::server::{self, AppState};
use log::LevelFilter;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = command().get_matches();

    // Initialize logger based on verbose flag
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let config = match Config::from_matches(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    let port = config.port;
    let mailer = Arc::new(SmtpMailer::new(config.delivery.clone()));
    let security = mailer.security();
    let summary = format!(
        "SMTP relay {}:{} ({:?}), sending {} -> {}",
        config.delivery.host,
        config.delivery.port,
        security,
        config.delivery.from.email,
        config.delivery.to.email
    );
    let recaptcha = config.recaptcha.is_some();
    let test_form = config.enable_test_form;
    let origins = if config.allowed_origins.is_empty() {
        "*".to_string()
    } else {
        config.allowed_origins.join(", ")
    };

    let state = match AppState::new(config, mailer) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            eprintln!("Error loading templates: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("check-config") {
        println!("Configuration OK");
        println!("  {summary}");
        println!("  Allowed origins: {origins}");
        println!("  reCAPTCHA verification: {}", enabled(recaptcha));
        println!("  Test form: {}", enabled(test_form));
        return;
    }

    log::info!("FormFling v{} starting", env!("CARGO_PKG_VERSION"));
    log::info!("{summary}");
    log::info!("Allowed origins: {origins}");
    log::info!("reCAPTCHA verification {}", enabled(recaptcha));
    if test_form {
        log::info!("Test form available at /test");
    }

    if let Err(e) = server::run(state, port).await {
        log::error!("{e:#}");
        process::exit(1);
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}
