pub mod composer;
pub mod config;
pub mod delivery;
pub mod form;
pub mod pages;
pub mod recaptcha;
pub mod sanitize;
pub mod server;
pub mod submit;
pub mod validation;

pub use composer::EmailComposer;
pub use config::Config;
pub use delivery::{DeliveryError, Mailer, SmtpMailer, StubMailer};
pub use form::SubmissionForm;
pub use server::{router, AppState};
pub use submit::{SubmissionResult, SubmitHandler};
