//! Channel provider implementations.

mod email;
mod mock;
mod telegram;

pub use email::{EmailProvider, SmtpConfig};
pub use mock::{MockProvider, ScriptedOutcome};
pub use telegram::TelegramProvider;
