//! Core SMTP types.

mod address;
mod envelope;
mod extension;
mod outcome;
mod reply;

pub use address::Address;
pub use envelope::{Dsn, DsnNotify, DsnReturn, Envelope, EnvelopeBuilder, xtext};
pub use extension::{AuthMechanism, Capabilities, Extension};
pub use outcome::{RecipientError, SendInfo};
pub use reply::{Reply, ReplyCode};
