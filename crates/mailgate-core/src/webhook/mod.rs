//! Downstream webhook delivery

mod account;
mod client;

pub use account::AccountChecker;
pub use client::{WebhookAttachment, WebhookClient, WebhookPayload};
