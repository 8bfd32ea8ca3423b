//! SMTP listener and session engine

mod server;
mod session;

pub use server::SmtpServer;
pub use session::SmtpSession;
