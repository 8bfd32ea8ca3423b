//! Spam scanning via an external scanner process

mod scanner;

pub use scanner::{ScanVerdict, SpamScanner};
