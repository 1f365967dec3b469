//! BingX perpetual swap trading

pub mod auth;
pub mod client;
pub mod types;

pub use auth::Credentials;
pub use client::BingxClient;
