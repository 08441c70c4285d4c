#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![forbid(unsafe_code)]

mod auth_service;
mod client;
mod config;
mod coordinator;
mod credential;
mod decorator;
pub mod error;
mod events;
mod session;
mod store;
mod transport;

pub use auth_service::*;
pub use client::*;
pub use config::*;
pub use coordinator::*;
pub use credential::*;
pub use decorator::*;
pub use error::{Error, Result};
pub use events::*;
pub use session::*;
pub use store::*;
pub use transport::*;
