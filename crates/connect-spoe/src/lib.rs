//! # connect-spoe
//!
//! The sideband authorization agent the proxy consults on each new
//! mesh connection:
//!
//! - [`frame`] - the agent protocol codec (frames, typed data, varints)
//! - [`agent`] - UNIX-socket listener speaking the protocol
//! - [`IntentionsHandler`] - the `check-intentions` responder with its
//!   certificate decode cache and single-flight decision cache

#![deny(unsafe_code)]

pub mod agent;
mod auth;
pub mod frame;

pub use agent::{run_agent, MessageHandler};
pub use auth::IntentionsHandler;
