//! # Dialer
//!
//! Core of the outbound voice campaign service. Calls are placed through a
//! voice AI provider and tracked from provider webhooks; qualified leads are
//! bridged to human agents through telephony conferences.
//!
//! ## Components
//!
//! - **registry**: the live call table and its status state machine, phone
//!   dedup, listener accounting
//! - **adapter**: provider payloads in, one normalized event out
//! - **reconciler**: applies normalized events to the registry, delayed
//!   cleanup and the periodic sweep
//! - **dispatch**: places single calls and call control
//! - **campaign**: batch execution of contact queues held in the shared store
//! - **conference**: warm transfer of a qualified lead to the agent queue
//! - **audio**: per call audio stream monitoring with reconnects
//! - **server**: HTTP API, provider webhooks and the dashboard websocket
//!
//! ## Usage
//!
//! ```rust,no_run
//! use outdial_dialer::config::Config;
//! use outdial_dialer::server::{DialerService, Server};
//!
//! # async fn start() -> anyhow::Result<()> {
//! let service = DialerService::new(Config::load()?)?;
//! Server::run(Server::new(service)).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod audio;
pub mod call;
pub mod campaign;
pub mod conference;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod reconciler;
pub mod registry;
pub mod server;

#[cfg(test)]
mod fakes;
