//! turnloop — conversation runtime for agentic coding assistants.
//!
//! Drives a session's turn loop against a streaming model provider: tool
//! dispatch behind a permission gate and hooks, context compaction, retry
//! of transient failures, and a coordinator that keeps one turn per session.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use turnloop::prelude::*;
//!
//! # async fn example() -> turnloop::error::Result<()> {
//! let provider = Arc::new(ScriptedProvider::new(vec![ScriptedCall::text_reply("Hello!")]));
//! let coordinator = SessionCoordinator::from_config(provider, RuntimeConfig::load()?);
//! let id = coordinator.create_session(SessionOptions::default()).await?;
//! let outcome = coordinator.send_message(&id, "Hi there").await?;
//! println!("{}", outcome.text());
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod error;
pub mod models;
pub mod prelude;
pub mod provider;
pub mod session;
pub mod tools;
pub mod types;
pub mod util;
