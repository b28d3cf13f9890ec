//! langbridge
//!
//! A JSON-RPC message connection engine and the editor-side language client
//! built on it.
//!
//! # Overview
//!
//! This library provides:
//! - Content-Length framing over any async byte stream
//! - A message connection that correlates requests with responses, dispatches
//!   inbound traffic in order and supports cooperative cancellation
//! - A language client that starts a server over stdio, a pipe or a socket
//!   and keeps documents in sync
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   stdio / pipe / socket   ┌─────────────────┐
//! │ LanguageClient  │◄─────────────────────────►│ Language Server │
//! └────────┬────────┘        (JSON-RPC)         └─────────────────┘
//!          │
//!   ┌──────▼────────────┐
//!   │ MessageConnection │
//!   └──────┬────────────┘
//!          │
//!   ┌──────▼──────┐  ┌─────────────┐
//!   │   Reader    │  │   Writer    │
//!   └─────────────┘  └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`error`] - Error types for the entire crate
//! - [`rpc`] - Framing, connection and cancellation
//! - [`client`] - Language client and server transports
//! - [`config`] - `.langbridge.json` loading
//!
//! # Example
//!
//! ```no_run
//! use langbridge::client::LanguageClient;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = LanguageClient::builder()
//!     .server_command("rust-analyzer")
//!     .workspace_root(".")
//!     .build()
//!     .await?;
//!
//! println!("{:?}", client.server_capabilities().hover_provider);
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are too strict
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod client;
pub mod config;
pub mod error;
pub mod rpc;

// Re-export commonly used types at the crate root
pub use error::{Error, Result};
