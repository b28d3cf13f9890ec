//! Language client layer.
//!
//! Starts a language server over one of the supported transports and drives
//! it through a [`MessageConnection`](crate::rpc::MessageConnection).

pub mod language_client;
pub mod sync;
pub mod transport;
pub mod types;

pub use language_client::{LanguageClient, LanguageClientBuilder, LanguageClientConfig};
pub use sync::DocumentSync;
pub use transport::{TransportKind, generate_random_pipe_name};
pub use types::{PathToUri, path_to_url};

use crate::error::ClientError;

/// Result type for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
