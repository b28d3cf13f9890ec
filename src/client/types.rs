//! Helpers for turning workspace paths into LSP payload values.

use std::path::Path;

use lsp_types::{Url, WorkspaceFolder};

use crate::error::ClientError;

use super::ClientResult;

/// Converts a path to an LSP file:// URI.
///
/// Relative paths are resolved against the current directory and symlinks
/// are followed, so the path must exist.
///
/// # Errors
///
/// Returns [`ClientError::DocumentNotFound`] if the path cannot be resolved.
pub fn path_to_url(path: &Path) -> ClientResult<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| {
                ClientError::DocumentNotFound(format!("failed to get current directory: {e}"))
            })?
            .join(path)
    };

    let canonical = absolute.canonicalize().map_err(|e| {
        ClientError::DocumentNotFound(format!(
            "failed to canonicalize path '{}': {}",
            path.display(),
            e
        ))
    })?;

    Url::from_file_path(&canonical).map_err(|()| {
        ClientError::DocumentNotFound(format!("invalid path: {}", canonical.display()))
    })
}

/// Extension trait for converting paths to LSP Url.
pub trait PathToUri {
    /// Converts a path to an LSP Url.
    ///
    /// # Errors
    ///
    /// See [`path_to_url`].
    fn to_lsp_uri(&self) -> ClientResult<Url>;
}

impl PathToUri for Path {
    fn to_lsp_uri(&self) -> ClientResult<Url> {
        path_to_url(self)
    }
}

/// Builds the workspace folder announced during `initialize`.
pub fn workspace_folder(root: &Path) -> ClientResult<WorkspaceFolder> {
    let uri = path_to_url(root)?;
    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("workspace")
        .to_string();
    Ok(WorkspaceFolder { uri, name })
}

/// Language identifier sent in `textDocument/didOpen`, derived from the file
/// extension.
pub fn language_id_for_path(path: &Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or("plaintext", |ext| match ext {
            "rs" => "rust",
            "py" => "python",
            "js" => "javascript",
            "ts" => "typescript",
            "go" => "go",
            "c" | "h" => "c",
            "cpp" | "cc" | "cxx" | "hpp" => "cpp",
            "java" => "java",
            "json" => "json",
            "toml" => "toml",
            "md" => "markdown",
            _ => "plaintext",
        })
}
