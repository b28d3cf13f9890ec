//! End-to-end tests against a real rust-analyzer.
//!
//! These are ignored by default because they need rust-analyzer on `PATH`
//! (or `RUST_ANALYZER_PATH`) and take a while to index.
//!
//! To run these tests:
//! ```bash
//! cargo test --test server_test -- --ignored
//!
//! # With debug output
//! RUST_LOG=debug cargo test --test server_test -- --ignored --nocapture
//! ```
mod common;

use std::path::PathBuf;
use std::time::Duration;

use langbridge::client::{LanguageClient, PathToUri};
use langbridge::rpc::ConnectionState;
use lsp_types::request::{DocumentSymbolRequest, HoverRequest};
use lsp_types::{
    DocumentSymbolParams, DocumentSymbolResponse, HoverParams, PartialResultParams, Position,
    TextDocumentIdentifier, TextDocumentPositionParams, WorkDoneProgressParams,
};
use serial_test::serial;

fn rust_analyzer() -> String {
    std::env::var("RUST_ANALYZER_PATH").unwrap_or_else(|_| "rust-analyzer".to_string())
}

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/calc")
}

async fn start() -> LanguageClient {
    LanguageClient::builder()
        .server_command(rust_analyzer())
        .workspace_root(fixture())
        .init_timeout(Duration::from_secs(120))
        .request_timeout(Duration::from_secs(60))
        .build()
        .await
        .expect("failed to start rust-analyzer")
}

#[tokio::test]
#[serial]
#[ignore = "requires rust-analyzer"]
async fn test_stdio_lifecycle() {
    let client = start().await;
    assert!(client.server_capabilities().hover_provider.is_some());

    client.shutdown().await.expect("shutdown should succeed");
    assert_eq!(client.connection().state(), ConnectionState::Disposed);
}

#[tokio::test]
#[serial]
#[ignore = "requires rust-analyzer"]
async fn test_document_symbols_follow_edits() {
    let client = start().await;
    let lib = fixture().join("src/lib.rs");
    let uri = lib.to_lsp_uri().unwrap();
    client.did_open(&lib).await.unwrap();

    let params = || DocumentSymbolParams {
        text_document: TextDocumentIdentifier { uri: uri.clone() },
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    };
    let names = |response: Option<DocumentSymbolResponse>| -> Vec<String> {
        match response {
            Some(DocumentSymbolResponse::Nested(symbols)) => {
                symbols.into_iter().map(|s| s.name).collect()
            }
            Some(DocumentSymbolResponse::Flat(symbols)) => {
                symbols.into_iter().map(|s| s.name).collect()
            }
            None => Vec::new(),
        }
    };

    let before = names(client.request::<DocumentSymbolRequest>(params()).await.unwrap());
    assert!(before.contains(&"add".to_string()), "got {before:?}");

    let original = std::fs::read_to_string(&lib).unwrap();
    let edited = format!("{original}\npub fn sub(a: i64, b: i64) -> i64 {{\n    a - b\n}}\n");
    client.did_change(&lib, &edited).await.unwrap();

    // The pending change is flushed ahead of the request.
    let after = names(client.request::<DocumentSymbolRequest>(params()).await.unwrap());
    assert!(after.contains(&"sub".to_string()), "got {after:?}");

    let hover = client
        .request::<HoverRequest>(HoverParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position: Position::new(14, 8),
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
        })
        .await
        .unwrap();
    assert!(hover.is_some());

    client.did_close(&lib).await.unwrap();
    client.shutdown().await.unwrap();
}
