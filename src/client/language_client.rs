//! Language client built on [`MessageConnection`].
//!
//! The client starts a language server (or adopts existing streams), runs
//! the `initialize` handshake, keeps open documents in sync, and answers the
//! handful of server-to-client requests every server expects.
//!
//! # Example
//!
//! ```no_run
//! use langbridge::client::LanguageClient;
//! use lsp_types::request::HoverRequest;
//! use std::path::Path;
//!
//! # async fn example(params: lsp_types::HoverParams) -> anyhow::Result<()> {
//! let client = LanguageClient::builder()
//!     .server_command("rust-analyzer")
//!     .workspace_root("/path/to/project")
//!     .build()
//!     .await?;
//!
//! client.did_open(Path::new("/path/to/project/src/main.rs")).await?;
//! let hover = client.request::<HoverRequest>(params).await?;
//! client.shutdown().await?;
//! # let _ = hover;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lsp_types::notification::{
    DidCloseTextDocument, DidOpenTextDocument, DidSaveTextDocument, Exit, Initialized,
    LogMessage, Notification, ShowMessage,
};
use lsp_types::request::{
    Initialize, RegisterCapability, Request, Shutdown, UnregisterCapability,
    WorkDoneProgressCreate, WorkspaceConfiguration,
};
use lsp_types::{
    ClientCapabilities, ClientInfo, ConfigurationParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, DocumentSymbolClientCapabilities,
    DynamicRegistrationClientCapabilities, GotoCapability, HoverClientCapabilities,
    InitializeParams, InitializeResult, InitializedParams, LogMessageParams, MarkupKind,
    MessageType, ServerCapabilities, ShowMessageParams, TextDocumentClientCapabilities,
    TextDocumentIdentifier, TextDocumentItem, TextDocumentSyncClientCapabilities, TraceValue,
    WindowClientCapabilities, WorkDoneProgressParams, WorkspaceClientCapabilities,
};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

use crate::error::{ClientError, ConnectionError, RpcError};
use crate::rpc::events::lock;
use crate::rpc::{
    CancelUndispatched, CancellationToken, CancellationTokenSource, ConnectionOptions,
    MessageConnection, PendingDelivery, ReaderOptions, Subscription, Trace, TraceFormat,
    TraceOptions, TracingTracer, WriterOptions,
};

use super::ClientResult;
use super::sync::DocumentSync;
use super::transport::{self, ServerLaunch, TransportKind};
use super::types::{PathToUri, language_id_for_path, workspace_folder};

/// How long `shutdown` waits for the server process before killing it.
const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Configuration for building a language client.
#[derive(Debug, Clone)]
pub struct LanguageClientConfig {
    /// Command to start the language server.
    pub server_command: String,
    /// Arguments to pass to the language server.
    pub server_args: Vec<String>,
    /// Root directory of the workspace.
    pub workspace_root: PathBuf,
    /// How to reach the server process.
    pub transport: TransportKind,
    /// Port for the socket transport; zero picks a free one.
    pub port: u16,
    /// Timeout for initialization.
    pub init_timeout: Duration,
    /// Timeout for requests.
    pub request_timeout: Duration,
    /// How long document changes are held before being sent.
    pub change_delay: Duration,
    pub trace: Trace,
    pub trace_format: TraceFormat,
    /// How long a half-received message may stall before it is reported.
    pub partial_message_timeout: Duration,
}

impl Default for LanguageClientConfig {
    fn default() -> Self {
        Self {
            server_command: "rust-analyzer".to_string(),
            server_args: Vec::new(),
            workspace_root: PathBuf::from("."),
            transport: TransportKind::Stdio,
            port: 0,
            init_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            change_delay: Duration::from_millis(200),
            trace: Trace::Off,
            trace_format: TraceFormat::Text,
            partial_message_timeout: Duration::from_secs(10),
        }
    }
}

/// Builder for constructing a language client.
#[derive(Debug, Default)]
pub struct LanguageClientBuilder {
    config: LanguageClientConfig,
}

impl LanguageClientBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: LanguageClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the server command.
    #[must_use]
    pub fn server_command(mut self, command: impl Into<String>) -> Self {
        self.config.server_command = command.into();
        self
    }

    /// Sets the server arguments.
    #[must_use]
    pub fn server_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.server_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the workspace root.
    #[must_use]
    pub fn workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.workspace_root = path.into();
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: TransportKind) -> Self {
        self.config.transport = transport;
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the initialization timeout.
    #[must_use]
    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.config.init_timeout = timeout;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn change_delay(mut self, delay: Duration) -> Self {
        self.config.change_delay = delay;
        self
    }

    #[must_use]
    pub fn trace(mut self, level: Trace, format: TraceFormat) -> Self {
        self.config.trace = level;
        self.config.trace_format = format;
        self
    }

    #[must_use]
    pub fn partial_message_timeout(mut self, timeout: Duration) -> Self {
        self.config.partial_message_timeout = timeout;
        self
    }

    /// Starts the language server and initializes it.
    ///
    /// # Errors
    ///
    /// Fails if the workspace root does not exist, the server cannot be
    /// started, or the `initialize` handshake fails or times out.
    pub async fn build(self) -> ClientResult<LanguageClient> {
        let root = canonical_root(&self.config.workspace_root)?;
        let launch = ServerLaunch {
            command: self.config.server_command.clone(),
            args: self.config.server_args.clone(),
            working_dir: root.clone(),
            transport: self.config.transport,
            port: self.config.port,
            connect_timeout: self.config.init_timeout,
        };
        let streams = transport::start_server(&launch).await?;
        LanguageClient::start(
            streams.reader,
            streams.writer,
            Some(streams.child),
            self.config,
            root,
        )
        .await
    }
}

/// A connected, initialized language client.
#[derive(Debug)]
pub struct LanguageClient {
    config: LanguageClientConfig,
    connection: MessageConnection,
    capabilities: Arc<ServerCapabilities>,
    documents: Arc<DocumentSync>,
    subscriptions: Mutex<Vec<Subscription>>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl LanguageClient {
    /// Creates a new builder for constructing a language client.
    pub fn builder() -> LanguageClientBuilder {
        LanguageClientBuilder::new()
    }

    /// Initializes a server reachable over an existing pair of streams.
    ///
    /// # Errors
    ///
    /// Fails if the workspace root does not exist or the `initialize`
    /// handshake fails or times out.
    pub async fn connect<R, W>(
        reader: R,
        writer: W,
        config: LanguageClientConfig,
    ) -> ClientResult<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let root = canonical_root(&config.workspace_root)?;
        Self::start(reader, writer, None, config, root).await
    }

    async fn start<R, W>(
        reader: R,
        writer: W,
        child: Option<Child>,
        config: LanguageClientConfig,
        root: PathBuf,
    ) -> ClientResult<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let documents = Arc::new(DocumentSync::new());
        let options = ConnectionOptions {
            strategy: Some(Arc::new(CancelUndispatched)),
            delivery: Some(documents.clone() as Arc<dyn PendingDelivery>),
        };
        let reader_options = ReaderOptions {
            partial_message_timeout: config.partial_message_timeout,
            ..ReaderOptions::default()
        };
        let connection = MessageConnection::from_streams_with(
            reader,
            writer,
            reader_options,
            WriterOptions::default(),
            options,
        );

        let subscriptions = register_builtin_handlers(&connection)?;
        if config.trace != Trace::Off {
            connection
                .trace(
                    config.trace,
                    Arc::new(TracingTracer),
                    TraceOptions {
                        format: config.trace_format,
                        send_notification: false,
                    },
                )
                .await?;
        }
        connection.listen()?;

        let result = match initialize(&connection, &root, &config).await {
            Ok(result) => result,
            Err(e) => {
                connection.dispose();
                return Err(e);
            }
        };
        if let Some(info) = &result.server_info {
            tracing::debug!(
                server = %info.name,
                version = info.version.as_deref().unwrap_or("unknown"),
                "language server initialized"
            );
        }

        Ok(Self {
            config,
            connection,
            capabilities: Arc::new(result.capabilities),
            documents,
            subscriptions: Mutex::new(subscriptions),
            child: tokio::sync::Mutex::new(child),
        })
    }

    /// Capabilities the server announced during `initialize`.
    pub fn server_capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    /// The underlying connection, for traffic the typed helpers do not cover.
    pub fn connection(&self) -> &MessageConnection {
        &self.connection
    }

    pub fn config(&self) -> &LanguageClientConfig {
        &self.config
    }

    /// Sends a typed request and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] if no response arrives within the
    /// request timeout; the request is cancelled in that case. Otherwise
    /// returns the server's error or a decoding failure.
    pub async fn request<R: Request + 'static>(
        &self,
        params: R::Params,
    ) -> ClientResult<R::Result> {
        self.send::<R>(params, None).await
    }

    /// Like [`LanguageClient::request`], also cancelling the request when
    /// `token` is cancelled.
    ///
    /// # Errors
    ///
    /// As [`LanguageClient::request`].
    pub async fn request_with_token<R: Request + 'static>(
        &self,
        params: R::Params,
        token: &CancellationToken,
    ) -> ClientResult<R::Result> {
        self.send::<R>(params, Some(token)).await
    }

    async fn send<R: Request + 'static>(
        &self,
        params: R::Params,
        token: Option<&CancellationToken>,
    ) -> ClientResult<R::Result> {
        let params = to_params(params)?;
        let source = CancellationTokenSource::new();
        let forward = token.map(|token| {
            let source = source.clone();
            token.on_cancellation_requested(move || source.cancel())
        });

        let method = R::METHOD;
        let connection = self.connection.clone();
        let cancel = source.token();
        let mut call = Box::pin(async move {
            connection
                .send_request(method, params, Some(&cancel))
                .await
        });
        let outcome = tokio::time::timeout(self.config.request_timeout, &mut call).await;
        if let Some(forward) = forward {
            forward.dispose();
        }

        match outcome {
            Ok(result) => {
                let value = result?;
                Ok(serde_json::from_value(value).map_err(RpcError::from)?)
            }
            Err(_) => {
                tracing::warn!(method, "request timed out, cancelling");
                source.cancel();
                tokio::spawn(async move {
                    if let Err(e) = call.await {
                        tracing::debug!(method, "timed out request ended: {e}");
                    }
                });
                Err(ClientError::Timeout(self.config.request_timeout))
            }
        }
    }

    /// Sends a typed notification.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed or the write fails.
    pub async fn notify<N: Notification>(&self, params: N::Params) -> ClientResult<()> {
        let params = to_params(params)?;
        self.connection.send_notification(N::METHOD, params).await?;
        Ok(())
    }

    /// Routes a typed server notification to `handler`. Notifications whose
    /// params do not decode are logged and dropped.
    ///
    /// # Errors
    ///
    /// Fails if the connection is disposed.
    pub fn on_notification<N: Notification>(
        &self,
        handler: impl Fn(N::Params) + Send + Sync + 'static,
    ) -> ClientResult<Subscription> {
        let subscription = self.connection.on_notification(N::METHOD, move |params| {
            let params = serde_json::from_value(params.unwrap_or(Value::Null))?;
            handler(params);
            Ok(())
        })?;
        Ok(subscription)
    }

    /// Opens a document in the language server.
    ///
    /// This sends a `textDocument/didOpen` notification and tracks the
    /// document at version 0. Opening an open document does nothing.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or the notification cannot be sent.
    pub async fn did_open(&self, path: &Path) -> ClientResult<()> {
        let uri = path.to_lsp_uri()?;
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ClientError::DocumentNotFound(format!("failed to read '{}': {}", path.display(), e))
        })?;

        if !self.documents.open(uri.clone()) {
            tracing::debug!(%uri, "document already open");
            return Ok(());
        }

        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: language_id_for_path(path).to_string(),
                version: 0,
                text,
            },
        };
        if let Err(e) = self.notify::<DidOpenTextDocument>(params).await {
            self.documents.close(&uri);
            return Err(e);
        }
        Ok(())
    }

    /// Records new full content for an open document and returns its
    /// version.
    ///
    /// The `textDocument/didChange` is delayed by the change delay; several
    /// changes in that window collapse into one. Any other message sent to
    /// the server first delivers it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DocumentNotFound`] if the document is not open.
    pub async fn did_change(&self, path: &Path, content: &str) -> ClientResult<i32> {
        let uri = path.to_lsp_uri()?;
        let version = self
            .documents
            .change(&uri, content.to_string())
            .ok_or_else(|| {
                ClientError::DocumentNotFound(format!("document not open: {}", path.display()))
            })?;

        if self.config.change_delay.is_zero() {
            self.connection.flush_pending_deliveries().await;
        } else {
            self.documents
                .schedule_flush(&self.connection, self.config.change_delay);
        }
        Ok(version)
    }

    /// Sends `textDocument/didSave` for an open document.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DocumentNotFound`] if the document is not open.
    pub async fn did_save(&self, path: &Path) -> ClientResult<()> {
        let uri = path.to_lsp_uri()?;
        if !self.documents.is_open(&uri) {
            return Err(ClientError::DocumentNotFound(format!(
                "document not open: {}",
                path.display()
            )));
        }
        let params = DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier { uri },
            text: None,
        };
        self.notify::<DidSaveTextDocument>(params).await
    }

    /// Closes a document in the language server.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DocumentNotFound`] if the document is not open.
    pub async fn did_close(&self, path: &Path) -> ClientResult<()> {
        let uri = path.to_lsp_uri()?;
        if !self.documents.close(&uri) {
            return Err(ClientError::DocumentNotFound(format!(
                "document not open: {}",
                path.display()
            )));
        }
        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri },
        };
        self.notify::<DidCloseTextDocument>(params).await
    }

    /// Shuts down the language server gracefully.
    ///
    /// Sends `shutdown` and `exit`, disposes the connection, and waits for
    /// the server process, killing it if it does not exit in time.
    ///
    /// # Errors
    ///
    /// Returns the `shutdown` request's failure, after still tearing
    /// everything down.
    pub async fn shutdown(&self) -> ClientResult<()> {
        let result = self.request::<Shutdown>(()).await;
        if let Err(e) = &result {
            tracing::warn!("shutdown request failed: {e}");
        }
        if let Err(e) = self.notify::<Exit>(()).await {
            tracing::warn!("exit notification failed: {e}");
        }

        self.connection.end().await;
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.dispose();
        }
        self.connection.dispose();

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(EXIT_GRACE_PERIOD, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "language server exited"),
                Ok(Err(e)) => tracing::warn!("failed to wait for language server: {e}"),
                Err(_) => {
                    tracing::warn!("language server did not exit, killing it");
                    child.kill().await?;
                }
            }
        }
        result
    }
}

fn canonical_root(root: &Path) -> ClientResult<PathBuf> {
    root.canonicalize().map_err(|e| {
        ClientError::InitializationFailed(format!("failed to canonicalize workspace root: {e}"))
    })
}

/// Encodes params, mapping `null` (the encoding of `()`) to absent params.
fn to_params(params: impl Serialize) -> ClientResult<Option<Value>> {
    match serde_json::to_value(params).map_err(RpcError::from)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

async fn initialize(
    connection: &MessageConnection,
    root: &Path,
    config: &LanguageClientConfig,
) -> ClientResult<InitializeResult> {
    let params = serde_json::to_value(initialize_params(root, config.trace)?)
        .map_err(RpcError::from)?;

    let value = tokio::time::timeout(
        config.init_timeout,
        connection.send_request(Initialize::METHOD, Some(params), None),
    )
    .await
    .map_err(|_| ClientError::Timeout(config.init_timeout))?
    .map_err(|e| ClientError::InitializationFailed(format!("initialize request failed: {e}")))?;

    let result: InitializeResult = serde_json::from_value(value).map_err(|e| {
        ClientError::InitializationFailed(format!("invalid initialize result: {e}"))
    })?;

    let initialized = serde_json::to_value(InitializedParams {}).map_err(RpcError::from)?;
    connection
        .send_notification(Initialized::METHOD, Some(initialized))
        .await
        .map_err(|e| {
            ClientError::InitializationFailed(format!("initialized notification failed: {e}"))
        })?;
    Ok(result)
}

fn initialize_params(root: &Path, trace: Trace) -> ClientResult<InitializeParams> {
    let trace = match trace {
        Trace::Off => TraceValue::Off,
        Trace::Messages => TraceValue::Messages,
        Trace::Verbose => TraceValue::Verbose,
    };

    Ok(InitializeParams {
        process_id: Some(std::process::id()),
        workspace_folders: Some(vec![workspace_folder(root)?]),
        initialization_options: None,
        capabilities: ClientCapabilities {
            workspace: Some(WorkspaceClientCapabilities {
                configuration: Some(true),
                workspace_folders: Some(true),
                did_change_configuration: Some(DynamicRegistrationClientCapabilities {
                    dynamic_registration: Some(false),
                }),
                ..Default::default()
            }),
            text_document: Some(TextDocumentClientCapabilities {
                synchronization: Some(TextDocumentSyncClientCapabilities {
                    dynamic_registration: Some(false),
                    will_save: Some(false),
                    will_save_wait_until: Some(false),
                    did_save: Some(true),
                }),
                hover: Some(HoverClientCapabilities {
                    dynamic_registration: Some(false),
                    content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                }),
                definition: Some(GotoCapability {
                    dynamic_registration: Some(false),
                    link_support: Some(false),
                }),
                references: Some(DynamicRegistrationClientCapabilities {
                    dynamic_registration: Some(false),
                }),
                document_symbol: Some(DocumentSymbolClientCapabilities {
                    dynamic_registration: Some(false),
                    hierarchical_document_symbol_support: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            window: Some(WindowClientCapabilities {
                work_done_progress: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
        trace: Some(trace),
        client_info: Some(ClientInfo {
            name: "langbridge".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        locale: None,
        work_done_progress_params: WorkDoneProgressParams::default(),
        ..Default::default()
    })
}

/// Installs answers to the server-to-client traffic every server may send.
fn register_builtin_handlers(
    connection: &MessageConnection,
) -> Result<Vec<Subscription>, ConnectionError> {
    let mut subscriptions = vec![
        connection.on_request(WorkDoneProgressCreate::METHOD, |_, _| async {
            Ok(Value::Null)
        })?,
        connection.on_request(RegisterCapability::METHOD, |_, _| async { Ok(Value::Null) })?,
        connection.on_request(UnregisterCapability::METHOD, |_, _| async {
            Ok(Value::Null)
        })?,
        connection.on_request(WorkspaceConfiguration::METHOD, |params, _| async move {
            let params: ConfigurationParams =
                serde_json::from_value(params.unwrap_or(Value::Null))?;
            Ok(Value::Array(vec![Value::Null; params.items.len()]))
        })?,
        connection.on_notification(LogMessage::METHOD, |params| {
            let params: LogMessageParams = serde_json::from_value(params.unwrap_or(Value::Null))?;
            log_server_message("log", params.typ, &params.message);
            Ok(())
        })?,
        connection.on_notification(ShowMessage::METHOD, |params| {
            let params: ShowMessageParams = serde_json::from_value(params.unwrap_or(Value::Null))?;
            log_server_message("show", params.typ, &params.message);
            Ok(())
        })?,
    ];

    subscriptions.push(
        connection
            .on_close()
            .subscribe(|_| tracing::debug!("language server connection closed")),
    );
    subscriptions.push(connection.on_unhandled_notification().subscribe(|notification| {
        tracing::trace!(method = %notification.method, "ignoring server notification");
    }));
    Ok(subscriptions)
}

fn log_server_message(kind: &str, typ: MessageType, message: &str) {
    if typ == MessageType::ERROR {
        tracing::error!(target: "langbridge::server", kind, "{message}");
    } else if typ == MessageType::WARNING {
        tracing::warn!(target: "langbridge::server", kind, "{message}");
    } else if typ == MessageType::INFO {
        tracing::info!(target: "langbridge::server", kind, "{message}");
    } else {
        tracing::debug!(target: "langbridge::server", kind, "{message}");
    }
}
