//! Message tracing.
//!
//! The tracer is purely observational: it formats every sent and received
//! message either as human-readable text or as a structured JSON record and
//! hands it to a [`Tracer`] sink. It never influences dispatch.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::messages::{
    LogTraceParams, NotificationMessage, RequestMessage, ResponseMessage, LOG_TRACE_METHOD,
};

/// Trace verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trace {
    #[default]
    Off,
    Messages,
    Verbose,
}

impl FromStr for Trace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "messages" => Ok(Self::Messages),
            "verbose" => Ok(Self::Verbose),
            other => Err(format!("invalid trace level: {other}")),
        }
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Messages => "messages",
            Self::Verbose => "verbose",
        })
    }
}

/// Output shape of traced messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for TraceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("invalid trace format: {other}")),
        }
    }
}

/// Structured trace record, emitted in [`TraceFormat::Json`].
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    #[serde(rename = "isLSPMessage")]
    pub is_lsp_message: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: Value,
    pub timestamp: u64,
}

/// Sink for trace output.
pub trait Tracer: Send + Sync {
    fn log(&self, message: &str, data: Option<&str>);

    fn log_record(&self, record: &TraceRecord) {
        match serde_json::to_string(record) {
            Ok(line) => self.log(&line, None),
            Err(e) => tracing::warn!("failed to serialize trace record: {e}"),
        }
    }
}

/// Default sink: forwards trace lines to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn log(&self, message: &str, data: Option<&str>) {
        match data {
            Some(data) => tracing::info!(target: "langbridge::trace", "{message}\n{data}"),
            None => tracing::info!(target: "langbridge::trace", "{message}"),
        }
    }
}

/// Formats connection traffic for a [`Tracer`].
#[derive(Clone, Default)]
pub struct MessageTracer {
    level: Trace,
    format: TraceFormat,
    sink: Option<Arc<dyn Tracer>>,
}

impl fmt::Debug for MessageTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTracer")
            .field("level", &self.level)
            .field("format", &self.format)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl MessageTracer {
    pub fn new(level: Trace, format: TraceFormat, sink: Arc<dyn Tracer>) -> Self {
        Self {
            level,
            format,
            sink: Some(sink),
        }
    }

    pub fn level(&self) -> Trace {
        self.level
    }

    fn active(&self) -> Option<&dyn Tracer> {
        if self.level == Trace::Off {
            return None;
        }
        self.sink.as_deref()
    }

    fn verbose(&self) -> bool {
        self.level == Trace::Verbose
    }

    fn record(&self, sink: &dyn Tracer, kind: &'static str, message: &impl Serialize) {
        let message = serde_json::to_value(message).unwrap_or(Value::Null);
        sink.log_record(&TraceRecord {
            is_lsp_message: true,
            kind,
            message,
            timestamp: now_millis(),
        });
    }

    pub fn sending_request(&self, request: &RequestMessage) {
        let Some(sink) = self.active() else { return };
        if self.format == TraceFormat::Json {
            return self.record(sink, "send-request", request);
        }
        let data = self.verbose().then(|| params_data(request.params.as_ref()));
        sink.log(
            &format!("Sending request '{} - ({})'.", request.method, request.id),
            data.as_deref(),
        );
    }

    pub fn sending_notification(&self, notification: &NotificationMessage) {
        let Some(sink) = self.active() else { return };
        if self.format == TraceFormat::Json {
            return self.record(sink, "send-notification", notification);
        }
        let data = self
            .verbose()
            .then(|| params_data(notification.params.as_ref()));
        sink.log(
            &format!("Sending notification '{}'.", notification.method),
            data.as_deref(),
        );
    }

    pub fn sending_response(&self, response: &ResponseMessage, method: &str, started: Instant) {
        let Some(sink) = self.active() else { return };
        if self.format == TraceFormat::Json {
            return self.record(sink, "send-response", response);
        }
        let id = response
            .id
            .as_ref()
            .map_or_else(|| "null".to_string(), ToString::to_string);
        let data = self.verbose().then(|| outcome_data(response)).flatten();
        sink.log(
            &format!(
                "Sending response '{method} - ({id})'. Processing request took {}ms",
                started.elapsed().as_millis()
            ),
            data.as_deref(),
        );
    }

    pub fn received_request(&self, request: &RequestMessage) {
        let Some(sink) = self.active() else { return };
        if self.format == TraceFormat::Json {
            return self.record(sink, "receive-request", request);
        }
        let data = self.verbose().then(|| params_data(request.params.as_ref()));
        sink.log(
            &format!("Received request '{} - ({})'.", request.method, request.id),
            data.as_deref(),
        );
    }

    pub fn received_notification(&self, notification: &NotificationMessage) {
        let Some(sink) = self.active() else { return };
        if notification.method == LOG_TRACE_METHOD {
            return;
        }
        if self.format == TraceFormat::Json {
            return self.record(sink, "receive-notification", notification);
        }
        let data = self
            .verbose()
            .then(|| params_data(notification.params.as_ref()));
        sink.log(
            &format!("Received notification '{}'.", notification.method),
            data.as_deref(),
        );
    }

    /// `pending` is the method and send time of the matching request, if any.
    pub fn received_response(&self, response: &ResponseMessage, pending: Option<(&str, Instant)>) {
        let Some(sink) = self.active() else { return };
        if self.format == TraceFormat::Json {
            return self.record(sink, "receive-response", response);
        }
        let id = response
            .id
            .as_ref()
            .map_or_else(|| "null".to_string(), ToString::to_string);
        let data = self.verbose().then(|| outcome_data(response)).flatten();
        let message = match pending {
            Some((method, sent)) => format!(
                "Received response '{method} - ({id})' in {}ms.",
                sent.elapsed().as_millis()
            ),
            None => format!("Received response {id} without active response promise."),
        };
        sink.log(&message, data.as_deref());
    }

    /// Forwards a `$/logTrace` notification from the peer.
    pub fn log_trace(&self, params: &LogTraceParams) {
        if let Some(sink) = self.active() {
            sink.log(&params.message, params.verbose.as_deref());
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn params_data(params: Option<&Value>) -> String {
    match params {
        Some(params) => format!("Params: {}\n\n", pretty(params)),
        None => "No parameters provided.\n\n".to_string(),
    }
}

fn outcome_data(response: &ResponseMessage) -> Option<String> {
    if let Some(error) = &response.error {
        let mut data = format!("Request failed: {} ({}).", error.message, error.code);
        if let Some(details) = &error.data {
            data.push_str(&format!("\nError data: {}", pretty(details)));
        }
        data.push_str("\n\n");
        return Some(data);
    }
    match &response.result {
        Some(Value::Null) | None => Some("No result returned.\n\n".to_string()),
        Some(result) => Some(format!("Result: {}\n\n", pretty(result))),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
