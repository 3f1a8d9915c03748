//! Tracing setup and request-scoped spans.

use std::fmt::{self, Write as _};
use std::time::Duration;

use axum::http::{HeaderMap, Method};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Span, Subscriber, field, info_span};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::{JsonFields, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

const TRACEPARENT_HEADER: &str = "traceparent";

pub const GCP_PROJECT_ID_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/project/project-id";
const GCP_TRACE_KEY: &str = "logging.googleapis.com/trace";
const GCP_SPAN_ID_KEY: &str = "logging.googleapis.com/spanId";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Installs the global subscriber.
///
/// On Cloud Run (`K_SERVICE` set) lines are written in Cloud Logging's
/// structured format, see [`GcpFormat`]. `LOG_FORMAT=json` selects plain JSON
/// and anything else gets human-readable text. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_tracing(gcp_project_id: Option<String>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if on_cloud_run() {
        builder
            .fmt_fields(JsonFields::new())
            .event_format(GcpFormat::new(gcp_project_id))
            .init();
    } else if json_requested() {
        builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .init();
    } else {
        builder.init();
    }
}

pub fn on_cloud_run() -> bool {
    std::env::var("K_SERVICE").is_ok_and(|value| !value.is_empty())
}

fn json_requested() -> bool {
    std::env::var("LOG_FORMAT").is_ok_and(|value| value.eq_ignore_ascii_case("json"))
}

/// Asks the metadata server which project this instance runs in.
pub async fn fetch_gcp_project_id(
    http: &reqwest::Client,
    url: &str,
) -> Result<String, reqwest::Error> {
    let project_id = http
        .get(url)
        .header("Metadata-Flavor", "Google")
        .timeout(METADATA_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(project_id.trim().to_string())
}

/// One JSON object per event using the keys Cloud Logging understands:
/// `severity`, `message`, and the trace/span keys that link a line to its
/// request trace. Span fields are flattened into the line.
#[derive(Debug, Clone, Default)]
pub struct GcpFormat {
    project_id: Option<String>,
}

impl GcpFormat {
    pub fn new(project_id: Option<String>) -> Self {
        Self {
            project_id: project_id.filter(|id| !id.is_empty()),
        }
    }

    fn trace_resource(&self, trace_id: &str) -> String {
        match &self.project_id {
            Some(project) => format!("projects/{project}/traces/{trace_id}"),
            None => trace_id.to_string(),
        }
    }
}

fn severity(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        _ => "DEBUG",
    }
}

impl<S> FormatEvent<S, JsonFields> for GcpFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, JsonFields>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut line = Map::new();
        line.insert(
            "timestamp".into(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        line.insert("severity".into(), Value::String(severity(metadata.level()).into()));
        line.insert("target".into(), Value::String(metadata.target().into()));

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                let extensions = span.extensions();
                let Some(fields) = extensions.get::<FormattedFields<JsonFields>>() else {
                    continue;
                };
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&fields.fields) {
                    line.extend(map);
                }
            }
        }
        event.record(&mut FieldVisitor(&mut line));

        if let Some(Value::String(trace_id)) = line.remove("trace_id") {
            line.insert(GCP_TRACE_KEY.into(), Value::String(self.trace_resource(&trace_id)));
        }
        if let Some(span_id) = line.remove("span_id") {
            line.insert(GCP_SPAN_ID_KEY.into(), span_id);
        }

        writeln!(writer, "{}", Value::Object(line))
    }
}

struct FieldVisitor<'a>(&'a mut Map<String, Value>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().into(), Value::String(value.into()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().into(), Value::String(format!("{value:?}")));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

/// Parses a W3C `traceparent` value (`version-traceid-spanid-flags`).
/// Anything malformed yields `None`.
pub fn parse_traceparent(value: &str) -> Option<TraceContext> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;

    let is_hex =
        |part: &str, len: usize| part.len() == len && part.chars().all(|c| c.is_ascii_hexdigit());
    if !is_hex(version, 2) || !is_hex(trace_id, 32) || !is_hex(span_id, 16) || !is_hex(flags, 2) {
        return None;
    }
    if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
        return None;
    }

    Some(TraceContext {
        trace_id: trace_id.to_string(),
        span_id: span_id.to_string(),
    })
}

/// Span that every log line of one webhook request is emitted under.
pub fn request_span(method: &Method, path: &str, headers: &HeaderMap) -> Span {
    let span = info_span!(
        "request",
        method = %method,
        path,
        trace_id = field::Empty,
        span_id = field::Empty
    );

    let trace = headers
        .get(TRACEPARENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_traceparent);
    if let Some(trace) = trace {
        span.record("trace_id", trace.trace_id.as_str());
        span.record("span_id", trace.span_id.as_str());
    }

    span
}
