use chrono::Utc;
use crossbeam_channel::{self, RecvError, Sender};
use outdial_utils::get_hostname;
use serde::Serialize;
use std::{collections::BTreeMap, io::Write, thread};
use tracing::{
    field::{Field, Visit},
    level_filters::LevelFilter,
    Level, Subscriber,
};
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, Layer,
};

/// Writes to stderr from a dedicated thread. Lines are dropped rather than
/// blocking the caller when the thread falls behind.
#[derive(Clone)]
pub struct LogWriter {
    sender: Sender<Vec<u8>>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct LogSourceLocation {
    file: Option<String>,
    line: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct LogEntry<'a> {
    severity: LogSeverity,
    timestamp: String,
    hostname: &'a str,
    source_location: Option<LogSourceLocation>,
    json_payload: BTreeMap<&'static str, serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    /// Log entry has no assigned severity level
    #[default]
    Default,
    /// Debug or trace information
    Debug,
    /// Routine information, such as ongoing status or performance
    Info,
    /// Warning events might cause problems
    Warning,
    /// Error events are likely to cause problems
    Error,
}

impl From<&Level> for LogSeverity {
    fn from(level: &Level) -> Self {
        match *level {
            Level::DEBUG | Level::TRACE => Self::Debug,
            Level::INFO => Self::Info,
            Level::WARN => Self::Warning,
            Level::ERROR => Self::Error,
        }
    }
}

impl Default for LogWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl LogWriter {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(1000);
        thread::spawn(move || -> Result<usize, RecvError> {
            let mut stderr = std::io::stderr();
            loop {
                let data: Vec<u8> = receiver.recv()?;
                let _ = stderr.write_all(&data);
            }
        });
        Self { sender }
    }
}

impl std::io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.sender.try_send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default INFO
/// filter; `OUTDIAL_LOG_FORMAT=json` switches to one json entry per line.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let json = std::env::var("OUTDIAL_LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(JsonLayer::new(LogWriter::new()))
            .try_init();
        return;
    }

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
    std::mem::forget(guard);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .compact(),
        )
        .try_init();
}

struct JsonLayer {
    hostname: String,
    writer: LogWriter,
}

impl JsonLayer {
    fn new(writer: LogWriter) -> Self {
        let hostname = get_hostname().unwrap_or_default();
        Self { hostname, writer }
    }

    fn render(&self, event: &tracing::Event<'_>) -> Option<Vec<u8>> {
        let meta = event.metadata();
        let source_location = meta.file().map(|file| LogSourceLocation {
            file: Some(file.to_string()),
            line: meta.line().map(|line| line.to_string()),
        });
        let mut visitor = Visitor::new();
        if let Some(module_path) = meta.module_path() {
            visitor
                .values
                .insert("module_path", serde_json::Value::from(module_path));
        }
        event.record(&mut visitor);
        let entry = LogEntry {
            severity: LogSeverity::from(meta.level()),
            timestamp: Utc::now().to_rfc3339(),
            hostname: &self.hostname,
            source_location,
            json_payload: visitor.values,
        };
        let mut line = serde_json::to_vec(&entry).ok()?;
        line.push(b'\n');
        Some(line)
    }
}

impl<S> Layer<S> for JsonLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(line) = self.render(event) {
            let mut writer = self.writer.clone();
            let _ = writer.write_all(&line);
        }
    }
}

/// Collects the event's fields into json values
pub(crate) struct Visitor {
    values: BTreeMap<&'static str, serde_json::Value>,
}

impl Visitor {
    pub(crate) fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }
}

impl Visit for Visitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.values.insert(
            field.name(),
            serde_json::Value::from(format!("{:?}", value)),
        );
    }
}

impl std::fmt::Debug for Visitor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter
            .debug_struct("Visitor")
            .field("values", &self.values)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping() {
        assert_eq!(LogSeverity::from(&Level::TRACE), LogSeverity::Debug);
        assert_eq!(LogSeverity::from(&Level::INFO), LogSeverity::Info);
        assert_eq!(LogSeverity::from(&Level::WARN), LogSeverity::Warning);
        assert_eq!(LogSeverity::from(&Level::ERROR), LogSeverity::Error);
        assert_eq!(
            serde_json::to_value(LogSeverity::Warning).unwrap(),
            serde_json::json!("WARNING")
        );
    }

    #[test]
    fn json_layer_renders_fields() {
        use std::sync::{Arc, Mutex};

        struct Capture(Arc<Mutex<Vec<serde_json::Value>>>);

        impl<S> Layer<S> for Capture
        where
            S: Subscriber + for<'a> LookupSpan<'a>,
        {
            fn on_event(
                &self,
                event: &tracing::Event<'_>,
                _ctx: tracing_subscriber::layer::Context<'_, S>,
            ) {
                let layer = JsonLayer {
                    hostname: "test-host".to_string(),
                    writer: LogWriter::new(),
                };
                if let Some(line) = layer.render(event) {
                    self.0
                        .lock()
                        .unwrap()
                        .push(serde_json::from_slice(&line).unwrap());
                }
            }
        }

        let lines = Arc::new(Mutex::new(Vec::new()));
        let subscriber =
            tracing_subscriber::registry().with(Capture(lines.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(call_id = "c1", attempt = 3u64, "audio retry");
        });

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        let entry = &lines[0];
        assert_eq!(entry["severity"], "WARNING");
        assert_eq!(entry["hostname"], "test-host");
        assert_eq!(entry["jsonPayload"]["call_id"], "c1");
        assert_eq!(entry["jsonPayload"]["attempt"], 3);
        assert_eq!(entry["jsonPayload"]["message"], "audio retry");
    }
}
