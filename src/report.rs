//! The storage collaborator boundary. The pipeline hands finished
//! classifications to a [`ReportSink`] and never touches storage itself.

use serde::Serialize;

use crate::protocol::{Endpoint, login::ServerClassification};

#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub endpoint: Endpoint,
    pub classification: ServerClassification,
    /// The raw status response, when the host answered one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
}

pub trait ReportSink: Send + Sync {
    fn submit(&self, report: ServerReport);
}

/// Emits each report as a structured log line.
#[derive(Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn submit(&self, report: ServerReport) {
        tracing::info!(
            addr = %report.endpoint,
            classification = %report.classification,
            has_status = report.status.is_some(),
            "classified server"
        );
    }
}

/// Appends reports as JSON lines to a shared writer.
pub struct JsonLinesSink<W: std::io::Write + Send> {
    writer: parking_lot::Mutex<W>,
}

impl<W: std::io::Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: parking_lot::Mutex::new(writer),
        }
    }
}

impl<W: std::io::Write + Send> ReportSink for JsonLinesSink<W> {
    fn submit(&self, report: ServerReport) {
        let mut writer = self.writer.lock();
        if let Ok(line) = serde_json::to_string(&report) {
            if let Err(err) = writeln!(writer, "{line}") {
                tracing::error!(%err, "failed to write report");
            }
        }
    }
}
