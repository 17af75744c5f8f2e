//! Structured JSONL logs for harness runs.
//!
//! Provides:
//! - [`LogEntry`]: canonical JSONL record with required + optional fields.
//! - [`LogEmitter`]: writes JSONL lines to a file or an in-memory buffer.
//! - [`ArtifactIndex`]: links logs to run artifacts with SHA-256 integrity.
//! - [`validate_log_line`] / [`validate_log_file`]: schema checks.
//!
//! Core lifecycle records convert into entries with [`LogEntry::from_record`];
//! harness-level events (run start, invariant failures, summaries) are built
//! directly.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use hotbin_core::LifecycleRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<hotbin_core::LogLevel> for LogLevel {
    fn from(level: hotbin_core::LogLevel) -> Self {
        match level {
            hotbin_core::LogLevel::Trace => Self::Trace,
            hotbin_core::LogLevel::Debug => Self::Debug,
            hotbin_core::LogLevel::Info => Self::Info,
            hotbin_core::LogLevel::Warn => Self::Warn,
            hotbin_core::LogLevel::Error => Self::Error,
        }
    }
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Operation that produced the record (`tcache_fill`, `hook_register`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcache_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binind: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_refs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            run_id: None,
            symbol: None,
            decision_id: None,
            thread: None,
            tcache_id: None,
            binind: None,
            count: None,
            outcome: None,
            duration_ms: None,
            artifact_refs: None,
            details: None,
        }
    }

    /// Convert a core lifecycle record. `details` strings of `k=v;k=v` pairs
    /// become a JSON object; anything else is kept as a string.
    #[must_use]
    pub fn from_record(record: &LifecycleRecord) -> Self {
        let mut entry = Self::new(&record.trace_id, record.level.into(), record.event);
        entry.symbol = Some(record.symbol.to_string());
        entry.decision_id = Some(record.decision_id);
        entry.tcache_id = record.tcache_id;
        entry.binind = record.binind;
        entry.count = record.count;
        entry.outcome = Some(record.outcome.to_string());
        if !record.details.is_empty() {
            entry.details = Some(details_value(&record.details));
        }
        entry
    }

    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    #[must_use]
    pub fn with_thread(mut self, thread: usize) -> Self {
        self.thread = Some(thread);
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Set duration in milliseconds.
    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_artifacts(mut self, refs: Vec<String>) -> Self {
        self.artifact_refs = Some(refs);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn details_value(details: &str) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for pair in details.split(';').filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return serde_json::Value::String(details.to_string());
        };
        let value = value
            .parse::<u64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        map.insert(key.to_string(), value);
    }
    serde_json::Value::Object(map)
}

// ---------------------------------------------------------------------------
// Artifact index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: String,
    pub kind: String,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Artifact index linking logs to run artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub index_version: u32,
    pub run_id: String,
    pub generated_utc: String,
    pub artifacts: Vec<ArtifactEntry>,
}

impl ArtifactIndex {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            index_version: 1,
            run_id: run_id.into(),
            generated_utc: now_utc(),
            artifacts: Vec::new(),
        }
    }

    /// Add an entry for in-memory `contents`, digesting them.
    pub fn add_bytes(
        &mut self,
        path: impl Into<String>,
        kind: impl Into<String>,
        contents: &[u8],
    ) -> &mut Self {
        self.artifacts.push(ArtifactEntry {
            path: path.into(),
            kind: kind.into(),
            sha256: sha256_hex(contents),
            size_bytes: Some(contents.len() as u64),
            description: None,
        });
        self
    }

    /// Add an entry for the file at `path`, digesting its current contents.
    pub fn add_file(&mut self, path: &Path, kind: impl Into<String>) -> std::io::Result<&mut Self> {
        let contents = std::fs::read(path)?;
        Ok(self.add_bytes(path.display().to_string(), kind, &contents))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Lowercase hex SHA-256 digest.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// In-memory sink shared with a [`LogEmitter`] built by
/// [`LogEmitter::to_buffer`].
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Contents written so far, lossily decoded.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Writes structured JSONL log entries.
pub struct LogEmitter {
    writer: Box<dyn Write>,
    seq: u64,
    run_id: String,
    lines: u64,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::to_writer(Box::new(std::io::BufWriter::new(file)), run_id))
    }

    /// Create an emitter over an in-memory buffer, returning a handle to read
    /// it back.
    #[must_use]
    pub fn to_buffer(run_id: &str) -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::default();
        (Self::to_writer(Box::new(buffer.clone()), run_id), buffer)
    }

    #[must_use]
    pub fn to_writer(writer: Box<dyn Write>, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            run_id: run_id.to_string(),
            lines: 0,
        }
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("harness::{}::{:03}", self.run_id, self.seq)
    }

    /// Emit a harness event with an auto-generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(trace_id, level, event).with_run(&self.run_id);
        self.write_entry(&entry)?;
        Ok(entry)
    }

    /// Emit a fully-populated entry, filling in the trace and run ids if
    /// missing.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.run_id.is_none() {
            entry.run_id = Some(self.run_id.clone());
        }
        self.write_entry(&entry)
    }

    /// Emit every record in order.
    pub fn emit_records(&mut self, records: &[LifecycleRecord]) -> std::io::Result<()> {
        for record in records {
            self.emit_entry(LogEntry::from_record(record))?;
        }
        Ok(())
    }

    fn write_entry(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        self.lines += 1;
        Ok(())
    }

    /// Lines written so far.
    #[must_use]
    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validate a single JSONL line against the schema.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();
    let mut fail = |field: &str, message: String| {
        errors.push(LogValidationError {
            line_number,
            field: field.to_string(),
            message,
        });
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            fail("<json>", format!("invalid JSON: {e}"));
            return Err(errors);
        }
    };
    let Some(obj) = value.as_object() else {
        fail("<root>", "expected JSON object".to_string());
        return Err(errors);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            fail(field, "required field missing".to_string());
        }
    }

    match obj.get("level").and_then(|v| v.as_str()) {
        Some(level) if !LEVELS.contains(&level) => fail("level", format!("invalid level: '{level}'")),
        _ => {}
    }

    match obj.get("trace_id").and_then(|v| v.as_str()) {
        Some(trace_id) if !trace_id.contains("::") => fail(
            "trace_id",
            format!("trace_id should be `::`-separated, got: '{trace_id}'"),
        ),
        _ => {}
    }

    // Records that came from the core always carry their decision id.
    if obj.contains_key("symbol") && obj.contains_key("decision_id") {
        match obj.get("decision_id").and_then(serde_json::Value::as_u64) {
            Some(0) | None => fail("decision_id", "decision_id must be a positive integer".to_string()),
            Some(_) => {}
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    match serde_json::from_value::<LogEntry>(value) {
        Ok(entry) => Ok(entry),
        Err(e) => {
            errors.push(LogValidationError {
                line_number,
                field: "<deserialization>".to_string(),
                message: format!("failed to deserialize: {e}"),
            });
            Err(errors)
        }
    }
}

/// Validate an entire JSONL file. Returns the non-empty line count and any
/// validation errors found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    Ok(validate_log_str(&content))
}

#[must_use]
pub fn validate_log_str(content: &str) -> (usize, Vec<LogValidationError>) {
    let mut all_errors = Vec::new();
    let mut line_count = 0;
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }
    (line_count, all_errors)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    // Approximate calendar fields; ordering and uniqueness are what matter.
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        1970 + secs / 31_557_600,
        (secs % 31_557_600) / 2_629_800 + 1,
        (secs % 2_629_800) / 86400 + 1,
        (secs % 86400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        millis,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(details: &str) -> LifecycleRecord {
        let mut record = LifecycleRecord::new(hotbin_core::LogLevel::Debug, "tcache_gc", "flush", "flushed")
            .with_tcache(3)
            .with_bin(5)
            .with_count(12)
            .with_details(details);
        record.decision_id = 9;
        record.trace_id = "core::tcache::tcache_gc::0000000000000009".to_string();
        record
    }

    #[test]
    fn entry_serializes_required_fields_only() {
        let entry = LogEntry::new("harness::run-1::001", LogLevel::Info, "run_start");
        let parsed: serde_json::Value = serde_json::from_str(&entry.to_jsonl().unwrap()).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["trace_id"], "harness::run-1::001");
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "run_start");
        assert!(parsed.get("symbol").is_none());
        assert!(parsed.get("details").is_none());
    }

    #[test]
    fn core_records_convert_with_structured_details() {
        let entry = LogEntry::from_record(&record("nflush=12;remote=true"));
        let parsed: serde_json::Value = serde_json::from_str(&entry.to_jsonl().unwrap()).unwrap();
        assert_eq!(parsed["level"], "debug");
        assert_eq!(parsed["event"], "flush");
        assert_eq!(parsed["symbol"], "tcache_gc");
        assert_eq!(parsed["decision_id"], 9);
        assert_eq!(parsed["tcache_id"], 3);
        assert_eq!(parsed["binind"], 5);
        assert_eq!(parsed["count"], 12);
        assert_eq!(parsed["outcome"], "flushed");
        assert_eq!(parsed["details"]["nflush"], 12);
        assert_eq!(parsed["details"]["remote"], "true");
    }

    #[test]
    fn unstructured_details_stay_strings() {
        let entry = LogEntry::from_record(&record("out of memory"));
        assert_eq!(entry.details, Some(serde_json::json!("out of memory")));
    }

    #[test]
    fn shared_buffer_clones_see_every_write() {
        let buffer = SharedBuffer::default();
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let mut sink = buffer.clone();
                std::thread::spawn(move || writeln!(sink, "line {i}").unwrap())
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        let contents = buffer.contents();
        assert_eq!(contents.lines().count(), 4);
        for i in 0..4 {
            assert!(contents.contains(&format!("line {i}")));
        }
    }

    #[test]
    fn emitter_numbers_trace_ids_and_buffers_output() {
        let (mut emitter, buffer) = LogEmitter::to_buffer("run-42");
        let e1 = emitter.emit(LogLevel::Info, "start").unwrap();
        emitter.emit_records(&[record("")]).unwrap();
        let e2 = emitter.emit(LogLevel::Info, "end").unwrap();
        assert_eq!(e1.trace_id, "harness::run-42::001");
        assert_eq!(e2.trace_id, "harness::run-42::002");
        assert_eq!(emitter.lines(), 3);

        let (lines, errors) = validate_log_str(&buffer.contents());
        assert_eq!(lines, 3);
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn validation_reports_each_problem() {
        let missing = r#"{"timestamp":"t","level":"info","event":"x"}"#;
        let errors = validate_log_line(missing, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"));

        let bad_level = r#"{"timestamp":"t","trace_id":"a::b","level":"fatal","event":"x"}"#;
        let errors = validate_log_line(bad_level, 2).unwrap_err();
        assert_eq!(errors[0].field, "level");
        assert_eq!(errors[0].line_number, 2);

        let bad_trace = r#"{"timestamp":"t","trace_id":"flat","level":"info","event":"x"}"#;
        assert_eq!(validate_log_line(bad_trace, 3).unwrap_err()[0].field, "trace_id");

        let zero_decision =
            r#"{"timestamp":"t","trace_id":"a::b","level":"info","event":"x","symbol":"s","decision_id":0}"#;
        assert_eq!(validate_log_line(zero_decision, 4).unwrap_err()[0].field, "decision_id");

        assert_eq!(validate_log_line("not json", 5).unwrap_err()[0].field, "<json>");
        assert_eq!(validate_log_line("[1]", 6).unwrap_err()[0].field, "<root>");
    }

    #[test]
    fn artifact_index_digests_contents() {
        let mut idx = ArtifactIndex::new("run-001");
        idx.add_bytes("logs/run.jsonl", "log", b"abc");
        let parsed: serde_json::Value = serde_json::from_str(&idx.to_json().unwrap()).unwrap();
        assert_eq!(parsed["index_version"], 1);
        assert_eq!(parsed["run_id"], "run-001");
        let entry = &parsed["artifacts"][0];
        assert_eq!(
            entry["sha256"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(entry["size_bytes"], 3);
    }
}
