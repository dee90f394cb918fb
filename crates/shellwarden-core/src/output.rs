//! Output Processor - decode, redact, buffer and meter raw shell output

use std::collections::VecDeque;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OutputConfig;
use crate::error::{Result, TerminalError};

/// Replacement for a redacted value
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// `<identifier><separator><value>`; only `value` is replaced
pub const DEFAULT_SENSITIVE_PATTERN: &str =
    r"(?i)\b[\w.-]*(?:password|passwd|token|secret|key)\s*[=:]\s*(?P<value>\S+)";

static DEFAULT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(DEFAULT_SENSITIVE_PATTERN).unwrap());

/// Crossing this share of the byte cap schedules a compaction
const COMPACTION_THRESHOLD: f64 = 0.8;

/// Target record size when compaction coalesces neighbours
const COMPACT_RECORD_BYTES: usize = 4096;

/// Performance snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMetrics {
    /// Processing time of the last chunk, milliseconds
    pub latency_ms: f64,
    /// Total redacted bytes produced since the last reset
    pub output_size: usize,
    /// Buffered bytes as a percent of the byte cap
    pub buffer_utilization: f64,
    /// Buffered bytes
    pub memory_usage: usize,
    /// Smoothed share of wall time spent processing, percent
    pub cpu_usage: f64,
    pub buffer_records: usize,
}

/// Turns raw chunks into redacted, bounded, metered text
///
/// The buffer obeys a record cap and a byte cap at once; the oldest records
/// are evicted until an incoming record fits both.
pub struct OutputProcessor {
    patterns: Vec<Regex>,
    buffer: VecDeque<String>,
    buffer_bytes: usize,
    max_records: usize,
    max_bytes: usize,
    /// Incomplete UTF-8 sequence carried from the previous chunk
    pending: Vec<u8>,
    metrics: OutputMetrics,
    last_chunk_at: Option<Instant>,
    compaction_pending: bool,
}

impl Default for OutputProcessor {
    fn default() -> Self {
        Self::new(OutputConfig::default())
    }
}

impl OutputProcessor {
    pub fn new(config: OutputConfig) -> Self {
        Self {
            patterns: vec![DEFAULT_PATTERN.clone()],
            buffer: VecDeque::new(),
            buffer_bytes: 0,
            max_records: config.max_records.max(1),
            max_bytes: config.max_bytes.max(1),
            pending: Vec::new(),
            metrics: OutputMetrics::default(),
            last_chunk_at: None,
            compaction_pending: false,
        }
    }

    /// Decode, redact, buffer and meter one raw chunk
    pub fn process_raw_output(&mut self, data: &[u8]) -> String {
        let started = Instant::now();

        if self.compaction_pending {
            self.compact();
        }

        let text = self.decode(data);
        let filtered = self.filter_sensitive_data(&text);
        self.add_to_buffer(&filtered);

        let latency = started.elapsed();
        self.metrics.latency_ms = latency.as_secs_f64() * 1000.0;
        self.metrics.output_size += filtered.len();
        if let Some(prev) = self.last_chunk_at {
            let wall = started.duration_since(prev).as_secs_f64();
            let sample = if wall > 0.0 {
                latency.as_secs_f64() / wall * 100.0
            } else {
                100.0
            };
            self.metrics.cpu_usage =
                (self.metrics.cpu_usage * 0.7 + sample * 0.3).clamp(0.0, 100.0);
        }
        self.last_chunk_at = Some(started);

        filtered
    }

    /// Replace every sensitive value with [`REDACTION_MARKER`]
    pub fn filter_sensitive_data(&self, text: &str) -> String {
        let mut filtered = text.to_string();
        for pattern in &self.patterns {
            filtered = pattern.replace_all(&filtered, redact).into_owned();
        }
        filtered
    }

    /// Add a redaction rule. A named group `value` limits the replacement to
    /// that group; otherwise the whole match is replaced.
    pub fn add_sensitive_pattern(&mut self, pattern: &str) -> Result<()> {
        let regex = Regex::new(pattern)
            .map_err(|e| TerminalError::InvalidConfig(format!("invalid pattern: {}", e)))?;
        if !self.patterns.iter().any(|p| p.as_str() == pattern) {
            self.patterns.push(regex);
        }
        Ok(())
    }

    /// Remove a rule by its source text. Returns false if it was absent.
    pub fn remove_sensitive_pattern(&mut self, pattern: &str) -> bool {
        let before = self.patterns.len();
        self.patterns.retain(|p| p.as_str() != pattern);
        self.patterns.len() != before
    }

    pub fn sensitive_patterns(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.as_str().to_string()).collect()
    }

    // ========== Buffer ==========

    /// Admit one record, evicting the oldest until both caps hold
    pub fn add_to_buffer(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }

        let was_above = self.above_compaction_threshold();
        let record = tail_within(text, self.max_bytes);
        while !self.buffer.is_empty()
            && (self.buffer.len() + 1 > self.max_records
                || self.buffer_bytes + record.len() > self.max_bytes)
        {
            self.evict_oldest();
        }

        self.buffer_bytes += record.len();
        self.buffer.push_back(record.to_string());

        if !was_above && !self.compaction_pending && self.above_compaction_threshold() {
            self.compaction_pending = true;
            debug!(
                buffer_bytes = self.buffer_bytes,
                max_bytes = self.max_bytes,
                "Output buffer compaction scheduled"
            );
        }
        self.sync_buffer_metrics();
    }

    /// Coalesce small neighbouring records. Contents are unchanged.
    pub fn compact(&mut self) {
        let before = self.buffer.len();
        let mut compacted: VecDeque<String> = VecDeque::with_capacity(before);
        for record in self.buffer.drain(..) {
            match compacted.back_mut() {
                Some(last) if last.len() + record.len() <= COMPACT_RECORD_BYTES => {
                    last.push_str(&record)
                }
                _ => compacted.push_back(record),
            }
        }
        compacted.shrink_to_fit();
        self.buffer = compacted;
        self.compaction_pending = false;
        self.sync_buffer_metrics();
        debug!(before, after = self.buffer.len(), "Output buffer compacted");
    }

    pub fn is_compaction_pending(&self) -> bool {
        self.compaction_pending
    }

    /// Buffered records concatenated in arrival order
    pub fn get_formatted_output(&self) -> String {
        let mut out = String::with_capacity(self.buffer_bytes);
        for record in &self.buffer {
            out.push_str(record);
        }
        out
    }

    pub fn get_buffer_contents(&self) -> Vec<String> {
        self.buffer.iter().cloned().collect()
    }

    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
        self.buffer_bytes = 0;
        self.compaction_pending = false;
        self.sync_buffer_metrics();
    }

    /// Number of buffered records
    pub fn get_buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Record cap
    pub fn get_max_buffer_size(&self) -> usize {
        self.max_records
    }

    pub fn get_buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    pub fn get_max_buffer_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Change the record cap and prune immediately
    pub fn set_max_buffer_size(&mut self, records: usize) {
        self.max_records = records.max(1);
        self.prune();
    }

    /// Change the byte cap and prune immediately
    pub fn set_max_buffer_bytes(&mut self, bytes: usize) {
        self.max_bytes = bytes.max(1);
        self.prune();
    }

    // ========== Metrics ==========

    pub fn get_metrics(&self) -> OutputMetrics {
        self.metrics.clone()
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = OutputMetrics::default();
        self.last_chunk_at = None;
        self.sync_buffer_metrics();
    }

    fn above_compaction_threshold(&self) -> bool {
        self.buffer_bytes as f64 >= self.max_bytes as f64 * COMPACTION_THRESHOLD
    }

    fn prune(&mut self) {
        while self.buffer.len() > self.max_records || self.buffer_bytes > self.max_bytes {
            self.evict_oldest();
        }
        self.sync_buffer_metrics();
    }

    fn evict_oldest(&mut self) {
        if let Some(old) = self.buffer.pop_front() {
            self.buffer_bytes -= old.len();
        }
    }

    fn sync_buffer_metrics(&mut self) {
        self.metrics.memory_usage = self.buffer_bytes;
        self.metrics.buffer_records = self.buffer.len();
        self.metrics.buffer_utilization =
            (self.buffer_bytes as f64 / self.max_bytes as f64 * 100.0).min(100.0);
    }

    /// UTF-8 decode, holding back an incomplete trailing sequence
    fn decode(&mut self, data: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(data);
        let complete = incomplete_tail_start(&bytes);
        self.pending = bytes.split_off(complete);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn redact(caps: &Captures<'_>) -> String {
    let whole = &caps[0];
    match caps.name("value") {
        Some(value) => {
            let start = value.start() - caps.get(0).map_or(0, |m| m.start());
            format!(
                "{}{}{}",
                &whole[..start],
                REDACTION_MARKER,
                &whole[start + value.as_str().len()..]
            )
        }
        None => REDACTION_MARKER.to_string(),
    }
}

/// Index where a truncated multi-byte sequence begins, or `bytes.len()`
fn incomplete_tail_start(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let b = bytes[len - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => 1,
        };
        return if needed > back { len - back } else { len };
    }
    len
}

/// The last at most `max_bytes` bytes of `text`, starting on a char boundary
fn tail_within(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
