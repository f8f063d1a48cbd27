//! Usage extraction from provider requests and responses.
//!
//! Both OpenAI-style (`prompt_tokens` / `completion_tokens`) and
//! Anthropic-style (`input_tokens` / `output_tokens`) usage objects are
//! understood, at the top level or nested under `message` as in Anthropic's
//! `message_start` event.

use bytes::BytesMut;
use serde_json::Value;
use tracing::warn;

/// Model name used when neither request nor response names one.
pub const UNKNOWN_MODEL: &str = "unknown";

/// An SSE line longer than this is dropped rather than buffered further.
const MAX_LINE_BUFFER: usize = 1024 * 1024;

/// Token counts and model extracted from one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedUsage {
    pub model: String,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
}

/// The `model` string of a JSON request body, or `"unknown"`.
pub fn extract_model(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|json| json.get("model")?.as_str().map(str::to_string))
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| UNKNOWN_MODEL.to_string())
}

/// Usage from a complete (non-streaming) JSON response.
///
/// The response's `model` wins over `request_model`. Bodies that are not JSON
/// or carry no usage yield zero counts.
pub fn extract_buffered_usage(body: &[u8], request_model: &str) -> ExtractedUsage {
    let mut extractor = UsageExtractor::new(request_model);
    if let Ok(json) = serde_json::from_slice::<Value>(body) {
        extractor.apply(&json);
    }
    extractor.finish()
}

/// Incremental usage parser for an SSE stream.
///
/// Feed raw chunks with [`ingest`](Self::ingest); chunk boundaries may fall
/// anywhere, including inside a line. [`finish`](Self::finish) processes any
/// trailing partial line and returns the last-seen counts, so a stream cut
/// short still reports the usage it got through.
#[derive(Debug)]
pub struct UsageExtractor {
    buffer: BytesMut,
    prompt_tokens: u64,
    output_tokens: u64,
    model: String,
}

impl UsageExtractor {
    /// Start with the model named in the request.
    pub fn new(request_model: impl Into<String>) -> Self {
        Self {
            buffer: BytesMut::new(),
            prompt_tokens: 0,
            output_tokens: 0,
            model: request_model.into(),
        }
    }

    /// Consume one chunk of the stream.
    pub fn ingest(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            self.process_line(&String::from_utf8_lossy(&line));
        }

        if self.buffer.len() > MAX_LINE_BUFFER {
            warn!(len = self.buffer.len(), "SSE line too long, discarding");
            self.buffer.clear();
        }
    }

    /// Flush the trailing partial line and return the collected usage.
    pub fn finish(mut self) -> ExtractedUsage {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            self.process_line(&String::from_utf8_lossy(&rest));
        }

        ExtractedUsage {
            model: self.model,
            prompt_tokens: self.prompt_tokens,
            output_tokens: self.output_tokens,
        }
    }

    fn process_line(&mut self, line: &str) {
        let Some(data) = line.trim_end().strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return;
        }

        if let Ok(json) = serde_json::from_str::<Value>(data) {
            self.apply(&json);
        }
    }

    /// Fold one JSON event (or full response) into the running counts.
    fn apply(&mut self, json: &Value) {
        let message = json.get("message");

        if let Some(model) = json
            .get("model")
            .or_else(|| message.and_then(|m| m.get("model")))
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
        {
            self.model = model.to_string();
        }

        for usage in [
            json.get("usage"),
            message.and_then(|m| m.get("usage")),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(prompt) = token_count(usage, &["prompt_tokens", "input_tokens"]) {
                self.prompt_tokens = prompt;
            }
            if let Some(output) = token_count(usage, &["completion_tokens", "output_tokens"]) {
                self.output_tokens = output;
            }
        }
    }
}

fn token_count(usage: &Value, names: &[&str]) -> Option<u64> {
    names.iter().find_map(|name| {
        let value = usage.get(*name)?;
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    })
}
