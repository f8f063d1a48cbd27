//! One-shot usage recorder for a single gateway call.

use keyward_storage::{Database, NewUsage, UsageStatus};
use tracing::{debug, warn};

use crate::extractor::ExtractedUsage;

/// Writes the usage record of one forwarded request.
///
/// `record` takes `self`, so a meter can write at most once. A meter dropped
/// without recording (the caller went away mid-request) writes a zero-token
/// error record for the request model, so every forwarded call leaves
/// exactly one row.
pub struct UsageMeter {
    pending: Option<PendingUsage>,
}

struct PendingUsage {
    db: Database,
    app_id: String,
    app_name: String,
    key_name: String,
    endpoint: String,
    model: String,
}

impl PendingUsage {
    fn write(self, usage: ExtractedUsage, status: UsageStatus) {
        let result = self.db.record_usage(NewUsage {
            app_id: self.app_id,
            app_name: self.app_name,
            key_name: self.key_name,
            model: usage.model,
            prompt_tokens: usage.prompt_tokens,
            output_tokens: usage.output_tokens,
            endpoint: self.endpoint,
            status,
        });

        if let Err(e) = result {
            warn!(error = %e, "Failed to record usage");
        }
    }

    fn zero_usage(&self) -> ExtractedUsage {
        ExtractedUsage {
            model: self.model.clone(),
            prompt_tokens: 0,
            output_tokens: 0,
        }
    }
}

impl UsageMeter {
    /// `model` is the request model, used when no usage is ever extracted.
    pub fn new(
        db: Database,
        app_id: impl Into<String>,
        app_name: impl Into<String>,
        key_name: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            pending: Some(PendingUsage {
                db,
                app_id: app_id.into(),
                app_name: app_name.into(),
                key_name: key_name.into(),
                endpoint: endpoint.into(),
                model: model.into(),
            }),
        }
    }

    /// Append the record. Ledger failures are logged and swallowed.
    pub fn record(mut self, usage: ExtractedUsage, status: UsageStatus) {
        if let Some(pending) = self.pending.take() {
            pending.write(usage, status);
        }
    }

    /// Append a zero-token error record for a call that never got usage.
    pub fn record_failure(mut self) {
        if let Some(pending) = self.pending.take() {
            let usage = pending.zero_usage();
            pending.write(usage, UsageStatus::Error);
        }
    }
}

impl Drop for UsageMeter {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(app_id = %pending.app_id, endpoint = %pending.endpoint, "Request abandoned before usage was recorded");
            let usage = pending.zero_usage();
            pending.write(usage, UsageStatus::Error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_writes_one_entry() {
        let db = Database::in_memory().unwrap();
        let meter = UsageMeter::new(db.clone(), "app-1", "demo", "openai", "/chat/completions", "gpt-4");

        meter.record(
            ExtractedUsage {
                model: "gpt-4".to_string(),
                prompt_tokens: 1000,
                output_tokens: 1000,
            },
            UsageStatus::Success,
        );

        let page = db.usage_list(1, 50).unwrap();
        assert_eq!(page.total, 1);
        let record = &page.records[0];
        assert_eq!(record.app_name, "demo");
        assert_eq!(record.total_tokens, 2000);
        assert!((record.cost - 0.09).abs() < 1e-9);
        assert_eq!(record.status, UsageStatus::Success);
    }

    #[test]
    fn test_record_failure_is_zero_error() {
        let db = Database::in_memory().unwrap();
        UsageMeter::new(db.clone(), "app-1", "demo", "openai", "/x", "gpt-4").record_failure();

        let record = &db.usage_list(1, 50).unwrap().records[0];
        assert_eq!(record.total_tokens, 0);
        assert_eq!(record.status, UsageStatus::Error);
        assert_eq!(record.model, "gpt-4");
    }

    #[test]
    fn test_dropped_meter_records_error() {
        let db = Database::in_memory().unwrap();
        let meter = UsageMeter::new(db.clone(), "app-1", "demo", "openai", "/x", "gpt-4o");
        drop(meter);

        let page = db.usage_list(1, 50).unwrap();
        assert_eq!(page.total, 1);
        let record = &page.records[0];
        assert_eq!(record.model, "gpt-4o");
        assert_eq!(record.total_tokens, 0);
        assert_eq!(record.status, UsageStatus::Error);
    }

    #[test]
    fn test_record_then_drop_writes_once() {
        let db = Database::in_memory().unwrap();
        let meter = UsageMeter::new(db.clone(), "app-1", "demo", "openai", "/x", "gpt-4");
        meter.record(
            ExtractedUsage {
                model: "gpt-4".to_string(),
                prompt_tokens: 1,
                output_tokens: 1,
            },
            UsageStatus::Success,
        );

        assert_eq!(db.usage_list(1, 50).unwrap().total, 1);
    }
}
