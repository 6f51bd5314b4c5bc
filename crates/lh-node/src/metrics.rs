//! # Counters
//!
//! Process-wide atomic counters per ingestion path, rendered as Prometheus
//! text on `/metrics`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct PathMetrics {
    pub path: &'static str,
    pub format: &'static str,
    requests: AtomicU64,
    errors: AtomicU64,
    rows: AtomicU64,
    skipped_lines: AtomicU64,
    duration_micros: AtomicU64,
}

impl PathMetrics {
    pub const fn new(path: &'static str, format: &'static str) -> Self {
        Self {
            path,
            format,
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            rows: AtomicU64::new(0),
            skipped_lines: AtomicU64::new(0),
            duration_micros: AtomicU64::new(0),
        }
    }

    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rows(&self, n: usize) {
        self.rows.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn skipped(&self, n: usize) {
        self.skipped_lines.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Accumulated only for successful requests.
    pub fn duration(&self, d: Duration) {
        self.duration_micros.fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn errors_total(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn rows_total(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn skipped_total(&self) -> u64 {
        self.skipped_lines.load(Ordering::Relaxed)
    }
}

pub static OPENTELEMETRY: PathMetrics = PathMetrics::new("/insert/opentelemetry/v1/logs", "opentelemetry");
pub static JSONLINE: PathMetrics = PathMetrics::new("/insert/jsonline", "jsonline");
pub static NATIVE: PathMetrics = PathMetrics::new("/insert/native", "native");
pub static INTERNAL_INSERT: PathMetrics = PathMetrics::new("/internal/insert", "native");

pub static SELECT_REQUESTS: AtomicU64 = AtomicU64::new(0);
pub static SELECT_ERRORS: AtomicU64 = AtomicU64::new(0);

fn all_paths() -> [&'static PathMetrics; 4] {
    [&OPENTELEMETRY, &JSONLINE, &NATIVE, &INTERNAL_INSERT]
}

/// Renders every counter plus the storage gauges passed in by the caller.
pub fn render(storage: Option<lh_store::StorageStats>) -> String {
    let mut body = String::new();

    let families: [(&str, &str, fn(&PathMetrics) -> u64); 5] = [
        ("lh_http_requests_total", "Ingestion requests received", |m| m.requests_total()),
        ("lh_http_errors_total", "Ingestion requests rejected", |m| m.errors_total()),
        ("lh_rows_ingested_total", "Rows accepted by ingestion", |m| m.rows_total()),
        ("lh_lines_skipped_total", "Malformed lines skipped", |m| m.skipped_total()),
        (
            "lh_http_request_duration_seconds_sum",
            "Time spent serving successful ingestion requests",
            |m| m.duration_micros.load(Ordering::Relaxed),
        ),
    ];
    for (name, help, get) in families {
        let _ = writeln!(body, "# HELP {} {}", name, help);
        let _ = writeln!(body, "# TYPE {} counter", name);
        for m in all_paths() {
            let value = get(m);
            if name.ends_with("_seconds_sum") {
                let _ = writeln!(
                    body,
                    "{}{{path=\"{}\",format=\"{}\"}} {}",
                    name,
                    m.path,
                    m.format,
                    value as f64 / 1e6
                );
            } else {
                let _ = writeln!(body, "{}{{path=\"{}\",format=\"{}\"}} {}", name, m.path, m.format, value);
            }
        }
    }

    body.push_str("# HELP lh_select_requests_total Query requests received\n");
    body.push_str("# TYPE lh_select_requests_total counter\n");
    let _ = writeln!(body, "lh_select_requests_total {}", SELECT_REQUESTS.load(Ordering::Relaxed));
    body.push_str("# HELP lh_select_errors_total Query requests failed\n");
    body.push_str("# TYPE lh_select_errors_total counter\n");
    let _ = writeln!(body, "lh_select_errors_total {}", SELECT_ERRORS.load(Ordering::Relaxed));

    if let Some(stats) = storage {
        let gauges = [
            ("lh_storage_pending_rows", stats.pending_rows),
            ("lh_storage_visible_rows", stats.visible_rows),
            ("lh_storage_parts", stats.parts),
            ("lh_storage_journal_bytes", stats.journal_bytes),
        ];
        for (name, value) in gauges {
            let _ = writeln!(body, "# TYPE {} gauge", name);
            let _ = writeln!(body, "{} {}", name, value);
        }
        body.push_str("# TYPE lh_storage_rows_added_total counter\n");
        let _ = writeln!(body, "lh_storage_rows_added_total {}", stats.rows_added_total);
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = PathMetrics::new("/test", "test");
        m.request();
        m.request();
        m.error();
        m.rows(5);
        m.skipped(2);
        assert_eq!(m.requests_total(), 2);
        assert_eq!(m.errors_total(), 1);
        assert_eq!(m.rows_total(), 5);
        assert_eq!(m.skipped_total(), 2);
    }

    #[test]
    fn test_render_contains_every_path() {
        let body = render(None);
        assert!(body.contains("# TYPE lh_http_requests_total counter"));
        assert!(body.contains("path=\"/insert/jsonline\""));
        assert!(body.contains("path=\"/insert/opentelemetry/v1/logs\""));
        assert!(!body.contains("lh_storage_parts"));
    }
}
