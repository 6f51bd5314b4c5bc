//! # lh
//!
//! Command-line client for a Loggerhead cluster.
//!
//! - `lh query '<logsql>'` streams matching rows as JSON lines.
//! - `lh facets '<logsql>'` prints the most frequent values per field.
//! - `lh stats` / `lh stats-range` print stats results as tables.
//! - `lh ingest` sends JSON lines, native or OTLP protobuf from a file or stdin.
//! - `lh flush` makes everything ingested so far searchable.

use std::io::{Read, Write};
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use serde::Deserialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Loggerhead command-line client.
#[derive(Parser)]
#[command(name = "lh", version, about, long_about = None)]
struct Cli {
    /// Node address. Defaults to $LH_ADDR or http://127.0.0.1:9428.
    #[arg(long, global = true)]
    addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a LogsQL query and print the rows.
    Query {
        query: String,
        #[arg(long)]
        limit: Option<u64>,
        #[command(flatten)]
        range: TimeRange,
    },

    /// Most frequent values per field.
    Facets {
        #[arg(default_value = "*")]
        query: String,
        /// Values to keep per field.
        #[arg(long)]
        limit: Option<u64>,
        /// Also show fields with a single value across all rows.
        #[arg(long)]
        keep_const_fields: bool,
        #[command(flatten)]
        range: TimeRange,
    },

    /// Evaluate a stats query at one point in time.
    Stats {
        query: String,
        /// Evaluation time; defaults to now.
        #[arg(long)]
        time: Option<String>,
    },

    /// Evaluate a stats query over a range, bucketed by `step`.
    StatsRange {
        query: String,
        #[arg(long, default_value = "1m")]
        step: String,
        #[command(flatten)]
        range: TimeRange,
    },

    /// Send logs to an insert endpoint.
    Ingest {
        /// File to read; stdin when absent.
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = IngestFormat::Jsonline)]
        format: IngestFormat,
        /// Comma-separated stream fields.
        #[arg(long)]
        stream_fields: Option<String>,
        /// Comma-separated message fields, highest priority first.
        #[arg(long)]
        msg_field: Option<String>,
        /// Comma-separated timestamp fields, highest priority first.
        #[arg(long)]
        time_field: Option<String>,
    },

    /// Make every ingested row searchable.
    Flush,
}

#[derive(clap::Args, Default)]
struct TimeRange {
    /// Lower time bound, e.g. `1h` (ago) or RFC 3339.
    #[arg(long)]
    start: Option<String>,
    /// Upper time bound.
    #[arg(long)]
    end: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum IngestFormat {
    Jsonline,
    Native,
    Otlp,
}

impl IngestFormat {
    fn path(self) -> &'static str {
        match self {
            Self::Jsonline => "/insert/jsonline",
            Self::Native => "/insert/native?version=v1",
            Self::Otlp => "/insert/opentelemetry/v1/logs",
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Self::Jsonline => "application/stream+json",
            Self::Native | Self::Otlp => "application/x-protobuf",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let base_url = base_url(cli.addr.or_else(|| std::env::var("LH_ADDR").ok()));

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: cannot start runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(&base_url, cli.command)) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn base_url(addr: Option<String>) -> String {
    let addr = addr.unwrap_or_else(|| "127.0.0.1:9428".to_string());
    let addr = addr.trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

async fn run(base_url: &str, cmd: Commands) -> CliResult<()> {
    let client = reqwest::Client::new();

    match cmd {
        Commands::Query { query, limit, range } => {
            let mut form = vec![("query", query)];
            if let Some(limit) = limit {
                form.push(("limit", limit.to_string()));
            }
            range.push_into(&mut form);
            let resp = check(
                client
                    .post(format!("{}/select/logsql/query", base_url))
                    .form(&form)
                    .send()
                    .await?,
            )
            .await?;

            // Rows arrive as JSON lines; pass them through as they come.
            let mut stdout = std::io::stdout().lock();
            let mut body = resp.bytes_stream();
            while let Some(chunk) = body.next().await {
                stdout.write_all(&chunk?)?;
            }
            stdout.flush()?;
        }

        Commands::Facets {
            query,
            limit,
            keep_const_fields,
            range,
        } => {
            let mut form = vec![("query", query)];
            if let Some(limit) = limit {
                form.push(("limit", limit.to_string()));
            }
            if keep_const_fields {
                form.push(("keep_const_fields", "1".to_string()));
            }
            range.push_into(&mut form);
            let resp: FacetsResponse = check(
                client
                    .post(format!("{}/select/logsql/facets", base_url))
                    .form(&form)
                    .send()
                    .await?,
            )
            .await?
            .json()
            .await?;
            println!("{}", Table::new(facet_rows(resp)).with(Style::psql()));
        }

        Commands::Stats { query, time } => {
            let mut form = vec![("query", query)];
            if let Some(time) = time {
                form.push(("time", time));
            }
            let resp: StatsResponse = check(
                client
                    .post(format!("{}/select/logsql/stats_query", base_url))
                    .form(&form)
                    .send()
                    .await?,
            )
            .await?
            .json()
            .await?;
            println!("{}", Table::new(stats_rows(resp)).with(Style::psql()));
        }

        Commands::StatsRange { query, step, range } => {
            let mut form = vec![("query", query), ("step", step)];
            range.push_into(&mut form);
            let resp: StatsResponse = check(
                client
                    .post(format!("{}/select/logsql/stats_query_range", base_url))
                    .form(&form)
                    .send()
                    .await?,
            )
            .await?
            .json()
            .await?;
            println!("{}", Table::new(stats_rows(resp)).with(Style::psql()));
        }

        Commands::Ingest {
            file,
            format,
            stream_fields,
            msg_field,
            time_field,
        } => {
            let body = match file {
                Some(path) => std::fs::read(&path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let mut args = Vec::new();
            if let Some(v) = stream_fields {
                args.push(("_stream_fields", v));
            }
            if let Some(v) = msg_field {
                args.push(("_msg_field", v));
            }
            if let Some(v) = time_field {
                args.push(("_time_field", v));
            }
            let bytes = body.len();
            check(
                client
                    .post(format!("{}{}", base_url, format.path()))
                    .query(&args)
                    .header("Content-Type", format.content_type())
                    .body(body)
                    .send()
                    .await?,
            )
            .await?;
            eprintln!("sent {} bytes", bytes);
        }

        Commands::Flush => {
            check(client.get(format!("{}/internal/force_flush", base_url)).send().await?).await?;
            eprintln!("flushed");
        }
    }
    Ok(())
}

impl TimeRange {
    fn push_into(self, form: &mut Vec<(&'static str, String)>) {
        if let Some(start) = self.start {
            form.push(("start", start));
        }
        if let Some(end) = self.end {
            form.push(("end", end));
        }
    }
}

/// Turns a non-2xx response into an error carrying the server's message.
async fn check(resp: reqwest::Response) -> CliResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(format!("{}: {}", status, text.trim()).into())
}

// =============================================================================
// Output
// =============================================================================

#[derive(Deserialize)]
struct FacetsResponse {
    facets: Vec<FieldFacets>,
}

#[derive(Deserialize)]
struct FieldFacets {
    field_name: String,
    values: Vec<FacetValue>,
}

#[derive(Deserialize)]
struct FacetValue {
    field_value: String,
    hits: u64,
}

#[derive(Tabled, Debug, PartialEq)]
struct FacetRow {
    field: String,
    value: String,
    hits: u64,
}

fn facet_rows(resp: FacetsResponse) -> Vec<FacetRow> {
    resp.facets
        .into_iter()
        .flat_map(|f| {
            let field = f.field_name;
            f.values.into_iter().map(move |v| FacetRow {
                field: field.clone(),
                value: v.field_value,
                hits: v.hits,
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct StatsResponse {
    data: StatsData,
}

#[derive(Deserialize)]
struct StatsData {
    result: Vec<StatsSeries>,
}

#[derive(Deserialize)]
struct StatsSeries {
    metric: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    value: Option<(serde_json::Value, String)>,
    #[serde(default)]
    values: Vec<(serde_json::Value, String)>,
}

#[derive(Tabled, Debug, PartialEq)]
struct StatsRow {
    time: String,
    name: String,
    labels: String,
    value: String,
}

/// One table row per sample, for both vector and matrix results.
fn stats_rows(resp: StatsResponse) -> Vec<StatsRow> {
    let mut rows = Vec::new();
    for series in resp.data.result {
        let name = series
            .metric
            .get("__name__")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let labels = series
            .metric
            .iter()
            .filter(|(k, _)| k.as_str() != "__name__")
            .map(|(k, v)| format!("{}={}", k, v.as_str().map_or_else(|| v.to_string(), str::to_string)))
            .collect::<Vec<_>>()
            .join(",");
        for (ts, value) in series.value.into_iter().chain(series.values) {
            rows.push(StatsRow {
                time: format_ts(&ts),
                name: name.clone(),
                labels: labels.clone(),
                value,
            });
        }
    }
    rows
}

fn format_ts(ts: &serde_json::Value) -> String {
    let Some(secs) = ts.as_f64() else {
        return ts.to_string();
    };
    let nanos = (secs * 1e9).round() as i64;
    Utc.timestamp_nanos(nanos).to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url(None), "http://127.0.0.1:9428");
        assert_eq!(base_url(Some("logs:9428/".into())), "http://logs:9428");
        assert_eq!(base_url(Some("https://logs".into())), "https://logs");
    }

    #[test]
    fn test_facet_rows() {
        let resp: FacetsResponse = serde_json::from_str(
            r#"{"facets":[{"field_name":"x","values":[{"field_value":"y","hits":4},{"field_value":"z","hits":1}]}]}"#,
        )
        .unwrap();
        let rows = facet_rows(resp);
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1],
            FacetRow {
                field: "x".into(),
                value: "z".into(),
                hits: 1
            }
        );
    }

    #[test]
    fn test_stats_rows_vector_and_matrix() {
        let vector: StatsResponse = serde_json::from_str(
            r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{"__name__":"n","host":"h1"},"value":[60,"3"]}]}}"#,
        )
        .unwrap();
        let rows = stats_rows(vector);
        assert_eq!(
            rows,
            vec![StatsRow {
                time: "1970-01-01T00:01:00Z".into(),
                name: "n".into(),
                labels: "host=h1".into(),
                value: "3".into(),
            }]
        );

        let matrix: StatsResponse = serde_json::from_str(
            r#"{"status":"success","data":{"resultType":"matrix","result":[{"metric":{"__name__":"n"},"values":[[0,"1"],[60,"2"]]}]}}"#,
        )
        .unwrap();
        let rows = stats_rows(matrix);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].value, "2");
        assert_eq!(rows[1].labels, "");
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from(["lh", "--addr", "n1:9428", "query", "error", "--limit", "5", "--start", "1h"]);
        match cli.command {
            Commands::Query { query, limit, range } => {
                assert_eq!(query, "error");
                assert_eq!(limit, Some(5));
                assert_eq!(range.start.as_deref(), Some("1h"));
            }
            _ => panic!("expected query"),
        }
        assert_eq!(cli.addr.as_deref(), Some("n1:9428"));
    }
}
