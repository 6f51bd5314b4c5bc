//! Three storage nodes behind an insert node and a select node, all on
//! loopback ports.

use lh_node::insert::opentelemetry::pb::{any_value::Value, AnyValue, KeyValue, LogRecord, LogsData, Resource, ResourceLogs, ScopeLogs};
use lh_node::{Node, NodeConfig};
use prost::Message;
use tempfile::TempDir;

struct Cluster {
    _dirs: Vec<TempDir>,
    storage: Vec<Node>,
    insert: Node,
    select: Node,
    client: reqwest::Client,
}

impl Cluster {
    /// Three single-replica shards.
    async fn start() -> Self {
        Self::start_with(1).await
    }

    async fn start_with(replication_factor: usize) -> Self {
        let mut dirs = Vec::new();
        let mut storage = Vec::new();
        for _ in 0..3 {
            let dir = tempfile::tempdir().unwrap();
            storage.push(lh_node::start(NodeConfig::storage("127.0.0.1:0", dir.path())).await.unwrap());
            dirs.push(dir);
        }
        let addrs: Vec<String> = storage.iter().map(|n| n.addr().to_string()).collect();

        let insert = lh_node::start(NodeConfig {
            select_enabled: false,
            replication_factor,
            ..NodeConfig::router("127.0.0.1:0", addrs.clone())
        })
        .await
        .unwrap();
        let select = lh_node::start(NodeConfig {
            insert_enabled: false,
            replication_factor,
            ..NodeConfig::router("127.0.0.1:0", addrs)
        })
        .await
        .unwrap();

        Self {
            _dirs: dirs,
            storage,
            insert,
            select,
            client: reqwest::Client::new(),
        }
    }

    fn insert_url(&self, path: &str) -> String {
        format!("http://{}{}", self.insert.addr(), path)
    }

    fn select_url(&self, path: &str) -> String {
        format!("http://{}{}", self.select.addr(), path)
    }

    async fn flush(&self) {
        let resp = self.client.get(self.insert_url("/internal/force_flush")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    async fn query(&self, q: &str) -> Vec<String> {
        let resp = self
            .client
            .post(self.select_url("/select/logsql/query"))
            .form(&[("query", q)])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.text().await.unwrap().lines().map(str::to_string).collect()
    }

    async fn count(&self) -> String {
        self.query("* | count() as logs").await.join("\n")
    }

    async fn stop(self) {
        self.insert.stop().await;
        self.select.stop().await;
        for node in self.storage {
            node.stop().await;
        }
    }
}

async fn ingest_sample(c: &Cluster) {
    let body = [
        r#"{"_msg":"abc","x":"y"}"#,
        r#"{"_msg":"def","x":"y"}"#,
        r#"{"_msg":"gh","x":"y"}"#,
        r#"{"_msg":"aa","x":"z"}"#,
        r#"{"_msg":"aa","x":"y"}"#,
    ]
    .join("\n");
    let resp = c
        .client
        .post(c.insert_url("/insert/jsonline?_stream_fields=x"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    c.flush().await;
}

#[tokio::test]
async fn test_cluster_stats_and_facets() {
    let c = Cluster::start().await;
    ingest_sample(&c).await;

    assert_eq!(c.query("* | count_uniq(_stream) as streams").await, vec![r#"{"streams":"2"}"#]);
    assert_eq!(c.count().await, r#"{"logs":"5"}"#);
    assert_eq!(
        c.query("* | facets | filter field_name:=x").await,
        vec![
            r#"{"field_name":"x","field_value":"y","hits":"4"}"#,
            r#"{"field_name":"x","field_value":"z","hits":"1"}"#,
        ]
    );

    let resp = c
        .client
        .get(c.select_url("/select/logsql/facets"))
        .query(&[("query", "*")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = resp.json().await.unwrap();
    let facets = v["facets"].as_array().unwrap();
    let names: Vec<&str> = facets.iter().map(|f| f["field_name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["_msg", "_stream", "_stream_id", "x"]);
    assert_eq!(
        facets[0]["values"],
        serde_json::json!([
            {"field_value": "aa", "hits": 2},
            {"field_value": "abc", "hits": 1},
            {"field_value": "def", "hits": 1},
            {"field_value": "gh", "hits": 1},
        ])
    );

    let rows = c.query("x:=z").await;
    assert_eq!(rows.len(), 1);
    let row: serde_json::Value = serde_json::from_str(&rows[0]).unwrap();
    assert_eq!(row["_msg"], "aa");
    assert_eq!(row["_stream"], "{x=\"z\"}");

    c.stop().await;
}

#[tokio::test]
async fn test_cluster_roles_are_split() {
    let c = Cluster::start().await;
    let resp = c
        .client
        .post(c.select_url("/insert/jsonline"))
        .body(r#"{"_msg":"a"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = c
        .client
        .get(c.insert_url("/select/logsql/query"))
        .query(&[("query", "*")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    c.stop().await;
}

fn otlp_request(messages: &[&str]) -> Vec<u8> {
    let string = |s: &str| Some(AnyValue { value: Some(Value::StringValue(s.into())) });
    LogsData {
        resource_logs: vec![ResourceLogs {
            resource: Some(Resource {
                attributes: vec![KeyValue {
                    key: "service.name".into(),
                    value: string("checkout"),
                }],
                dropped_attributes_count: 0,
            }),
            scope_logs: vec![ScopeLogs {
                log_records: messages
                    .iter()
                    .map(|m| LogRecord {
                        severity_number: 9,
                        body: string(m),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            schema_url: String::new(),
        }],
    }
    .encode_to_vec()
}

#[tokio::test]
async fn test_cluster_opentelemetry_all_or_nothing() {
    let c = Cluster::start().await;
    let url = c.insert_url("/insert/opentelemetry/v1/logs");

    let resp = c
        .client
        .post(&url)
        .header("Content-Type", "application/x-protobuf")
        .body(otlp_request(&["paid", "shipped"]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    c.flush().await;
    assert_eq!(c.count().await, r#"{"logs":"2"}"#);

    let rows = c.query("paid").await;
    let row: serde_json::Value = serde_json::from_str(&rows[0]).unwrap();
    assert_eq!(row["_stream"], "{service.name=\"checkout\"}");
    assert_eq!(row["severity"], "Info");

    // Valid records followed by garbage: nothing from the request is kept.
    let mut body = otlp_request(&["lost"]);
    body.extend_from_slice(&[0x0a, 0xff, 0xff]);
    let resp = c.client.post(&url).body(body).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    let resp = c
        .client
        .post(&url)
        .header("Content-Type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    c.flush().await;
    assert_eq!(c.count().await, r#"{"logs":"2"}"#);
    c.stop().await;
}

#[tokio::test]
async fn test_cluster_rejects_bad_requests() {
    let c = Cluster::start().await;

    let resp = c
        .client
        .post(c.insert_url("/insert/native?version=v2"))
        .body(Vec::new())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = c
        .client
        .post(c.insert_url("/insert/jsonline"))
        .header("Content-Encoding", "br")
        .body(r#"{"_msg":"a"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = c
        .client
        .post(c.select_url("/select/logsql/query"))
        .form(&[("query", "* | nonsense")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    c.stop().await;
}

#[tokio::test]
async fn test_payload_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = NodeConfig::storage("127.0.0.1:0", dir.path());
    config.max_request_size = 64;
    let node = lh_node::start(config).await.unwrap();

    let resp = reqwest::Client::new()
        .post(format!("http://{}/insert/jsonline", node.addr()))
        .body(format!(r#"{{"_msg":"{}"}}"#, "x".repeat(100)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);
    node.stop().await;
}

#[tokio::test]
async fn test_unreachable_storage_fails_writes() {
    let c = Cluster::start().await;
    let mut storage = c.storage;
    for node in storage.drain(..) {
        node.stop().await;
    }
    let resp = c
        .client
        .post(format!("http://{}/insert/jsonline", c.insert.addr()))
        .body(r#"{"_msg":"a"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);

    let resp = c
        .client
        .post(format!("http://{}/select/logsql/query", c.select.addr()))
        .form(&[("query", "*")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);

    c.insert.stop().await;
    c.select.stop().await;
}

#[tokio::test]
async fn test_cluster_backpressure_rejects_whole_request() {
    let c = Cluster::start().await;
    let read_only = c.storage[1].state().storage.clone().unwrap();
    read_only.set_read_only(true);

    let body: String = (0..50).map(|i| format!("{{\"_msg\":\"m{}\",\"s\":\"s{}\"}}\n", i, i)).collect();
    let url = c.insert_url("/insert/jsonline?_stream_fields=s");
    let resp = c.client.post(&url).body(body.clone()).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    for node in &c.storage {
        let stats = node.state().storage.as_ref().unwrap().stats();
        assert_eq!(stats.rows_added_total, 0);
        assert_eq!(stats.pending_rows, 0);
    }

    read_only.set_read_only(false);
    let resp = c.client.post(&url).body(body).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    c.flush().await;
    assert_eq!(c.count().await, r#"{"logs":"50"}"#);
    c.stop().await;
}

#[tokio::test]
async fn test_cluster_replicates_to_every_replica() {
    let c = Cluster::start_with(3).await;
    ingest_sample(&c).await;
    for node in &c.storage {
        assert_eq!(node.state().storage.as_ref().unwrap().stats().rows_added_total, 5);
    }
    assert_eq!(c.count().await, r#"{"logs":"5"}"#);
    assert_eq!(c.query("* | count_uniq(_stream) as streams").await, vec![r#"{"streams":"2"}"#]);
    c.stop().await;
}
