use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::config::HttpExportConfig;
use crate::metric::MetricRecord;

use super::{validate_record, Sink, Transaction};

/// HTTP NDJSON sink, e.g. for a Vector HTTP source.
///
/// Each transaction buffers newline-delimited JSON and sends it as one POST
/// on commit. A non-2xx response fails the commit.
pub struct HttpSink {
    client: reqwest::Client,
    cfg: Arc<HttpExportConfig>,
}

impl HttpSink {
    pub fn new(cfg: HttpExportConfig) -> Result<Self> {
        if cfg.address.is_empty() {
            bail!("http address is required");
        }
        // Fail at construction rather than on the first commit.
        compress(&[], &cfg.compression)?;

        let mut client_builder = reqwest::Client::builder().timeout(cfg.timeout);

        if !cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        let client = client_builder.build().context("building HTTP client")?;

        Ok(Self {
            client,
            cfg: Arc::new(cfg),
        })
    }
}

impl Sink for HttpSink {
    type Tx = HttpTx;

    fn name(&self) -> &str {
        "http"
    }

    async fn begin(&self) -> Result<HttpTx> {
        Ok(HttpTx {
            client: self.client.clone(),
            cfg: Arc::clone(&self.cfg),
            buf: Vec::new(),
            items: 0,
        })
    }
}

/// Open HTTP transaction staging an NDJSON body.
pub struct HttpTx {
    client: reqwest::Client,
    cfg: Arc<HttpExportConfig>,
    buf: Vec<u8>,
    items: usize,
}

impl Transaction for HttpTx {
    async fn insert(&mut self, record: &MetricRecord) -> Result<()> {
        validate_record(record)?;
        append_ndjson(&mut self.buf, record)?;
        self.items += 1;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        if self.items == 0 {
            return Ok(());
        }

        let raw_len = self.buf.len();
        let body = compress(&self.buf, &self.cfg.compression).context("compressing NDJSON data")?;

        let mut request = self
            .client
            .post(&self.cfg.address)
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .context("sending HTTP export request")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("HTTP export unexpected status: {status}");
        }

        tracing::debug!(items = self.items, bytes = raw_len, "exported batch via HTTP");

        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

fn append_ndjson(buf: &mut Vec<u8>, record: &MetricRecord) -> Result<()> {
    serde_json::to_writer(&mut *buf, record).context("serializing record to JSON")?;
    buf.push(b'\n');
    Ok(())
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => compress_zstd(data),
        "zlib" => compress_zlib(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 0).context("zstd encode")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::metric::MetricPoint;

    fn record(node: &str) -> MetricRecord {
        let ts = Utc
            .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp");
        MetricRecord::from_point(node, "probe-1", &MetricPoint::new(ts, 20.0, 0.0, 2.0))
    }

    fn cfg(compression: &str) -> HttpExportConfig {
        HttpExportConfig {
            enabled: true,
            address: "http://127.0.0.1:1/ingest".to_string(),
            compression: compression.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_compress_none() {
        let data = b"hello world";
        let result = compress(data, "none").expect("compress none");
        assert_eq!(result, data);
    }

    #[test]
    fn test_compress_gzip_roundtrip() {
        use flate2::read::GzDecoder;

        let data = b"{\"node_id\":\"a\"}\n{\"node_id\":\"b\"}\n";
        let compressed = compress(data, "gzip").expect("gzip compress");

        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("gzip decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_zstd_roundtrip() {
        let data = b"{\"node_id\":\"a\"}\n";
        let compressed = compress(data, "zstd").expect("zstd compress");
        let decompressed = zstd::decode_all(compressed.as_slice()).expect("zstd decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_rejects_unknown() {
        assert!(compress(b"x", "snappy").is_err());
    }

    #[test]
    fn test_content_encoding() {
        assert_eq!(content_encoding("gzip"), Some("gzip"));
        assert_eq!(content_encoding("zstd"), Some("zstd"));
        assert_eq!(content_encoding("zlib"), Some("deflate"));
        assert_eq!(content_encoding("none"), None);
    }

    #[test]
    fn test_ndjson_lines() {
        let mut buf = Vec::new();
        append_ndjson(&mut buf, &record("node-a")).expect("append");
        append_ndjson(&mut buf, &record("node-b")).expect("append");

        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["node_id"], "node-a");
        assert_eq!(first["probe_id"], "probe-1");
        assert_eq!(first["latency_ms"], 20.0);
        assert_eq!(first["is_aggregated"], false);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        assert!(HttpSink::new(cfg("snappy")).is_err());

        let mut missing = cfg("gzip");
        missing.address.clear();
        assert!(HttpSink::new(missing).is_err());
    }

    #[tokio::test]
    async fn test_insert_validates_and_rollback_discards() {
        let sink = HttpSink::new(cfg("none")).expect("sink");
        let mut tx = sink.begin().await.expect("begin");

        tx.insert(&record("node-a")).await.expect("insert");
        assert!(tx.insert(&record("")).await.is_err());

        // Out-of-range values are the producer's concern, not a batch failure.
        let mut percent = record("node-b");
        percent.packet_loss_rate = 2.5;
        tx.insert(&percent).await.expect("insert out-of-range loss");
        assert_eq!(tx.items, 2);

        tx.rollback().await.expect("rollback");
    }

    #[tokio::test]
    async fn test_commit_empty_is_noop() {
        let sink = HttpSink::new(cfg("gzip")).expect("sink");
        let tx = sink.begin().await.expect("begin");
        tx.commit().await.expect("empty commit");
    }

    #[tokio::test]
    async fn test_commit_fails_when_endpoint_unreachable() {
        let sink = HttpSink::new(HttpExportConfig {
            timeout: std::time::Duration::from_secs(2),
            ..cfg("none")
        })
        .expect("sink");
        let mut tx = sink.begin().await.expect("begin");
        tx.insert(&record("node-a")).await.expect("insert");
        assert!(tx.commit().await.is_err());
    }
}
