use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metric::MetricPoint;
use crate::sink::Sink;

use super::pipeline::Pipeline;

/// One sample as read from an NDJSON feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedSample {
    pub node_id: String,
    pub probe_id: String,
    /// Defaults to the time the line was read.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub latency_ms: f64,
    #[serde(default)]
    pub packet_loss_rate: f64,
    #[serde(default)]
    pub jitter_ms: f64,
}

impl FeedSample {
    /// Rejects values outside their physical range before they reach a store.
    pub fn check_ranges(&self) -> Result<()> {
        for (field, value) in [("latency_ms", self.latency_ms), ("jitter_ms", self.jitter_ms)] {
            if !value.is_finite() || value < 0.0 {
                bail!("invalid {field}: {value}");
            }
        }

        if !(0.0..=1.0).contains(&self.packet_loss_rate) {
            bail!("packet_loss_rate outside [0, 1]: {}", self.packet_loss_rate);
        }

        Ok(())
    }

    pub fn to_point(&self) -> MetricPoint {
        MetricPoint::new(
            self.timestamp.unwrap_or_else(Utc::now),
            self.latency_ms,
            self.packet_loss_rate,
            self.jitter_ms,
        )
    }
}

/// Counts from one feed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub ingested: u64,
    pub malformed: u64,
    pub rejected: u64,
}

/// Reads NDJSON samples until EOF or cancellation and ingests each one.
///
/// Malformed lines, out-of-range values and samples the pipeline rejects
/// are logged and skipped.
pub async fn run_ndjson<R, S>(
    reader: R,
    pipeline: &Pipeline<S>,
    cancel: CancellationToken,
) -> Result<FeedSummary>
where
    R: AsyncBufRead + Unpin,
    S: Sink,
{
    let mut lines = reader.lines();
    let mut summary = FeedSummary::default();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("reading sample feed")?,
        };

        let Some(line) = line else {
            debug!("sample feed reached EOF");
            break;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let sample: FeedSample = match serde_json::from_str(line) {
            Ok(sample) => sample,
            Err(e) => {
                summary.malformed += 1;
                warn!(error = %e, "skipping malformed sample line");
                continue;
            }
        };

        if let Err(e) = sample.check_ranges() {
            summary.rejected += 1;
            warn!(node_id = %sample.node_id, error = %e, "sample rejected");
            continue;
        }

        match pipeline.ingest(&sample.node_id, &sample.probe_id, sample.to_point()) {
            Ok(()) => summary.ingested += 1,
            Err(e) => {
                summary.rejected += 1;
                warn!(node_id = %sample.node_id, error = %e, "sample rejected");
            }
        }
    }

    Ok(summary)
}
