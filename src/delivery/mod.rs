use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};

use crate::aggregate::{aggregate, AggregatedMetric, AssetBindings, MergedExtras};
use crate::config::{DeliveryConfig, RegistryConfig};
use crate::consent::ConsentGate;
use crate::coordinator::{DeliveryHandler, DrainedBatch};
use crate::health::HealthMetrics;
use crate::hits::{CheckOutcome, FeaturizationHit, RegistryError, RemoteRegistry};

/// JSON schema for one delivered metric row.
#[derive(Debug, Clone, Serialize)]
pub struct MetricRow {
    pub updated_date_time: Arc<str>,
    pub category: &'static str,
    pub interaction: &'static str,
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub view_count: u32,
    pub click_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<MergedExtras>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributed_assets: Vec<String>,
    #[serde(skip_serializing_if = "is_arc_str_empty")]
    pub meta_client_name: Arc<str>,
    #[serde(skip_serializing_if = "is_arc_str_empty")]
    pub meta_network_name: Arc<str>,
}

fn is_arc_str_empty(v: &Arc<str>) -> bool {
    v.is_empty()
}

/// Accepts metric rows for asynchronous transmission. The HTTP sender
/// implements this; tests substitute a recording sink.
pub trait RowSink: Send + Sync + 'static {
    /// Enqueues the rows, all or nothing. An error means nothing was
    /// accepted and the caller keeps its durable records.
    fn submit(&self, rows: Vec<MetricRow>) -> Result<()>;
}

/// Turns drained event batches into metric rows behind the consent gate.
///
/// Refusing a batch (gate closed, sink full) leaves the coordinator's
/// persisted records untouched, so nothing is lost to a transient
/// denial.
pub struct BatchDispatcher<S: RowSink> {
    gate: Arc<ConsentGate>,
    bindings: Arc<AssetBindings>,
    sink: Arc<S>,
    metrics: Arc<HealthMetrics>,
    client_name: Arc<str>,
    network_name: Arc<str>,
}

impl<S: RowSink> BatchDispatcher<S> {
    pub fn new(
        gate: Arc<ConsentGate>,
        bindings: Arc<AssetBindings>,
        sink: Arc<S>,
        metrics: Arc<HealthMetrics>,
        client_name: &str,
        network_name: &str,
    ) -> Self {
        Self {
            gate,
            bindings,
            sink,
            metrics,
            client_name: Arc::from(client_name),
            network_name: Arc::from(network_name),
        }
    }

    fn to_row(&self, m: AggregatedMetric, now: &Arc<str>, category: &'static str, interaction: &'static str) -> MetricRow {
        MetricRow {
            updated_date_time: Arc::clone(now),
            category,
            interaction,
            identifier: m.identifier,
            location: m.location,
            view_count: m.view_count,
            click_count: m.click_count,
            extras: m.extras,
            attributed_assets: m.attributed_assets,
            meta_client_name: Arc::clone(&self.client_name),
            meta_network_name: Arc::clone(&self.network_name),
        }
    }
}

impl<S: RowSink> DeliveryHandler for BatchDispatcher<S> {
    async fn deliver(&self, batch: DrainedBatch) -> Result<()> {
        if !self.gate.is_allowed() {
            self.metrics.delivery_errors.inc();
            bail!("collection not permitted");
        }

        let category = batch.category.as_str();
        let result = aggregate(&batch.events, &self.bindings);
        if result.metrics.is_empty() {
            return Ok(());
        }

        let interaction = result.triggering_kind.as_str();
        let now: Arc<str> = Arc::from(format_datetime(Utc::now()));

        let rows = result
            .metrics
            .into_iter()
            .map(|m| self.to_row(m, &now, category, interaction))
            .collect();

        if let Err(e) = self.sink.submit(rows) {
            self.metrics.delivery_errors.inc();
            return Err(e);
        }

        self.metrics.batches_flushed.inc();
        Ok(())
    }
}

/// HTTP NDJSON sender with worker pool and compression.
///
/// Accumulates rows from a bounded channel, serializes them as
/// newline-delimited JSON, optionally gzips, and POSTs. Semaphore
/// limits concurrent requests.
pub struct HttpDelivery {
    cfg: DeliveryConfig,
    tx: parking_lot::Mutex<Option<mpsc::Sender<MetricRow>>>,
    cancel: parking_lot::Mutex<Option<tokio_util::sync::CancellationToken>>,
}

impl HttpDelivery {
    pub fn new(cfg: DeliveryConfig) -> Self {
        Self {
            cfg,
            tx: parking_lot::Mutex::new(None),
            cancel: parking_lot::Mutex::new(None),
        }
    }

    /// Starts the background accumulator task.
    pub fn start(&self, ctx: tokio_util::sync::CancellationToken) -> Result<()> {
        if self.cfg.max_queue_size == 0 {
            bail!("delivery max_queue_size must be positive");
        }
        if self.cfg.workers == 0 {
            bail!("delivery workers must be positive");
        }

        let (tx, mut rx) = mpsc::channel::<MetricRow>(self.cfg.max_queue_size);
        *self.tx.lock() = Some(tx);
        *self.cancel.lock() = Some(ctx.clone());

        let cfg = Arc::new(self.cfg.clone());

        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        let semaphore = Arc::new(Semaphore::new(cfg.workers));

        tokio::spawn(async move {
            let batch_size = cfg.batch_size;
            let mut batch = Vec::with_capacity(batch_size);
            let mut in_flight = tokio::task::JoinSet::new();
            let mut interval = tokio::time::interval(cfg.batch_timeout);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        // Drain the queue, then flush what remains.
                        while let Ok(row) = rx.try_recv() {
                            batch.push(row);
                            if batch.len() >= batch_size {
                                let rows = std::mem::replace(
                                    &mut batch,
                                    Vec::with_capacity(batch_size),
                                );
                                spawn_send_batch(
                                    &mut in_flight,
                                    client.clone(),
                                    Arc::clone(&cfg),
                                    Arc::clone(&semaphore),
                                    rows,
                                );
                            }
                        }

                        if !batch.is_empty() {
                            let rows = std::mem::take(&mut batch);
                            spawn_send_batch(
                                &mut in_flight,
                                client.clone(),
                                Arc::clone(&cfg),
                                Arc::clone(&semaphore),
                                rows,
                            );
                        }

                        while let Some(joined) = in_flight.join_next().await {
                            if let Err(e) = joined {
                                tracing::debug!(error = %e, "delivery worker join failed");
                            }
                        }
                        return;
                    }

                    row = rx.recv() => {
                        match row {
                            Some(row) => {
                                batch.push(row);

                                // Drain more rows without blocking.
                                while batch.len() < batch_size {
                                    match rx.try_recv() {
                                        Ok(row) => batch.push(row),
                                        Err(_) => break,
                                    }
                                }

                                if batch.len() >= batch_size {
                                    let rows = std::mem::replace(
                                        &mut batch,
                                        Vec::with_capacity(batch_size),
                                    );
                                    spawn_send_batch(
                                        &mut in_flight,
                                        client.clone(),
                                        Arc::clone(&cfg),
                                        Arc::clone(&semaphore),
                                        rows,
                                    );
                                }
                            }
                            None => {
                                if !batch.is_empty() {
                                    let rows = std::mem::take(&mut batch);
                                    spawn_send_batch(
                                        &mut in_flight,
                                        client.clone(),
                                        Arc::clone(&cfg),
                                        Arc::clone(&semaphore),
                                        rows,
                                    );
                                }

                                while let Some(joined) = in_flight.join_next().await {
                                    if let Err(e) = joined {
                                        tracing::debug!(error = %e, "delivery worker join failed");
                                    }
                                }
                                return;
                            }
                        }
                    }

                    _ = interval.tick() => {
                        if !batch.is_empty() {
                            let rows = std::mem::replace(
                                &mut batch,
                                Vec::with_capacity(batch_size),
                            );
                            spawn_send_batch(
                                &mut in_flight,
                                client.clone(),
                                Arc::clone(&cfg),
                                Arc::clone(&semaphore),
                                rows,
                            );
                        }
                    }

                    joined = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Some(Err(e)) = joined {
                            tracing::debug!(error = %e, "delivery worker join failed");
                        }
                    }
                }
            }
        });

        tracing::info!(
            endpoint = %self.cfg.endpoint,
            compression = %self.cfg.compression,
            workers = self.cfg.workers,
            "HTTP delivery started",
        );

        Ok(())
    }

    /// Stops the sender, draining queued rows.
    pub fn stop(&self) {
        self.tx.lock().take();

        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }
}

impl RowSink for HttpDelivery {
    fn submit(&self, rows: Vec<MetricRow>) -> Result<()> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            bail!("delivery not started");
        };

        // All or nothing: a partially enqueued batch would double-count
        // the accepted half after the caller retries.
        if tx.capacity() < rows.len() {
            bail!("delivery queue full");
        }

        for row in rows {
            if let Err(e) = tx.try_send(row) {
                bail!("enqueuing metric row: {e}");
            }
        }

        Ok(())
    }
}

fn spawn_send_batch(
    in_flight: &mut tokio::task::JoinSet<()>,
    client: reqwest::Client,
    cfg: Arc<DeliveryConfig>,
    semaphore: Arc<Semaphore>,
    rows: Vec<MetricRow>,
) {
    if rows.is_empty() {
        return;
    }

    in_flight.spawn(async move {
        let permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::warn!(error = %e, "delivery semaphore closed");
                return;
            }
        };

        let _permit = permit;

        if let Err(e) = send_batch(&client, &cfg, rows).await {
            tracing::warn!(error = %e, "delivery request failed");
        }
    });
}

/// Sends one batch of rows via HTTP POST.
async fn send_batch(
    client: &reqwest::Client,
    cfg: &DeliveryConfig,
    rows: Vec<MetricRow>,
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    // Serialize to NDJSON.
    let mut buf = Vec::with_capacity(rows.len() * 256);
    for row in &rows {
        serde_json::to_writer(&mut buf, row).context("serializing metric row")?;
        buf.push(b'\n');
    }

    let raw_len = buf.len();

    let compressed = compress(&buf, &cfg.compression).context("compressing NDJSON data")?;

    let mut request = client
        .post(&cfg.endpoint)
        .header("Content-Type", "application/x-ndjson")
        .body(compressed);

    if let Some(encoding) = content_encoding(&cfg.compression) {
        request = request.header("Content-Encoding", encoding);
    }

    for (k, v) in &cfg.headers {
        request = request.header(k.as_str(), v.as_str());
    }

    let resp = request.send().await.context("sending delivery request")?;

    let status = resp.status();
    // Drain body for connection reuse.
    let _ = resp.bytes().await;

    if !status.is_success() {
        bail!("delivery unexpected status: {status}");
    }

    tracing::debug!(rows = rows.len(), bytes = raw_len, "delivered batch");

    Ok(())
}

// --- Compression ---

fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        other => bail!("unsupported compression: {other}"),
    }
}

fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
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

/// Formats a UTC timestamp as "2006-01-02 15:04:05.000".
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

// --- Remote registry over HTTP ---

/// Check-then-register client against the featurization registry.
pub struct HttpRegistry {
    cfg: RegistryConfig,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(cfg: RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building registry client")?;

        Ok(Self { cfg, client })
    }

    fn check_url(&self, hit: &FeaturizationHit) -> String {
        format!(
            "{}/{}/{}/{}",
            self.cfg.endpoint.trim_end_matches('/'),
            hit.org_id,
            hit.datastream_id,
            hit.experience_id,
        )
    }

    fn map_error(e: reqwest::Error) -> RegistryError {
        if e.is_timeout() {
            RegistryError::Timeout
        } else if e.is_decode() {
            RegistryError::Decode(e.to_string())
        } else {
            RegistryError::Transport(e.to_string())
        }
    }
}

impl RemoteRegistry for HttpRegistry {
    async fn check_exists(&self, hit: &FeaturizationHit) -> Result<CheckOutcome, RegistryError> {
        let resp = self
            .client
            .get(self.check_url(hit))
            .send()
            .await
            .map_err(Self::map_error)?;

        let status = resp.status();
        let _ = resp.bytes().await;

        match status.as_u16() {
            200..=299 => Ok(CheckOutcome::Exists),
            404 => Ok(CheckOutcome::NotRegistered),
            code => Err(RegistryError::Status(code)),
        }
    }

    async fn register(&self, hit: &FeaturizationHit) -> Result<(), RegistryError> {
        let body = serde_json::json!({
            "orgId": hit.org_id,
            "datastreamId": hit.datastream_id,
            "experienceId": hit.experience_id,
            "content": hit.content,
        });

        let resp = self
            .client
            .post(self.cfg.endpoint.trim_end_matches('/'))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_error)?;

        let status = resp.status();
        let _ = resp.bytes().await;

        if !status.is_success() {
            return Err(RegistryError::Status(status.as_u16()));
        }

        Ok(())
    }
}
