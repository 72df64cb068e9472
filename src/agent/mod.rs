use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::AssetBindings;
use crate::batch::BatchConfig;
use crate::config::{BatchingConfig, Config};
use crate::consent::{ConsentDecision, ConsentGate, SharedStateSource};
use crate::coordinator::Coordinator;
use crate::delivery::{BatchDispatcher, HttpDelivery, HttpRegistry};
use crate::error::PipelineError;
use crate::event::{EventCategory, ExtraValue, InteractionEvent, InteractionKind};
use crate::health::HealthMetrics;
use crate::hits::{BackoffPolicy, FeaturizationHit, HitQueue};
use crate::queue::MemoryLog;

/// Extras key carrying the asset identifiers bound to an experience
/// definition.
const ASSET_IDS_KEY: &str = "assetIds";

type Dispatcher = BatchDispatcher<HttpDelivery>;

/// Agent orchestrates all components: coordinators, delivery, consent
/// gate, registration queue, and health metrics.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    gate: Arc<ConsentGate>,
    bindings: Arc<AssetBindings>,
    delivery: Arc<HttpDelivery>,
    assets: Coordinator<Dispatcher>,
    experiences: Coordinator<Dispatcher>,
    hits: Option<Arc<HitQueue<HttpRegistry>>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent against the given upstream consent source.
    pub fn new(cfg: Config, source: Arc<dyn SharedStateSource>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let gate = Arc::new(ConsentGate::new(source));
        let bindings = Arc::new(AssetBindings::new());
        let delivery = Arc::new(HttpDelivery::new(cfg.delivery.clone()));

        let dispatcher = Arc::new(BatchDispatcher::new(
            Arc::clone(&gate),
            Arc::clone(&bindings),
            Arc::clone(&delivery),
            Arc::clone(&health),
            &cfg.meta_client_name,
            &cfg.meta_network_name,
        ));

        let batch_cfg = BatchConfig {
            max_batch_size: cfg.batching.max_batch_size,
            max_wait_time: cfg.max_wait_time(),
        };

        let assets = Coordinator::new(
            EventCategory::Asset,
            batch_cfg,
            Arc::new(MemoryLog::new()),
            Arc::clone(&dispatcher),
        );
        let experiences = Coordinator::new(
            EventCategory::Experience,
            batch_cfg,
            Arc::new(MemoryLog::new()),
            dispatcher,
        );

        let hits = if cfg.registry.endpoint.is_empty() {
            None
        } else {
            let registry =
                Arc::new(HttpRegistry::new(cfg.registry.clone()).context("creating registry")?);
            Some(Arc::new(HitQueue::new(
                Arc::new(MemoryLog::new()) as Arc<dyn crate::queue::DurableLog>,
                registry,
                BackoffPolicy {
                    base: cfg.retry.base,
                    cap: cfg.retry.cap,
                },
            )))
        };

        Ok(Self {
            cfg,
            health,
            gate,
            bindings,
            delivery,
            assets,
            experiences,
            hits,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components.
    pub async fn start(&self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        self.delivery
            .start(self.cancel.child_token())
            .context("starting delivery")?;

        self.set_consent_gauge(self.gate.decision());

        // Re-admit anything persisted by a previous run before new
        // traffic arrives.
        let recovered = self.assets.recover() + self.experiences.recover();
        if recovered > 0 {
            info!(recovered, "recovered persisted events from previous run");
            self.health.records_recovered.inc_by(recovered as f64);
        }
        self.refresh_pending_gauges();

        if let Some(hits) = &self.hits {
            self.spawn_hit_loop(Arc::clone(hits));
        }

        info!("impressoor agent started");

        Ok(())
    }

    /// Records an asset or experience interaction.
    ///
    /// Definition-kind events register asset bindings and are never
    /// batched. Events arriving after an explicit opt-out are dropped.
    pub async fn ingest(&self, event: InteractionEvent) -> Result<(), PipelineError> {
        if self.gate.decision() == ConsentDecision::Denied {
            debug!(identifier = %event.identifier, "dropping event, collection opted out");
            self.health
                .events_dropped
                .with_label_values(&["consent"])
                .inc();
            return Ok(());
        }

        if event.kind == InteractionKind::Definition {
            self.register_bindings(&event);
            return Ok(());
        }

        let coordinator = self.coordinator_for(event.category);
        let category = event.category.as_str();

        coordinator.ingest(event).await?;

        self.health
            .events_ingested
            .with_label_values(&[category])
            .inc();
        self.health
            .pending_events
            .with_label_values(&[category])
            .set(coordinator.pending_count() as f64);

        Ok(())
    }

    /// Records an asset interaction.
    pub async fn ingest_asset(&self, event: InteractionEvent) -> Result<(), PipelineError> {
        if event.category != EventCategory::Asset {
            return Err(PipelineError::Validation(
                "expected an asset event".to_string(),
            ));
        }
        self.ingest(event).await
    }

    /// Records an experience interaction.
    pub async fn ingest_experience(&self, event: InteractionEvent) -> Result<(), PipelineError> {
        if event.category != EventCategory::Experience {
            return Err(PipelineError::Validation(
                "expected an experience event".to_string(),
            ));
        }
        self.ingest(event).await
    }

    /// Flushes both categories immediately, regardless of thresholds.
    pub async fn flush_now(&self) -> usize {
        let delivered = self.assets.flush().await + self.experiences.flush().await;
        self.refresh_pending_gauges();
        delivered
    }

    /// Discards all pending events without delivering them.
    pub fn clear_pending(&self) {
        self.assets.clear();
        self.experiences.clear();
        self.refresh_pending_gauges();
    }

    /// Applies new batching thresholds to both coordinators.
    pub async fn update_config(&self, batching: BatchingConfig) -> Result<()> {
        if !(1..=100).contains(&batching.max_batch_size) {
            anyhow::bail!("batching.max_batch_size must be between 1 and 100");
        }

        let batch_cfg = BatchConfig {
            max_batch_size: batching.max_batch_size,
            max_wait_time: batching
                .max_wait_time
                .unwrap_or_else(|| batching.flush_interval.mul_f64(2.5)),
        };

        self.assets.update_config(batch_cfg).await;
        self.experiences.update_config(batch_cfg).await;
        self.refresh_pending_gauges();

        Ok(())
    }

    /// Queues an experience registration hit for asynchronous delivery.
    pub fn submit_featurization_hit(
        &self,
        experience_id: &str,
        content: serde_json::Value,
    ) -> Result<(), PipelineError> {
        let Some(hits) = &self.hits else {
            return Err(PipelineError::Configuration(
                "registry endpoint not configured".to_string(),
            ));
        };

        let hit = FeaturizationHit {
            experience_id: experience_id.to_string(),
            org_id: self.cfg.registry.org_id.clone(),
            datastream_id: self.cfg.registry.datastream_id.clone(),
            content,
            attempt_count: 0,
        };

        hits.submit(&hit)?;
        Ok(())
    }

    /// Host notification that the upstream consent state changed.
    ///
    /// Granting consent recovers and delivers everything queued while
    /// the decision was pending; an explicit opt-out discards it.
    pub async fn on_consent_state_changed(&self) {
        let decision = self.gate.refresh();
        self.set_consent_gauge(decision);

        match decision {
            ConsentDecision::Allowed => {
                let recovered = self.assets.recover() + self.experiences.recover();
                if recovered > 0 {
                    self.health.records_recovered.inc_by(recovered as f64);
                }
                self.flush_now().await;
            }
            ConsentDecision::Denied => {
                info!("collection opted out, clearing pending events");
                self.clear_pending();
            }
            ConsentDecision::Pending => {}
        }
    }

    /// Host notification that the application moved to the background.
    pub async fn on_application_backgrounded(&self) {
        let delivered = self.flush_now().await;
        debug!(delivered, "background flush");
    }

    /// Host notification that the user identity was reset. Drops all
    /// pending events and asset bindings.
    pub fn on_identity_reset(&self) {
        self.clear_pending();
        self.bindings.clear();
    }

    /// Combined pending event count across both categories.
    pub fn pending_events(&self) -> usize {
        self.assets.pending_count() + self.experiences.pending_count()
    }

    /// Graceful shutdown: cancels background tasks and flushes what is
    /// left.
    pub async fn stop(&self) -> Result<()> {
        let delivered = self.assets.shutdown().await + self.experiences.shutdown().await;
        if delivered > 0 {
            debug!(delivered, "final flush on shutdown");
        }

        self.cancel.cancel();
        self.delivery.stop();
        self.health.stop().await?;

        info!("impressoor agent stopped");

        Ok(())
    }

    fn coordinator_for(&self, category: EventCategory) -> &Coordinator<Dispatcher> {
        match category {
            EventCategory::Asset => &self.assets,
            EventCategory::Experience => &self.experiences,
        }
    }

    /// Records the assets attributed to an experience definition.
    fn register_bindings(&self, event: &InteractionEvent) {
        if event.category != EventCategory::Experience {
            return;
        }

        let Some(extras) = &event.extras else {
            return;
        };
        let Some(ExtraValue::List(values)) = extras.get(ASSET_IDS_KEY) else {
            return;
        };

        let assets: Vec<String> = values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();

        if assets.is_empty() {
            warn!(identifier = %event.identifier, "definition event with no usable asset ids");
            return;
        }

        debug!(
            identifier = %event.identifier,
            assets = assets.len(),
            "registered asset bindings",
        );
        self.bindings.register(event.identifier.clone(), assets);
    }

    fn refresh_pending_gauges(&self) {
        self.health
            .pending_events
            .with_label_values(&["asset"])
            .set(self.assets.pending_count() as f64);
        self.health
            .pending_events
            .with_label_values(&["experience"])
            .set(self.experiences.pending_count() as f64);
    }

    fn set_consent_gauge(&self, decision: ConsentDecision) {
        self.health
            .consent_allowed
            .set(if decision.is_allowed() { 1.0 } else { 0.0 });
    }

    fn spawn_hit_loop(&self, hits: Arc<HitQueue<HttpRegistry>>) {
        let cancel = self.cancel.child_token();
        let health = Arc::clone(&self.health);
        let poll_interval = self.cfg.retry.poll_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        if hits.pending() == 0 {
                            continue;
                        }

                        let stats = hits.drain_due().await;
                        health.hits_processed.inc_by(stats.completed as f64);
                        health.hits_retried.inc_by(stats.retried as f64);
                        health.hits_dropped.inc_by(stats.dropped as f64);
                    }
                }
            }
        });
    }
}
