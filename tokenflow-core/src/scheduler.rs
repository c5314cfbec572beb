//! Timer scheduler.
//!
//! A single process-wide scheduler owns every timer job. A background scan
//! reads all process definitions, finds timer start events, and reconciles
//! its job map against them; a definitions digest is cached between scans so
//! unchanged deployments cost nothing. Firing a definition timer publishes
//! `process.started` with a freshly minted instance id; token-level timers
//! (intermediate and boundary) are swept from the runtime store and resumed
//! through the engine. Jobs coalesce: downtime produces one catch-up firing,
//! never a pile-up.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bpmn::{self, EventDefinition, Node};
use crate::bus::{EventBus, ProcessStartedEvent};
use crate::engine::ProcessEngine;
use crate::error::Result;
use crate::store::{DurableStore, RuntimeStore};
use crate::timer::{parse_timer, ParsedTimer, TimerKind};
use crate::types::TimerMetadata;

/// Runtime-store key prefix for timer metadata, wire-compatible with the
/// original deployment.
pub const TIMER_KEY_PREFIX: &str = "pythmata:timer";

#[derive(Clone, Debug)]
pub struct TimerJob {
    pub id: String,
    pub definition_id: Uuid,
    pub node_id: String,
    pub timer: ParsedTimer,
    pub next_fire: DateTime<Utc>,
    /// Remaining firings for cycles; None = unbounded.
    pub remaining: Option<u32>,
}

pub fn timer_job_id(definition_id: Uuid, node_id: &str) -> String {
    format!("{TIMER_KEY_PREFIX}:{definition_id}:{node_id}")
}

pub struct TimerScheduler {
    durable: Arc<dyn DurableStore>,
    runtime: Arc<dyn RuntimeStore>,
    bus: Arc<dyn EventBus>,
    jobs: Mutex<HashMap<String, TimerJob>>,
    definitions_digest: Mutex<Option<[u8; 32]>>,
}

impl TimerScheduler {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        runtime: Arc<dyn RuntimeStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            durable,
            runtime,
            bus,
            jobs: Mutex::new(HashMap::new()),
            definitions_digest: Mutex::new(None),
        }
    }

    // ── Startup recovery ──

    /// Rehydrate the job map from the metadata mirrored in the runtime
    /// store, so a fresh scheduler instance resumes where the last left off.
    pub async fn recover(&self) -> Result<usize> {
        let metadata = self.runtime.list_timer_metadata().await?;
        let mut jobs = self.jobs.lock().await;
        let mut recovered = 0;
        for meta in metadata {
            let timer = match parse_timer(&meta.timer_def) {
                Ok(t) => t,
                Err(e) => {
                    warn!(node = %meta.node_id, "unparseable timer metadata: {e}");
                    continue;
                }
            };
            let id = timer_job_id(meta.definition_id, &meta.node_id);
            jobs.entry(id.clone()).or_insert_with(|| TimerJob {
                id,
                definition_id: meta.definition_id,
                node_id: meta.node_id.clone(),
                next_fire: timer.first_fire(Utc::now()),
                remaining: timer.repetitions,
                timer,
            });
            recovered += 1;
        }
        info!(recovered, "timer jobs rehydrated from metadata");
        Ok(recovered)
    }

    // ── Definition scan ──

    /// Scan every definition for timer start events and reconcile the job
    /// map. Returns false when the definitions digest is unchanged and the
    /// scan was skipped.
    pub async fn scan_definitions(&self) -> Result<bool> {
        let definitions = self.durable.list_definitions().await?;

        let mut hasher = Sha256::new();
        for def in &definitions {
            hasher.update(def.id.as_bytes());
            hasher.update(def.version.to_be_bytes());
            hasher.update(def.bpmn_xml.as_bytes());
        }
        let digest: [u8; 32] = hasher.finalize().into();
        {
            let mut cached = self.definitions_digest.lock().await;
            if cached.as_ref() == Some(&digest) {
                return Ok(false);
            }
            *cached = Some(digest);
        }

        // collect (definition, node, timer string) for every timer start event
        let mut found: Vec<(Uuid, String, String)> = Vec::new();
        for def in &definitions {
            let graph = match bpmn::parse(&def.bpmn_xml) {
                Ok(g) => g,
                Err(e) => {
                    warn!(definition = %def.id, "skipping unparseable definition: {e}");
                    continue;
                }
            };
            for node in &graph.nodes {
                if let Node::Event(ev) = node {
                    if ev.definition == Some(EventDefinition::Timer) {
                        if let (crate::bpmn::EventKind::Start, Some(timer_def)) =
                            (ev.kind, &ev.timer_definition)
                        {
                            found.push((def.id, ev.id.clone(), timer_def.clone()));
                        }
                    }
                }
            }
        }

        self.reconcile(found).await?;
        Ok(true)
    }

    /// Upsert jobs for the timers found and drop jobs whose timers are gone.
    /// Metadata in the runtime store mirrors the job map.
    async fn reconcile(&self, found: Vec<(Uuid, String, String)>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;

        let mut keep: HashMap<String, ()> = HashMap::new();
        for (definition_id, node_id, timer_def) in found {
            let id = timer_job_id(definition_id, &node_id);
            keep.insert(id.clone(), ());

            let timer = match parse_timer(&timer_def) {
                Ok(t) => t,
                Err(e) => {
                    // a bad timer expression skips that timer, nothing else
                    warn!(definition = %definition_id, node = %node_id, "timer skipped: {e}");
                    continue;
                }
            };

            let replace = match jobs.get(&id) {
                Some(existing) => existing.timer != timer,
                None => true,
            };
            if replace {
                debug!(job = %id, def = %timer_def, "timer job scheduled");
                jobs.insert(
                    id.clone(),
                    TimerJob {
                        id: id.clone(),
                        definition_id,
                        node_id: node_id.clone(),
                        next_fire: timer.first_fire(Utc::now()),
                        remaining: timer.repetitions,
                        timer: timer.clone(),
                    },
                );
                self.runtime
                    .put_timer_metadata(&TimerMetadata {
                        definition_id,
                        node_id,
                        timer_def,
                        timer_type: timer.kind.as_str().to_string(),
                        created_at: Utc::now(),
                    })
                    .await?;
            }
        }

        let stale: Vec<TimerJob> = jobs
            .values()
            .filter(|j| !keep.contains_key(&j.id))
            .cloned()
            .collect();
        for job in stale {
            debug!(job = %job.id, "timer job removed");
            jobs.remove(&job.id);
            self.runtime
                .remove_timer_metadata(job.definition_id, &job.node_id)
                .await?;
        }
        Ok(())
    }

    // ── Firing ──

    /// Fire every due definition timer once (coalesced) and sweep due
    /// token-level timers through the engine. Returns the ids of instances
    /// started for definition timers.
    pub async fn fire_due(&self, engine: &ProcessEngine, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut started = Vec::new();

        let due: Vec<TimerJob> = {
            let jobs = self.jobs.lock().await;
            jobs.values()
                .filter(|j| j.next_fire <= now)
                .cloned()
                .collect()
        };

        for job in due {
            let instance_id = Uuid::now_v7();
            self.bus
                .publish_process_started(ProcessStartedEvent::new(
                    instance_id,
                    job.definition_id,
                    "timer_scheduler",
                ))
                .await?;
            info!(job = %job.id, instance = %instance_id, "timer fired");
            started.push(instance_id);

            let mut jobs = self.jobs.lock().await;
            match job.timer.kind {
                TimerKind::Cycle => {
                    let remaining = job.remaining.map(|r| r.saturating_sub(1));
                    if remaining == Some(0) {
                        jobs.remove(&job.id);
                        self.runtime
                            .remove_timer_metadata(job.definition_id, &job.node_id)
                            .await?;
                    } else if let Some(entry) = jobs.get_mut(&job.id) {
                        entry.remaining = remaining;
                        // coalesce missed intervals into one firing
                        entry.next_fire =
                            now + job.timer.interval.unwrap_or_else(chrono::Duration::zero);
                    }
                }
                TimerKind::Duration | TimerKind::Date => {
                    jobs.remove(&job.id);
                    self.runtime
                        .remove_timer_metadata(job.definition_id, &job.node_id)
                        .await?;
                }
            }
        }

        // token-level timers (intermediate catch + boundary events)
        let token_timers = self.runtime.list_token_timers().await?;
        for timer in token_timers.into_iter().filter(|t| t.due <= now) {
            debug!(instance = %timer.instance_id, node = %timer.node_id, "token timer fired");
            engine
                .fire_token_timer(timer.instance_id, &timer.node_id)
                .await?;
        }

        Ok(started)
    }

    /// Next fire time across all jobs, for the background loop's sleep.
    pub async fn next_fire(&self) -> Option<DateTime<Utc>> {
        let jobs = self.jobs.lock().await;
        jobs.values().map(|j| j.next_fire).min()
    }

    /// Background loop: scan, fire, sleep. `scan_interval` bounds both the
    /// definition rescan cadence and the token-timer sweep granularity.
    pub async fn run(
        self: Arc<Self>,
        engine: Arc<ProcessEngine>,
        scan_interval: std::time::Duration,
    ) {
        if let Err(e) = self.recover().await {
            warn!("timer recovery failed: {e}");
        }
        loop {
            if let Err(e) = self.scan_definitions().await {
                warn!("definition scan failed: {e}");
            }
            if let Err(e) = self.fire_due(&engine, Utc::now()).await {
                warn!("timer firing failed: {e}");
            }
            tokio::time::sleep(scan_interval).await;
        }
    }

    /// Test and inspection hook: snapshot of the current job map.
    pub async fn jobs(&self) -> Vec<TimerJob> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<TimerJob> = jobs.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
