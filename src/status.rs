use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::{get_json, put_json, ObjectStore};

pub const STATUS_KEY: &str = "status/pipeline-status.json";
pub const INVENTORY_KEY: &str = "status/inventory.json";

pub const BATCH_SIZE: usize = 25;
pub const BATCH_SECONDS: u64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    InProgress,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Ephemeral per-run status, overwritten at `status/pipeline-status.json` on
/// every publish. Not versioned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageRunStatus {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunState,
    pub counts: RunCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InventoryStage {
    Validated,
    Figures,
    Pdf,
}

impl InventoryStage {
    #[must_use]
    pub fn from_stage_name(stage: &str) -> Option<Self> {
        match stage.trim().to_ascii_lowercase().as_str() {
            "text" | "validate" | "validated" => Some(InventoryStage::Validated),
            "figure" | "figures" => Some(InventoryStage::Figures),
            "pdf" | "pdfs" => Some(InventoryStage::Pdf),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthInventory {
    #[serde(default)]
    pub validated: u64,
    #[serde(default)]
    pub figures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated_run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_figures_run: Option<String>,
}

/// Persisted at `status/inventory.json`. Top-level `validated`/`figures` are
/// always recomputed as the sum over `by_month` — never incremented — so a
/// rerun that lands the same absolute count is a no-op.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pdfs: u64,
    #[serde(default)]
    pub validated: u64,
    #[serde(default)]
    pub flagged: u64,
    #[serde(default)]
    pub figures: u64,
    #[serde(default)]
    pub by_month: BTreeMap<String, MonthInventory>,
}

impl InventorySnapshot {
    /// Absolute overwrite of one `(month, stage)` partition.
    pub fn record_month_stage(
        &mut self,
        month: &str,
        stage: InventoryStage,
        count: u64,
        run_id: Option<&str>,
    ) {
        match stage {
            InventoryStage::Validated | InventoryStage::Figures => {
                let entry = self.by_month.entry(month.to_string()).or_default();
                if stage == InventoryStage::Validated {
                    entry.validated = count;
                    entry.last_validated_run = run_id.map(str::to_string);
                } else {
                    entry.figures = count;
                    entry.last_figures_run = run_id.map(str::to_string);
                }
            }
            InventoryStage::Pdf => self.pdfs = count,
        }
        self.recompute_totals();
    }

    pub fn set_pdf_total(&mut self, count: u64) {
        self.pdfs = count;
    }

    pub fn set_flagged_total(&mut self, count: u64) {
        self.flagged = count;
    }

    pub fn recompute_totals(&mut self) {
        self.validated = self.by_month.values().map(|m| m.validated).sum();
        self.figures = self.by_month.values().map(|m| m.figures).sum();
    }
}

#[must_use]
pub fn derive_run_id(stage: &str, started_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.as_bytes());
    hasher.update(b"|");
    hasher.update(started_at.to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..12].to_string()
}

/// Single writer per run. Batches `record_completion` calls and publishes a
/// status snapshot at most once per batch window; `start_stage` and the
/// sealing calls always publish. Not for concurrent mutation — parallel
/// document workers must funnel completions through one owner.
pub struct PipelineStatusWriter {
    store: Arc<dyn ObjectStore>,
    batch_size: usize,
    batch_interval: Duration,
    current: Option<StageRunStatus>,
    pending_completions: usize,
    last_write: Option<Instant>,
    last_written_counts: Option<RunCounts>,
}

impl PipelineStatusWriter {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_batch_policy(store, BATCH_SIZE, Duration::from_secs(BATCH_SECONDS))
    }

    #[must_use]
    pub fn with_batch_policy(
        store: Arc<dyn ObjectStore>,
        batch_size: usize,
        batch_interval: Duration,
    ) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            batch_interval,
            current: None,
            pending_completions: 0,
            last_write: None,
            last_written_counts: None,
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<&StageRunStatus> {
        self.current.as_ref()
    }

    /// Begin a stage run: reset the batch state and publish an initial
    /// `in_progress` snapshot immediately. Returns the derived run id.
    pub fn start_stage(&mut self, stage: &str, month: Option<&str>, total: u64) -> String {
        let started_at = Utc::now();
        let run_id = derive_run_id(stage, started_at);
        self.current = Some(StageRunStatus {
            stage: stage.to_string(),
            month: month.map(str::to_string),
            run_id: Some(run_id.clone()),
            started_at,
            updated_at: started_at,
            status: RunState::InProgress,
            counts: RunCounts {
                total,
                completed: 0,
                failed: 0,
            },
            error: None,
        });
        self.pending_completions = 0;
        self.last_written_counts = None;
        self.publish_current();
        run_id
    }

    /// Record one finished document. Publishes when the batch size or the
    /// batch interval has been reached, and only if the counts moved since
    /// the last successful write.
    pub fn record_completion(&mut self, succeeded: bool) -> anyhow::Result<()> {
        let status = self
            .current
            .as_mut()
            .ok_or_else(|| anyhow!("no_active_stage"))?;
        if succeeded {
            status.counts.completed += 1;
        } else {
            status.counts.failed += 1;
        }
        status.updated_at = Utc::now();
        self.pending_completions += 1;

        let due_by_size = self.pending_completions >= self.batch_size;
        let due_by_time = self
            .last_write
            .map(|at| at.elapsed() >= self.batch_interval)
            .unwrap_or(true);
        if due_by_size || due_by_time {
            self.publish_current();
        }
        Ok(())
    }

    /// Seal the run as completed, force a final write, then fold this run's
    /// absolute completed count into the monthly inventory.
    pub fn finish_stage(&mut self) -> anyhow::Result<StageRunStatus> {
        let mut status = self.current.take().ok_or_else(|| anyhow!("no_active_stage"))?;
        status.status = RunState::Completed;
        status.updated_at = Utc::now();
        put_json(self.store.as_ref(), STATUS_KEY, &status).context("publish final status")?;
        self.pending_completions = 0;
        self.last_write = Some(Instant::now());
        self.last_written_counts = Some(status.counts);

        if let Some(stage) = InventoryStage::from_stage_name(&status.stage) {
            let month = status.month.clone();
            let run_id = status.run_id.clone();
            let count = status.counts.completed;
            match (stage, month) {
                (InventoryStage::Pdf, _) => {
                    self.update_inventory(|inv| inv.set_pdf_total(count))?;
                }
                (stage, Some(month)) => {
                    self.update_inventory(|inv| {
                        inv.record_month_stage(&month, stage, count, run_id.as_deref());
                    })?;
                }
                // No month partition to attribute the count to.
                (_, None) => {}
            }
        }
        Ok(status)
    }

    /// Seal the run as failed and force a final write. No inventory update:
    /// a failed run has no trustworthy absolute count.
    pub fn write_failure(&mut self, reason: &str) -> anyhow::Result<StageRunStatus> {
        let mut status = self.current.take().ok_or_else(|| anyhow!("no_active_stage"))?;
        status.status = RunState::Failed;
        status.error = Some(reason.to_string());
        status.updated_at = Utc::now();
        put_json(self.store.as_ref(), STATUS_KEY, &status).context("publish failure status")?;
        self.pending_completions = 0;
        self.last_write = Some(Instant::now());
        self.last_written_counts = Some(status.counts);
        Ok(status)
    }

    /// Download-edit-recompute-upload of the inventory snapshot. A missing
    /// object is an empty baseline, so the first run bootstraps it.
    pub fn update_inventory<F>(&self, edit: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut InventorySnapshot),
    {
        let mut inventory: InventorySnapshot =
            get_json(self.store.as_ref(), INVENTORY_KEY)?.unwrap_or_default();
        edit(&mut inventory);
        inventory.recompute_totals();
        inventory.updated_at = Some(Utc::now());
        put_json(self.store.as_ref(), INVENTORY_KEY, &inventory).context("publish inventory")
    }

    fn publish_current(&mut self) {
        let Some(status) = self.current.as_ref() else {
            return;
        };
        if self.last_written_counts == Some(status.counts) {
            return;
        }
        match put_json(self.store.as_ref(), STATUS_KEY, status) {
            Ok(()) => {
                self.pending_completions = 0;
                self.last_write = Some(Instant::now());
                self.last_written_counts = Some(status.counts);
            }
            Err(e) => {
                // Counters stay un-advanced; the next trigger retries.
                tracing::warn!(error = %format!("{e:#}"), "status snapshot write failed");
            }
        }
    }
}
