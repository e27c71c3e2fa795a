use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{get_text, ObjectStore};

pub const VALIDATED_MANIFEST_PREFIX: &str = "indexes/validated/manifest-";
pub const FLAGGED_MANIFEST_PREFIX: &str = "indexes/flagged/manifest-";
pub const RUNS_PREFIX: &str = "indexes/runs/";
pub const BY_PAPER_PREFIX: &str = "indexes/validated/by-paper/";
pub const TITLE_CLAMP_PREFIX: &str = "reports/title_clamps/";

const MANIFEST_HEADER: &str = "paper_id,source_keys,selection_key,validated_key,pdf_key,model,in_tokens,out_tokens,cost_usd,run_id,git_sha,timestamp";
const RUNS_HEADER: &str =
    "run_id,git_sha,started_at,finished_at,validated,flagged,upload_failures,in_tokens,out_tokens,cost_usd";

/// One published document, one row in the day's manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestRow {
    pub paper_id: String,
    pub source_keys: Vec<String>,
    pub selection_key: String,
    pub validated_key: String,
    pub pdf_key: String,
    pub model: String,
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub cost_usd: f64,
    pub run_id: String,
    pub git_sha: String,
    pub timestamp: DateTime<Utc>,
}

impl ManifestRow {
    #[must_use]
    pub fn csv_line(&self) -> String {
        [
            csv_field(&self.paper_id),
            csv_field(&self.source_keys.join(";")),
            csv_field(&self.selection_key),
            csv_field(&self.validated_key),
            csv_field(&self.pdf_key),
            csv_field(&self.model),
            self.in_tokens.to_string(),
            self.out_tokens.to_string(),
            format!("{:.6}", self.cost_usd),
            csv_field(&self.run_id),
            csv_field(&self.git_sha),
            self.timestamp.to_rfc3339(),
        ]
        .join(",")
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PaperPointer {
    pub paper_id: String,
    pub validated_key: String,
    pub pdf_key: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TitleClamp {
    pub paper_id: String,
    pub original: String,
    pub clamped: String,
    pub max_chars: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub git_sha: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub validated: usize,
    pub flagged: usize,
    pub upload_failures: usize,
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub cost_usd: f64,
}

/// Appends rows to the date-partitioned manifests and writes the per-run
/// summary. One failed upload is that document's problem, not the batch's.
pub struct PublishManifestAccumulator {
    store: Arc<dyn ObjectStore>,
    run_id: String,
    git_sha: String,
    started_at: DateTime<Utc>,
    validated: usize,
    flagged: usize,
    upload_failures: usize,
    in_tokens: u64,
    out_tokens: u64,
    cost_usd: f64,
}

impl PublishManifestAccumulator {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, run_id: &str, git_sha: &str) -> Self {
        Self {
            store,
            run_id: run_id.to_string(),
            git_sha: git_sha.to_string(),
            started_at: Utc::now(),
            validated: 0,
            flagged: 0,
            upload_failures: 0,
            in_tokens: 0,
            out_tokens: 0,
            cost_usd: 0.0,
        }
    }

    /// Returns false when the upload failed; the batch keeps going.
    pub fn append_validated(&mut self, row: &ManifestRow) -> bool {
        let day = row.timestamp.format("%Y%m%d");
        let key = format!("{VALIDATED_MANIFEST_PREFIX}{day}.csv");
        let appended = self.append_row(&key, MANIFEST_HEADER, &row.csv_line());
        if !appended {
            return false;
        }
        self.validated += 1;
        self.in_tokens += row.in_tokens;
        self.out_tokens += row.out_tokens;
        self.cost_usd += row.cost_usd;

        let pointer = PaperPointer {
            paper_id: row.paper_id.clone(),
            validated_key: row.validated_key.clone(),
            pdf_key: row.pdf_key.clone(),
            run_id: self.run_id.clone(),
            timestamp: row.timestamp,
        };
        let pointer_key = format!("{BY_PAPER_PREFIX}{}.json", row.paper_id);
        if let Err(e) = crate::store::put_json(self.store.as_ref(), &pointer_key, &pointer) {
            self.upload_failures += 1;
            tracing::warn!(paper_id = %row.paper_id, error = %format!("{e:#}"), "paper pointer write failed");
        }
        true
    }

    pub fn append_flagged(&mut self, row: &ManifestRow) -> bool {
        let day = row.timestamp.format("%Y%m%d");
        let key = format!("{FLAGGED_MANIFEST_PREFIX}{day}.csv");
        let appended = self.append_row(&key, MANIFEST_HEADER, &row.csv_line());
        if appended {
            self.flagged += 1;
            self.in_tokens += row.in_tokens;
            self.out_tokens += row.out_tokens;
            self.cost_usd += row.cost_usd;
        }
        appended
    }

    pub fn write_title_clamp_report(&self, clamps: &[TitleClamp]) -> anyhow::Result<()> {
        if clamps.is_empty() {
            return Ok(());
        }
        let key = format!(
            "{TITLE_CLAMP_PREFIX}{}.json",
            Utc::now().format("%Y%m%dT%H%M%SZ")
        );
        crate::store::put_json(self.store.as_ref(), &key, &clamps)
            .context("write title clamp report")
    }

    /// Seal the run: append one summary row to the day's run index.
    pub fn finish_run(&mut self) -> anyhow::Result<RunSummary> {
        let finished_at = Utc::now();
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            git_sha: self.git_sha.clone(),
            started_at: self.started_at,
            finished_at,
            validated: self.validated,
            flagged: self.flagged,
            upload_failures: self.upload_failures,
            in_tokens: self.in_tokens,
            out_tokens: self.out_tokens,
            cost_usd: self.cost_usd,
        };
        let key = format!("{RUNS_PREFIX}{}.csv", finished_at.format("%Y%m%d"));
        let line = [
            csv_field(&summary.run_id),
            csv_field(&summary.git_sha),
            summary.started_at.to_rfc3339(),
            summary.finished_at.to_rfc3339(),
            summary.validated.to_string(),
            summary.flagged.to_string(),
            summary.upload_failures.to_string(),
            summary.in_tokens.to_string(),
            summary.out_tokens.to_string(),
            format!("{:.6}", summary.cost_usd),
        ]
        .join(",");
        if !self.append_row(&key, RUNS_HEADER, &line) {
            return Err(anyhow::anyhow!("run_summary_write_failed"));
        }
        Ok(summary)
    }

    #[must_use]
    pub fn upload_failures(&self) -> usize {
        self.upload_failures
    }

    // No native append on the store: read current, add the line, rewrite the
    // whole object. A line already present is not appended again, so reruns
    // of the same batch stay idempotent.
    fn append_row(&mut self, key: &str, header: &str, line: &str) -> bool {
        let result = (|| -> anyhow::Result<()> {
            let current = get_text(self.store.as_ref(), key)?
                .unwrap_or_else(|| format!("{header}\n"));
            if current.lines().any(|l| l == line) {
                return Ok(());
            }
            let mut next = current;
            if !next.ends_with('\n') {
                next.push('\n');
            }
            next.push_str(line);
            next.push('\n');
            self.store.put(key, next.as_bytes())
        })();
        match result {
            Ok(()) => true,
            Err(e) => {
                self.upload_failures += 1;
                tracing::warn!(key, error = %format!("{e:#}"), "manifest append failed");
                false
            }
        }
    }
}
