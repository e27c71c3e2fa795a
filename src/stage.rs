use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::ObjectStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    Pending,
    Processing,
    Complete,
    Failed,
    Skipped,
}

impl StageState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Processing => "processing",
            StageState::Complete => "complete",
            StageState::Failed => "failed",
            StageState::Skipped => "skipped",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    #[default]
    Pending,
    Processing,
    Complete,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Text,
    Figures,
    Pdf,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Text, ArtifactKind::Figures, ArtifactKind::Pdf];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Text => "text",
            ArtifactKind::Figures => "figures",
            ArtifactKind::Pdf => "pdf",
        }
    }
}

/// One row per document, upsert-only. The database query layer is external;
/// rows travel through here as typed values.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DocumentStageStatus {
    pub id: String,
    #[serde(default)]
    pub processing_status: ProcessingState,
    #[serde(default)]
    pub text_status: StageState,
    #[serde(default)]
    pub figures_status: StageState,
    #[serde(default)]
    pub pdf_status: StageState,
    #[serde(default)]
    pub text_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub figures_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pdf_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub has_chinese_pdf: bool,
    #[serde(default)]
    pub has_english_pdf: bool,
}

impl DocumentStageStatus {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn stage(&self, kind: ArtifactKind) -> StageState {
        match kind {
            ArtifactKind::Text => self.text_status,
            ArtifactKind::Figures => self.figures_status,
            ArtifactKind::Pdf => self.pdf_status,
        }
    }

    fn stage_slot(&mut self, kind: ArtifactKind) -> (&mut StageState, &mut Option<DateTime<Utc>>) {
        match kind {
            ArtifactKind::Text => (&mut self.text_status, &mut self.text_completed_at),
            ArtifactKind::Figures => (&mut self.figures_status, &mut self.figures_completed_at),
            ArtifactKind::Pdf => (&mut self.pdf_status, &mut self.pdf_completed_at),
        }
    }

    pub fn set_stage(&mut self, kind: ArtifactKind, state: StageState, now: DateTime<Utc>) {
        let (slot, completed_at) = self.stage_slot(kind);
        *slot = state;
        match state {
            StageState::Complete => {
                if completed_at.is_none() {
                    *completed_at = Some(now);
                }
            }
            _ => *completed_at = None,
        }
        if kind == ArtifactKind::Pdf {
            self.has_english_pdf = state == StageState::Complete;
        }
        self.recompute_overall();
    }

    /// No partially-complete bucket at the overall level: all three stages
    /// complete, or pending.
    pub fn recompute_overall(&mut self) {
        let all_complete = ArtifactKind::ALL
            .iter()
            .all(|&k| self.stage(k) == StageState::Complete);
        self.processing_status = if all_complete {
            ProcessingState::Complete
        } else {
            ProcessingState::Pending
        };
    }

    fn observe(&mut self, kind: ArtifactKind, present: bool, now: DateTime<Utc>) -> Observation {
        let before = self.stage(kind);
        let (slot, completed_at) = self.stage_slot(kind);
        let observation = if present {
            if *slot == StageState::Complete {
                Observation::Unchanged
            } else {
                *slot = StageState::Complete;
                // Set once, on first observed completion.
                if completed_at.is_none() {
                    *completed_at = Some(now);
                }
                Observation::Promoted
            }
        } else {
            match before {
                // A terminal failure is never rewritten to a false pending.
                StageState::Failed | StageState::Skipped => Observation::Unchanged,
                // A live run owns this stage; the scan says nothing yet.
                StageState::Processing => Observation::Unchanged,
                StageState::Complete => {
                    *slot = StageState::Pending;
                    *completed_at = None;
                    Observation::Demoted
                }
                StageState::Pending => Observation::Unchanged,
            }
        };
        if kind == ArtifactKind::Pdf {
            self.has_english_pdf = self.pdf_status == StageState::Complete;
        }
        self.recompute_overall();
        observation
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Observation {
    Promoted,
    Demoted,
    Unchanged,
}

/// Rows keyed by document id. Insert-or-update only; rows are never removed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DocumentLedger {
    rows: BTreeMap<String, DocumentStageStatus>,
}

impl DocumentLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &str) -> &mut DocumentStageStatus {
        self.rows
            .entry(id.to_string())
            .or_insert_with(|| DocumentStageStatus::new(id))
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&DocumentStageStatus> {
        self.rows.get(id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &DocumentStageStatus> {
        self.rows.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Where each artifact kind lives in the store. The document id is the first
/// path segment after the prefix, minus any file extension.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactLayout {
    pub validated_prefix: String,
    pub figures_prefix: String,
    pub pdf_prefix: String,
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self {
            validated_prefix: "validated/".to_string(),
            figures_prefix: "figures/".to_string(),
            pdf_prefix: "pdf/".to_string(),
        }
    }
}

impl ArtifactLayout {
    #[must_use]
    pub fn prefix(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Text => &self.validated_prefix,
            ArtifactKind::Figures => &self.figures_prefix,
            ArtifactKind::Pdf => &self.pdf_prefix,
        }
    }
}

fn doc_id_from_key(key: &str, prefix: &str) -> Option<String> {
    let rest = key.strip_prefix(prefix)?;
    let first = rest.split('/').next()?;
    if first.is_empty() {
        return None;
    }
    let id = match first.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => first,
    };
    Some(id.to_string())
}

/// Which documents have which artifacts, as actually observed in the store.
#[derive(Clone, Debug, Default)]
pub struct ArtifactPresence {
    pub text: HashSet<String>,
    pub figures: HashSet<String>,
    pub pdfs: HashSet<String>,
}

impl ArtifactPresence {
    #[must_use]
    pub fn contains(&self, kind: ArtifactKind, id: &str) -> bool {
        match kind {
            ArtifactKind::Text => self.text.contains(id),
            ArtifactKind::Figures => self.figures.contains(id),
            ArtifactKind::Pdf => self.pdfs.contains(id),
        }
    }

    fn ids(&self) -> HashSet<&String> {
        self.text
            .iter()
            .chain(self.figures.iter())
            .chain(self.pdfs.iter())
            .collect()
    }
}

/// Marker for a reconciliation scan failure; maps to exit code 2 at the CLI.
#[derive(Debug)]
pub struct ScanError(pub String);

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reconciliation scan failed: {}", self.0)
    }
}

impl std::error::Error for ScanError {}

/// Scan all three presence sets concurrently, one scan per artifact kind.
/// Any failing scan aborts the whole reconciliation: applying a subset would
/// demote documents whose artifacts simply went unscanned.
pub fn scan_presence(
    store: &dyn ObjectStore,
    layout: &ArtifactLayout,
) -> anyhow::Result<ArtifactPresence> {
    let scan = |kind: ArtifactKind| -> anyhow::Result<HashSet<String>> {
        let prefix = layout.prefix(kind);
        let keys = store
            .list(prefix)
            .with_context(|| format!("scan {} artifacts under {prefix}", kind.as_str()))?;
        Ok(keys
            .iter()
            .filter_map(|k| doc_id_from_key(k, prefix))
            .collect())
    };

    let (text, figures, pdfs) = std::thread::scope(|scope| {
        let text = scope.spawn(|| scan(ArtifactKind::Text));
        let figures = scope.spawn(|| scan(ArtifactKind::Figures));
        let pdfs = scope.spawn(|| scan(ArtifactKind::Pdf));
        (
            text.join().map_err(|_| anyhow!("text_scan_panicked")),
            figures.join().map_err(|_| anyhow!("figures_scan_panicked")),
            pdfs.join().map_err(|_| anyhow!("pdf_scan_panicked")),
        )
    });

    let mut first_error: Option<anyhow::Error> = None;
    let mut unwrap_scan = |joined: Result<anyhow::Result<HashSet<String>>, anyhow::Error>| {
        match joined {
            Ok(Ok(ids)) => Some(ids),
            Ok(Err(e)) | Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
                None
            }
        }
    };

    let text = unwrap_scan(text);
    let figures = unwrap_scan(figures);
    let pdfs = unwrap_scan(pdfs);
    if let Some(e) = first_error {
        return Err(anyhow::Error::new(ScanError(format!("{e:#}"))));
    }

    Ok(ArtifactPresence {
        text: text.unwrap_or_default(),
        figures: figures.unwrap_or_default(),
        pdfs: pdfs.unwrap_or_default(),
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub documents: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub orphans: usize,
}

/// Apply an observed presence snapshot to every ledger row. Pure with respect
/// to the store; callers obtain `presence` from `scan_presence`.
pub fn reconcile(
    ledger: &mut DocumentLedger,
    presence: &ArtifactPresence,
    now: DateTime<Utc>,
) -> ReconcileReport {
    let mut report = ReconcileReport {
        documents: ledger.len(),
        ..ReconcileReport::default()
    };
    for row in ledger.rows.values_mut() {
        for kind in ArtifactKind::ALL {
            match row.observe(kind, presence.contains(kind, &row.id), now) {
                Observation::Promoted => report.promoted += 1,
                Observation::Demoted => report.demoted += 1,
                Observation::Unchanged => {}
            }
        }
    }
    // Artifacts for unknown ids are upstream's to register, not ours to invent.
    report.orphans = presence
        .ids()
        .into_iter()
        .filter(|id| !ledger.rows.contains_key(*id))
        .count();
    report
}

/// Scan then reconcile. The ledger is untouched unless every scan succeeded.
pub fn backfill(
    store: &dyn ObjectStore,
    ledger: &mut DocumentLedger,
    layout: &ArtifactLayout,
    now: DateTime<Utc>,
) -> anyhow::Result<ReconcileReport> {
    let presence = scan_presence(store, layout)?;
    Ok(reconcile(ledger, &presence, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct BrokenFiguresStore {
        inner: MemoryStore,
    }

    impl ObjectStore for BrokenFiguresStore {
        fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
            if prefix.starts_with("figures/") {
                return Err(anyhow!("list_timeout"));
            }
            self.inner.list(prefix)
        }

        fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
            self.inner.put(key, bytes)
        }
    }

    fn now() -> DateTime<Utc> {
        "2026-08-06T12:00:00Z".parse().expect("timestamp")
    }

    #[test]
    fn failed_stage_survives_an_absent_artifact() {
        let mut ledger = DocumentLedger::new();
        ledger
            .register("d1")
            .set_stage(ArtifactKind::Text, StageState::Failed, now());

        let report = reconcile(&mut ledger, &ArtifactPresence::default(), now());
        assert_eq!(ledger.get("d1").expect("row").text_status, StageState::Failed);
        assert_eq!(report.demoted, 0);
    }

    #[test]
    fn observed_artifact_promotes_failed_to_complete_and_stamps_once() {
        let mut ledger = DocumentLedger::new();
        ledger
            .register("d1")
            .set_stage(ArtifactKind::Text, StageState::Failed, now());

        let mut presence = ArtifactPresence::default();
        presence.text.insert("d1".to_string());

        let first = now();
        reconcile(&mut ledger, &presence, first);
        let stamped = ledger.get("d1").expect("row").text_completed_at;
        assert_eq!(ledger.get("d1").expect("row").text_status, StageState::Complete);
        assert_eq!(stamped, Some(first));

        // A rerun later must not move the completion timestamp.
        let later = first + chrono::Duration::hours(3);
        reconcile(&mut ledger, &presence, later);
        assert_eq!(ledger.get("d1").expect("row").text_completed_at, Some(first));
    }

    #[test]
    fn overall_is_complete_only_when_all_stages_are() {
        let mut presence = ArtifactPresence::default();
        presence.text.insert("d1".to_string());
        presence.figures.insert("d1".to_string());

        let mut ledger = DocumentLedger::new();
        ledger.register("d1");
        reconcile(&mut ledger, &presence, now());
        assert_eq!(
            ledger.get("d1").expect("row").processing_status,
            ProcessingState::Pending
        );

        presence.pdfs.insert("d1".to_string());
        reconcile(&mut ledger, &presence, now());
        let row = ledger.get("d1").expect("row");
        assert_eq!(row.processing_status, ProcessingState::Complete);
        assert!(row.has_english_pdf);
    }

    #[test]
    fn vanished_artifact_demotes_complete_but_not_failed() {
        let mut ledger = DocumentLedger::new();
        {
            let row = ledger.register("d1");
            row.set_stage(ArtifactKind::Text, StageState::Complete, now());
            row.set_stage(ArtifactKind::Figures, StageState::Failed, now());
        }
        let report = reconcile(&mut ledger, &ArtifactPresence::default(), now());
        let row = ledger.get("d1").expect("row");
        assert_eq!(row.text_status, StageState::Pending);
        assert_eq!(row.text_completed_at, None);
        assert_eq!(row.figures_status, StageState::Failed);
        assert_eq!(report.demoted, 1);
    }

    #[test]
    fn presence_scan_extracts_ids_from_all_key_shapes() {
        let store = MemoryStore::new();
        store.put("validated/d1.md", b"text").expect("put");
        store.put("figures/d2/fig-01.png", b"png").expect("put");
        store.put("pdf/d3.pdf", b"%PDF").expect("put");

        let presence = scan_presence(&store, &ArtifactLayout::default()).expect("scan");
        assert!(presence.contains(ArtifactKind::Text, "d1"));
        assert!(presence.contains(ArtifactKind::Figures, "d2"));
        assert!(presence.contains(ArtifactKind::Pdf, "d3"));
        assert!(!presence.contains(ArtifactKind::Text, "d2"));
    }

    #[test]
    fn one_failing_scan_aborts_without_touching_any_row() {
        let store = BrokenFiguresStore {
            inner: MemoryStore::new(),
        };
        store.put("validated/d1.md", b"text").expect("put");

        let mut ledger = DocumentLedger::new();
        ledger
            .register("d1")
            .set_stage(ArtifactKind::Text, StageState::Complete, now());
        let before = ledger.get("d1").expect("row").clone();

        let err = backfill(&store, &mut ledger, &ArtifactLayout::default(), now())
            .expect_err("must abort");
        assert!(err.is::<ScanError>());
        let after = ledger.get("d1").expect("row");
        assert_eq!(after.text_status, before.text_status);
        assert_eq!(after.text_completed_at, before.text_completed_at);
    }

    #[test]
    fn orphan_artifacts_are_counted_not_registered() {
        let store = MemoryStore::new();
        store.put("validated/ghost.md", b"text").expect("put");
        let mut ledger = DocumentLedger::new();
        let report =
            backfill(&store, &mut ledger, &ArtifactLayout::default(), now()).expect("backfill");
        assert_eq!(report.orphans, 1);
        assert!(ledger.is_empty());
    }
}
