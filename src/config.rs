use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::stage::ArtifactLayout;

pub const CONFIG_FILENAME: &str = "scholargate.toml";
pub const CONFIG_ENV: &str = "SCHOLARGATE_CONFIG";
pub const STORE_ROOT_ENV: &str = "SCHOLARGATE_STORE_ROOT";

/// Missing or unusable required configuration; maps to exit code 1 at the
/// CLI, before any document state is touched.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub alerts: AlertsSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct StoreSection {
    /// Root directory of the object store. Required (or via
    /// SCHOLARGATE_STORE_ROOT) for every command that touches the store.
    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default)]
    pub validated_prefix: Option<String>,
    #[serde(default)]
    pub figures_prefix: Option<String>,
    #[serde(default)]
    pub pdf_prefix: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PipelineSection {
    /// Completions per status snapshot write.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Seconds between forced status snapshot writes.
    #[serde(default)]
    pub batch_seconds: Option<u64>,

    /// Recorded in manifests; falls back to the GIT_SHA env var.
    #[serde(default)]
    pub git_sha: Option<String>,

    /// Local JSON file holding the exported document-status rows the
    /// backfill command reconciles.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AlertsSection {
    #[serde(default)]
    pub window_minutes: Option<u64>,
}

impl AppConfig {
    #[must_use]
    pub fn layout(&self) -> ArtifactLayout {
        let defaults = ArtifactLayout::default();
        ArtifactLayout {
            validated_prefix: self
                .store
                .validated_prefix
                .clone()
                .unwrap_or(defaults.validated_prefix),
            figures_prefix: self
                .store
                .figures_prefix
                .clone()
                .unwrap_or(defaults.figures_prefix),
            pdf_prefix: self.store.pdf_prefix.clone().unwrap_or(defaults.pdf_prefix),
        }
    }

    pub fn store_root(&self) -> anyhow::Result<PathBuf> {
        if let Some(root) = self.store.root.as_ref() {
            return Ok(root.clone());
        }
        if let Ok(root) = std::env::var(STORE_ROOT_ENV) {
            if !root.trim().is_empty() {
                return Ok(PathBuf::from(root));
            }
        }
        Err(anyhow::Error::new(ConfigError(format!(
            "store root not set ([store].root in {CONFIG_FILENAME} or {STORE_ROOT_ENV})"
        ))))
    }

    #[must_use]
    pub fn git_sha(&self) -> String {
        self.pipeline
            .git_sha
            .clone()
            .or_else(|| std::env::var("GIT_SHA").ok())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

pub fn find_file_upwards(start: &Path, filename: &str, max_depth: usize) -> Option<PathBuf> {
    let mut dir = Some(start.to_path_buf());
    for _ in 0..max_depth {
        let d = dir?;
        let candidate = d.join(filename);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = d.parent().map(Path::to_path_buf);
    }
    None
}

pub fn find_default_config(workdir: &Path) -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        let p = PathBuf::from(explicit);
        if p.is_file() {
            return Some(p);
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, CONFIG_FILENAME, 8) {
            return Some(p);
        }
    }
    find_file_upwards(workdir, CONFIG_FILENAME, 8)
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}

/// Resolve the config for a CLI invocation: explicit path, else upward
/// search, else built-in defaults (env vars can still supply the store root).
pub fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<AppConfig> {
    match explicit {
        Some(path) => load_config(path),
        None => match find_default_config(Path::new(".")) {
            Some(path) => load_config(&path),
            None => Ok(AppConfig::default()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_parses_with_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("empty config");
        assert!(cfg.store.root.is_none());
        assert_eq!(cfg.layout().validated_prefix, "validated/");
    }

    #[test]
    fn sections_override_layout_prefixes() {
        let cfg: AppConfig = toml::from_str(
            r#"
[store]
root = "/srv/papers"
validated_prefix = "en/validated/"

[pipeline]
batch_size = 10
batch_seconds = 5
"#,
        )
        .expect("config");
        assert_eq!(cfg.layout().validated_prefix, "en/validated/");
        assert_eq!(cfg.layout().pdf_prefix, "pdf/");
        assert_eq!(cfg.pipeline.batch_size, Some(10));
        assert_eq!(
            cfg.store_root().expect("root"),
            PathBuf::from("/srv/papers")
        );
    }

    #[test]
    fn missing_store_root_is_a_config_error() {
        let cfg = AppConfig::default();
        if std::env::var(STORE_ROOT_ENV).is_ok() {
            return; // environment already provides one
        }
        let err = cfg.store_root().expect_err("must fail");
        assert!(err.is::<ConfigError>());
    }

    #[test]
    fn find_file_upwards_walks_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).expect("mkdirs");
        std::fs::write(dir.path().join(CONFIG_FILENAME), "").expect("write");

        let found = find_file_upwards(&nested, CONFIG_FILENAME, 8).expect("found");
        assert_eq!(found, dir.path().join(CONFIG_FILENAME));
        assert!(find_file_upwards(&nested, "nope.toml", 8).is_none());
    }
}
