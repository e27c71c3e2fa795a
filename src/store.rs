use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Flat key/value blob store with list-by-prefix. Keys are slash-separated
/// strings, not filesystem paths. `get` maps "not found" to `Ok(None)`; only
/// transport/storage failures are errors.
pub trait ObjectStore: Send + Sync {
    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Upstream text objects are usually UTF-8 but legacy feeds still ship
/// GB18030. Decode permissively rather than failing the document.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (text, _, _) = encoding_rs::GB18030.decode(bytes);
            text.into_owned()
        }
    }
}

pub fn get_text(store: &dyn ObjectStore, key: &str) -> anyhow::Result<Option<String>> {
    Ok(store.get(key)?.map(|bytes| decode_text(&bytes)))
}

pub fn get_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    key: &str,
) -> anyhow::Result<Option<T>> {
    match store.get(key)? {
        None => Ok(None),
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .with_context(|| format!("parse json object: {key}"))?;
            Ok(Some(value))
        }
    }
}

pub fn put_json<T: Serialize>(store: &dyn ObjectStore, key: &str, value: &T) -> anyhow::Result<()> {
    let bytes =
        serde_json::to_vec_pretty(value).with_context(|| format!("serialize json object: {key}"))?;
    store.put(key, &bytes)
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .expect("memory store lock")
            .keys()
            .cloned()
            .collect()
    }
}

impl ObjectStore for MemoryStore {
    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let objects = self.objects.lock().expect("memory store lock");
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let objects = self.objects.lock().expect("memory store lock");
        Ok(objects.get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let mut objects = self.objects.lock().expect("memory store lock");
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Store rooted at a local directory. Keys map to relative paths under the
/// root; `put` creates missing parents.
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create store root: {}", root.display()))?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in key.split('/').filter(|p| !p.is_empty() && *p != "..") {
            path.push(part);
        }
        path
    }
}

impl ObjectStore for LocalDirStore {
    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut keys: Vec<String> = Vec::new();
        walk_files(&self.root, &self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.key_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read object: {}", path.display())),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create object dir: {}", parent.display()))?;
        }
        std::fs::write(&path, bytes).with_context(|| format!("write object: {}", path.display()))
    }
}

fn walk_files(dir: &Path, root: &Path, out: &mut Vec<String>) -> anyhow::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("list dir: {}", dir.display())),
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("list dir: {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            walk_files(&path, root, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push(key);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrip_and_prefix_list() {
        let store = MemoryStore::new();
        store.put("validated/p1.md", b"hello").expect("put");
        store.put("validated/p2.md", b"world").expect("put");
        store.put("pdf/p1.pdf", b"%PDF").expect("put");

        assert_eq!(store.get("validated/p1.md").expect("get"), Some(b"hello".to_vec()));
        assert_eq!(store.get("missing").expect("get"), None);
        let keys = store.list("validated/").expect("list");
        assert_eq!(keys, vec!["validated/p1.md", "validated/p2.md"]);
    }

    #[test]
    fn local_dir_store_roundtrip_and_nested_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalDirStore::open(dir.path()).expect("open");
        store.put("figures/p1/fig-01.png", b"png").expect("put");
        store.put("status/pipeline-status.json", b"{}").expect("put");

        assert_eq!(
            store.get("figures/p1/fig-01.png").expect("get"),
            Some(b"png".to_vec())
        );
        assert_eq!(store.get("figures/p1/missing.png").expect("get"), None);
        assert_eq!(
            store.list("figures/").expect("list"),
            vec!["figures/p1/fig-01.png"]
        );
    }

    #[test]
    fn decode_text_falls_back_to_gb18030() {
        // "中文" in GB18030.
        let gbk: &[u8] = &[0xD6, 0xD0, 0xCE, 0xC4];
        assert_eq!(decode_text(gbk), "中文");
        assert_eq!(decode_text("plain".as_bytes()), "plain");
    }

    #[test]
    fn json_helpers_treat_missing_as_none() {
        let store = MemoryStore::new();
        let missing: Option<serde_json::Value> =
            get_json(&store, "status/inventory.json").expect("get json");
        assert!(missing.is_none());

        put_json(&store, "status/inventory.json", &serde_json::json!({"pdfs": 3}))
            .expect("put json");
        let loaded: Option<serde_json::Value> =
            get_json(&store, "status/inventory.json").expect("get json");
        assert_eq!(loaded.expect("value")["pdfs"], 3);
    }
}
