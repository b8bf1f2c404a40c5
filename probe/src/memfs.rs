use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

/// In-memory filesystem a test stages its assets into. Tests must never
/// touch the host disk; every path is an absolute, `/`-separated string
/// rooted at the directive's staging root.
#[derive(Clone, Default)]
pub struct MemFs {
    files: Arc<DashMap<String, Bytes>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, path: &str, contents: impl Into<Bytes>) {
        self.files.insert(normalize(path), contents.into());
    }

    pub fn read(&self, path: &str) -> Option<Bytes> {
        self.files.get(&normalize(path)).map(|entry| entry.clone())
    }

    /// All files under a directory prefix, path plus contents.
    pub fn read_dir(&self, dir: &str) -> Vec<(String, Bytes)> {
        let prefix = format!("{}/", normalize(dir).trim_end_matches('/'));
        let mut files: Vec<(String, Bytes)> = self
            .files
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_and_list() {
        let fs = MemFs::new();
        fs.write("/staging/t1/manifest.json", &b"{}"[..]);
        fs.write("/staging/t1/evidence/report.json", &b"{\"ok\":true}"[..]);
        fs.write("/staging/t1/evidence/log.txt", &b"line"[..]);
        fs.write("/staging/t2/evidence/other.txt", &b"x"[..]);

        assert_eq!(fs.read("/staging/t1/manifest.json").unwrap(), &b"{}"[..]);
        assert!(fs.read("/staging/t1/missing").is_none());

        let evidence = fs.read_dir("/staging/t1/evidence");
        assert_eq!(evidence.len(), 2);
        assert!(evidence.iter().all(|(path, _)| path.contains("/t1/evidence/")));
    }

    #[test]
    fn relative_paths_are_rooted() {
        let fs = MemFs::new();
        fs.write("staging/a", &b"1"[..]);
        assert!(fs.read("/staging/a").is_some());
    }
}
