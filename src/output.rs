//! Output tree for one job.
//!
//! Everything is written under `<output>.InProcess`. At the end of the job
//! the working directory is renamed in one step, to `<output>` on success or
//! to `<output>.FAILURE` otherwise, so a partial tree never appears under
//! the final name. A push job promotes right before its completion is sent
//! and moves the tree on to the failed name if the push still fails.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::OutputConfig;
use crate::error::{PublishError, Result};
use crate::repository::Repository;

const WORK_SUFFIX: &str = ".InProcess";
const FAILED_SUFFIX: &str = ".FAILURE";

/// How the output tree was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalized {
    Promoted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub file_name: String,
    pub changed: Option<DateTime<Utc>>,
    pub title: String,
}

#[derive(Debug, Default)]
struct DirState {
    created: HashSet<PathBuf>,
    finalized: Option<Finalized>,
}

#[derive(Debug)]
pub struct OutputTree {
    final_dir: PathBuf,
    work_dir: PathBuf,
    failed_dir: PathBuf,
    dirs: Mutex<DirState>,
    manifest: Mutex<Vec<ManifestEntry>>,
    blob_lookup: tokio::sync::Mutex<()>,
    retry_delay: Duration,
    manifest_name: String,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl OutputTree {
    pub fn new(final_dir: impl Into<PathBuf>, config: &OutputConfig) -> Self {
        let final_dir = final_dir.into();
        Self {
            work_dir: with_suffix(&final_dir, WORK_SUFFIX),
            failed_dir: with_suffix(&final_dir, FAILED_SUFFIX),
            final_dir,
            dirs: Mutex::new(DirState::default()),
            manifest: Mutex::new(Vec::new()),
            blob_lookup: tokio::sync::Mutex::new(()),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            manifest_name: config.manifest_name.clone(),
        }
    }

    pub fn final_dir(&self) -> &Path {
        &self.final_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn failed_dir(&self) -> &Path {
        &self.failed_dir
    }

    /// Move leftovers from an earlier run of the same job out of the way
    /// and create a fresh working directory.
    pub async fn prepare(&self) -> Result<()> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        for dir in [&self.final_dir, &self.work_dir, &self.failed_dir] {
            if tokio::fs::try_exists(dir).await? {
                let aside = with_suffix(dir, &format!("-{}", stamp));
                tracing::warn!(
                    from = %dir.display(),
                    to = %aside.display(),
                    "Renaming leftover output directory"
                );
                tokio::fs::rename(dir, &aside).await?;
            }
        }
        self.ensure_dir(None).await?;
        Ok(())
    }

    /// Create `<work>/<subdir>` once; later calls are no-ops.
    pub async fn ensure_dir(&self, subdir: Option<&str>) -> Result<PathBuf> {
        let dir = match subdir {
            Some(sub) => self.work_dir.join(sub),
            None => self.work_dir.clone(),
        };
        {
            let state = self.dirs.lock();
            if state.finalized.is_some() {
                return Err(PublishError::Internal(
                    "output tree already finalized".to_string(),
                ));
            }
            if state.created.contains(&dir) {
                return Ok(dir);
            }
        }
        // create_dir_all tolerates a concurrent creator.
        tokio::fs::create_dir_all(&dir).await?;
        self.dirs.lock().created.insert(dir.clone());
        Ok(dir)
    }

    /// Write one file, retrying once after the configured delay.
    pub async fn write(&self, subdir: Option<&str>, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.ensure_dir(subdir).await?.join(file_name);
        let target = path.as_path();
        self.retry_once(target, move || tokio::fs::write(target, bytes))
            .await?;
        Ok(path)
    }

    async fn retry_once<F, Fut>(&self, path: &Path, mut attempt: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::io::Result<()>>,
    {
        if let Err(first) = attempt().await {
            tracing::warn!(
                path = %path.display(),
                error = %first,
                delay_ms = self.retry_delay.as_millis() as u64,
                "Write failed, retrying once"
            );
            tokio::time::sleep(self.retry_delay).await;
            attempt()
                .await
                .map_err(|source| PublishError::WriteFailed {
                    path: path.display().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Read back a file written by this job.
    pub async fn read(&self, subdir: Option<&str>, file_name: &str) -> Result<Vec<u8>> {
        let mut path = self.work_dir.clone();
        if let Some(sub) = subdir {
            path.push(sub);
        }
        path.push(file_name);
        Ok(tokio::fs::read(&path).await?)
    }

    /// Blob last-change lookup, one at a time.
    pub async fn blob_changed(
        &self,
        repository: &dyn Repository,
        doc_id: i64,
    ) -> Result<Option<DateTime<Utc>>> {
        let _guard = self.blob_lookup.lock().await;
        Ok(repository.blob_changed(doc_id).await?)
    }

    pub fn add_media(&self, entry: ManifestEntry) {
        self.manifest.lock().push(entry);
    }

    /// Write the media manifest if any media was processed. Returns its path.
    pub async fn write_manifest(&self) -> Result<Option<PathBuf>> {
        let mut entries = self.manifest.lock().clone();
        if entries.is_empty() {
            return Ok(None);
        }
        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        let text = render_manifest(&entries);
        let path = self.write(None, &self.manifest_name, text.as_bytes()).await?;
        tracing::info!(path = %path.display(), entries = entries.len(), "Media manifest written");
        Ok(Some(path))
    }

    /// Rename the working directory to the final name. Returns false if the
    /// tree was already finalized.
    pub async fn promote(&self) -> Result<bool> {
        self.finalize(Finalized::Promoted).await
    }

    /// Rename the tree to the failed-run name. A promoted tree is moved
    /// back out of the final name. Returns false if the tree had already
    /// failed.
    pub async fn fail(&self) -> Result<bool> {
        self.finalize(Finalized::Failed).await
    }

    pub fn finalized(&self) -> Option<Finalized> {
        self.dirs.lock().finalized
    }

    async fn finalize(&self, how: Finalized) -> Result<bool> {
        let (previous, source) = {
            let mut state = self.dirs.lock();
            let previous = state.finalized;
            let source = match (previous, how) {
                (None, _) => &self.work_dir,
                (Some(Finalized::Promoted), Finalized::Failed) => &self.final_dir,
                _ => return Ok(false),
            };
            state.finalized = Some(how);
            (previous, source)
        };
        let target = match how {
            Finalized::Promoted => &self.final_dir,
            Finalized::Failed => &self.failed_dir,
        };
        if let Err(e) = self.move_tree(source, target, how).await {
            self.dirs.lock().finalized = previous;
            return Err(e);
        }
        Ok(true)
    }

    async fn move_tree(&self, source: &Path, target: &Path, how: Finalized) -> Result<()> {
        if !tokio::fs::try_exists(source).await? {
            tracing::debug!(dir = %source.display(), "No output directory to rename");
            return Ok(());
        }
        if how == Finalized::Failed && tokio::fs::try_exists(target).await? {
            let stamp = Utc::now().format("%Y%m%d%H%M%S");
            tokio::fs::rename(target, with_suffix(target, &format!("-{}", stamp))).await?;
        }
        tokio::fs::rename(source, target).await?;
        tracing::info!(dir = %target.display(), outcome = ?how, "Output tree finalized");
        Ok(())
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_manifest(entries: &[ManifestEntry]) -> String {
    let mut text = String::new();
    for entry in entries {
        let date = entry
            .changed
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        text.push_str(&format!(
            "{},{},{}\n",
            csv_field(&entry.file_name),
            date,
            csv_field(&entry.title)
        ));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(tmp: &TempDir) -> OutputTree {
        let config = OutputConfig {
            retry_delay_ms: 10,
            ..Default::default()
        };
        OutputTree::new(tmp.path().join("job-1"), &config)
    }

    #[tokio::test]
    async fn writes_land_in_working_dir_until_promoted() {
        let tmp = TempDir::new().unwrap();
        let out = tree(&tmp);
        out.prepare().await.unwrap();
        out.write(Some("Summary"), "1.xml", b"<S/>").await.unwrap();

        assert!(out.work_dir().join("Summary/1.xml").exists());
        assert!(!out.final_dir().exists());

        assert!(out.promote().await.unwrap());
        assert!(out.final_dir().join("Summary/1.xml").exists());
        assert!(!out.work_dir().exists());
        assert_eq!(out.finalized(), Some(Finalized::Promoted));
    }

    #[tokio::test]
    async fn finalize_runs_once() {
        let tmp = TempDir::new().unwrap();
        let out = tree(&tmp);
        out.prepare().await.unwrap();
        out.write(None, "1.xml", b"x").await.unwrap();

        assert!(out.fail().await.unwrap());
        assert!(!out.fail().await.unwrap());
        assert!(!out.promote().await.unwrap());
        assert!(out.failed_dir().join("1.xml").exists());
        assert!(!out.final_dir().exists());
    }

    #[tokio::test]
    async fn prepare_moves_leftovers_aside() {
        let tmp = TempDir::new().unwrap();
        let out = tree(&tmp);
        std::fs::create_dir_all(out.final_dir()).unwrap();
        std::fs::write(out.final_dir().join("old.xml"), b"old").unwrap();

        out.prepare().await.unwrap();
        assert!(!out.final_dir().exists());
        assert!(out.work_dir().exists());
        let moved = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("job-1-"))
            .count();
        assert_eq!(moved, 1);
    }

    #[tokio::test]
    async fn write_failure_after_retry_is_reported() {
        let tmp = TempDir::new().unwrap();
        let out = tree(&tmp);
        out.prepare().await.unwrap();
        // A directory where the file should go makes both attempts fail.
        std::fs::create_dir_all(out.work_dir().join("1.xml")).unwrap();
        let err = out.write(None, "1.xml", b"x").await.unwrap_err();
        assert!(matches!(err, PublishError::WriteFailed { .. }));
    }

    #[tokio::test]
    async fn transient_write_failure_succeeds_on_retry() {
        let tmp = TempDir::new().unwrap();
        let out = tree(&tmp);
        out.prepare().await.unwrap();
        let path = out.work_dir().join("1.xml");

        let mut attempts = 0;
        out.retry_once(&path, || {
            attempts += 1;
            let first = attempts == 1;
            let path = path.clone();
            async move {
                if first {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, "share busy"));
                }
                tokio::fs::write(&path, b"<S/>").await
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(std::fs::read(&path).unwrap(), b"<S/>");
    }

    #[tokio::test]
    async fn failing_a_promoted_tree_moves_it_aside() {
        let tmp = TempDir::new().unwrap();
        let out = tree(&tmp);
        out.prepare().await.unwrap();
        out.write(None, "1.xml", b"x").await.unwrap();

        assert!(out.promote().await.unwrap());
        assert!(out.fail().await.unwrap());
        assert!(!out.final_dir().exists());
        assert!(out.failed_dir().join("1.xml").exists());
        assert_eq!(out.finalized(), Some(Finalized::Failed));
        assert!(!out.promote().await.unwrap());
    }

    #[tokio::test]
    async fn blocked_promotion_can_still_fail() {
        let tmp = TempDir::new().unwrap();
        let out = tree(&tmp);
        out.prepare().await.unwrap();
        out.write(None, "1.xml", b"x").await.unwrap();
        std::fs::create_dir_all(out.final_dir()).unwrap();
        std::fs::write(out.final_dir().join("other.txt"), b"y").unwrap();

        assert!(out.promote().await.is_err());
        assert_eq!(out.finalized(), None);

        assert!(out.fail().await.unwrap());
        assert!(out.failed_dir().join("1.xml").exists());
        assert!(out.final_dir().join("other.txt").exists());
    }

    #[tokio::test]
    async fn manifest_is_written_only_with_media() {
        let tmp = TempDir::new().unwrap();
        let out = tree(&tmp);
        out.prepare().await.unwrap();
        assert!(out.write_manifest().await.unwrap().is_none());

        let changed = DateTime::parse_from_rfc3339("2021-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        out.add_media(ManifestEntry {
            file_name: "9.jpg".to_string(),
            changed: Some(changed),
            title: "Heart, anterior view".to_string(),
        });
        out.add_media(ManifestEntry {
            file_name: "10.gif".to_string(),
            changed: None,
            title: "Lung".to_string(),
        });
        let path = out.write_manifest().await.unwrap().unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text, "10.gif,,Lung\n9.jpg,2021-03-04,\"Heart, anterior view\"\n");
    }
}
