//! Resource discovery and the bounded copy scheduler.
//!
//! Records reference images, audio, video and files by name. The
//! [`ResourceStore`] turns a reference into a path on disk; the
//! [`ResourceScheduler`] copies located files into `resources/<kind>s/`
//! with at most `concurrency` copies in flight. Copy failures are counted,
//! logged and otherwise ignored: a missing picture never fails an export.
//!
//! Copies of the same destination are serialized through a per-destination
//! lock that lives only while such a copy is queued or running. Each copy
//! writes a uniquely named part file and renames it into place, so a part
//! file never stands in for a finished destination.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use walkdir::WalkDir;

use crate::models::{ResourceKind, ResourceRef};

pub const MIN_CONCURRENCY: usize = 2;
pub const MAX_CONCURRENCY: usize = 8;

/// Resolves a resource reference to a readable file.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn locate(&self, resource: &ResourceRef) -> Option<PathBuf>;
}

struct FileIndex {
    built: Instant,
    by_name: HashMap<String, PathBuf>,
}

/// Looks resources up on the local filesystem.
///
/// An absolute `source_location` that exists wins. A relative one is tried
/// against each root in order. Failing both, the bare file name is looked
/// up in an index of every file under the roots. The index is built lazily
/// on a blocking thread and rebuilt once it is older than `ttl`.
pub struct DirResourceStore {
    roots: Vec<PathBuf>,
    ttl: Duration,
    index: Mutex<Option<FileIndex>>,
}

impl DirResourceStore {
    pub fn new(roots: Vec<PathBuf>, ttl: Duration) -> Self {
        Self {
            roots,
            ttl,
            index: Mutex::new(None),
        }
    }

    async fn lookup_name(&self, file_name: &str) -> Option<PathBuf> {
        if self.roots.is_empty() {
            return None;
        }
        let mut guard = self.index.lock().await;
        let stale = guard
            .as_ref()
            .map_or(true, |index| index.built.elapsed() >= self.ttl);
        if stale {
            let roots = self.roots.clone();
            match tokio::task::spawn_blocking(move || build_index(&roots)).await {
                Ok(by_name) => {
                    tracing::debug!(files = by_name.len(), "rebuilt resource index");
                    *guard = Some(FileIndex {
                        built: Instant::now(),
                        by_name,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "resource index build failed");
                    return None;
                }
            }
        }
        guard
            .as_ref()
            .and_then(|index| index.by_name.get(file_name).cloned())
    }
}

#[async_trait]
impl ResourceStore for DirResourceStore {
    async fn locate(&self, resource: &ResourceRef) -> Option<PathBuf> {
        let location = resource.source_location.trim();
        if !location.is_empty() {
            let direct = Path::new(location);
            if direct.is_absolute() {
                if is_file(direct).await {
                    return Some(direct.to_path_buf());
                }
            } else {
                for root in &self.roots {
                    let candidate = root.join(direct);
                    if is_file(&candidate).await {
                        return Some(candidate);
                    }
                }
            }
        }
        self.lookup_name(&resource.file_name).await
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// First file seen for each name wins; walks are sorted so that is stable.
fn build_index(roots: &[PathBuf]) -> HashMap<String, PathBuf> {
    let mut by_name = HashMap::new();
    for root in roots {
        let walker = WalkDir::new(root).sort_by_file_name().into_iter();
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                by_name
                    .entry(name.to_string())
                    .or_insert_with(|| entry.path().to_path_buf());
            }
        }
    }
    by_name
}

/// A pending copy into the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTask {
    pub kind: ResourceKind,
    pub destination_file_name: String,
    pub source_location: String,
}

impl From<ResourceRef> for ResourceTask {
    fn from(r: ResourceRef) -> Self {
        Self {
            kind: r.kind,
            destination_file_name: r.file_name,
            source_location: r.source_location,
        }
    }
}

impl ResourceTask {
    fn to_resource_ref(&self) -> ResourceRef {
        ResourceRef {
            kind: self.kind,
            file_name: self.destination_file_name.clone(),
            source_location: self.source_location.clone(),
        }
    }
}

/// Outcome of all copies of one export, as recorded in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStats {
    /// References found in records, copied or not.
    pub referenced: u64,
    pub scheduled: u64,
    pub copied: u64,
    pub skipped_existing: u64,
    pub faults: u64,
}

#[derive(Default)]
struct Counters {
    copied: AtomicU64,
    skipped_existing: AtomicU64,
    faults: AtomicU64,
}

type DestLock = Arc<Mutex<()>>;

/// Destinations with a copy queued or running.
#[derive(Default)]
struct InFlight(std::sync::Mutex<HashMap<PathBuf, DestLock>>);

impl InFlight {
    fn claim(&self, dest: &Path) -> DestLock {
        let mut map = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(dest.to_path_buf()).or_default())
    }

    /// Drop the entry once no other copy of `dest` holds it.
    fn release(&self, dest: &Path, lock: DestLock) {
        let mut map = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            map.remove(dest);
        }
    }
}

/// Configured concurrency, or available parallelism, clamped to
/// `[MIN_CONCURRENCY, MAX_CONCURRENCY]`.
pub fn effective_concurrency(configured: Option<usize>) -> usize {
    configured
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(MIN_CONCURRENCY)
        })
        .clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}

pub struct ResourceScheduler {
    store: Arc<dyn ResourceStore>,
    bundle_root: PathBuf,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
    counters: Arc<Counters>,
    in_flight: Arc<InFlight>,
    referenced: u64,
    scheduled: u64,
    concurrency: usize,
}

impl ResourceScheduler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        bundle_root: impl Into<PathBuf>,
        concurrency: Option<usize>,
    ) -> Self {
        let concurrency = effective_concurrency(concurrency);
        Self {
            store,
            bundle_root: bundle_root.into(),
            permits: Arc::new(Semaphore::new(concurrency)),
            tasks: JoinSet::new(),
            counters: Arc::new(Counters::default()),
            in_flight: Arc::new(InFlight::default()),
            referenced: 0,
            scheduled: 0,
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Copies currently spawned and not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Count a reference that will not be copied.
    pub fn note_reference(&mut self) {
        self.referenced += 1;
    }

    /// Wait for a free slot, then start copying `task` in the background.
    pub async fn schedule(&mut self, task: ResourceTask) {
        self.referenced += 1;
        self.reap();

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.counters.faults.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.reap();

        self.scheduled += 1;
        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.counters);
        let in_flight = Arc::clone(&self.in_flight);
        let dest = self.bundle_root.join(task.to_resource_ref().bundle_path());
        self.tasks.spawn(async move {
            let _permit = permit;
            let lock = in_flight.claim(&dest);
            {
                let _guard = lock.lock().await;
                copy_one(store.as_ref(), &dest, &task, &counters).await;
            }
            in_flight.release(&dest, lock);
        });
    }

    /// Wait for every scheduled copy and report the totals.
    pub async fn drain(&mut self) -> ResourceStats {
        while let Some(joined) = self.tasks.join_next().await {
            self.record_join(joined);
        }
        self.stats()
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            referenced: self.referenced,
            scheduled: self.scheduled,
            copied: self.counters.copied.load(Ordering::Relaxed),
            skipped_existing: self.counters.skipped_existing.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
        }
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.record_join(joined);
        }
    }

    fn record_join(&mut self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "resource copy task failed");
            self.counters.faults.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Copy one resource to `dest`. The caller holds the destination lock.
async fn copy_one(
    store: &dyn ResourceStore,
    dest: &Path,
    task: &ResourceTask,
    counters: &Counters,
) {
    if tokio::fs::try_exists(dest).await.unwrap_or(false) {
        counters.skipped_existing.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let Some(source) = store.locate(&task.to_resource_ref()).await else {
        tracing::warn!(
            file = %task.destination_file_name,
            location = %task.source_location,
            "resource not found"
        );
        counters.faults.fetch_add(1, Ordering::Relaxed);
        return;
    };

    match copy_into_place(&source, dest).await {
        Ok(()) => {
            counters.copied.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::warn!(
                source = %source.display(),
                dest = %dest.display(),
                error = %e,
                "resource copy failed"
            );
            counters.faults.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Suffix shared by every in-progress copy, `<name>.<uuid>.part`.
pub const PART_SUFFIX: &str = ".part";

fn part_path(dest: &Path) -> PathBuf {
    let mut part = dest.as_os_str().to_owned();
    part.push(format!(".{}{}", uuid::Uuid::new_v4().simple(), PART_SUFFIX));
    PathBuf::from(part)
}

/// Copy through a fresh part file, then rename it over `dest`.
async fn copy_into_place(source: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = part_path(dest);

    let copied = async {
        let mut out = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part)
            .await?;
        let mut input = tokio::fs::File::open(source).await?;
        tokio::io::copy(&mut input, &mut out).await?;
        out.flush().await?;
        out.shutdown().await?;
        drop(out);
        tokio::fs::rename(&part, dest).await
    }
    .await;

    if let Err(e) = copied {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e);
    }
    Ok(())
}

/// Remove part files left behind by an interrupted export.
pub async fn remove_stale_parts(resources_dir: &Path) -> std::io::Result<usize> {
    let dir = resources_dir.to_path_buf();
    let removed = tokio::task::spawn_blocking(move || {
        let mut removed = 0;
        for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            let is_part = entry.file_type().is_file()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(PART_SUFFIX));
            if is_part && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        removed
    })
    .await
    .map_err(std::io::Error::other)?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FixedStore(HashMap<String, PathBuf>);

    #[async_trait]
    impl ResourceStore for FixedStore {
        async fn locate(&self, resource: &ResourceRef) -> Option<PathBuf> {
            self.0.get(&resource.file_name).cloned()
        }
    }

    fn task(name: &str) -> ResourceTask {
        ResourceTask {
            kind: ResourceKind::Image,
            destination_file_name: name.to_string(),
            source_location: String::new(),
        }
    }

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(effective_concurrency(Some(1)), 2);
        assert_eq!(effective_concurrency(Some(64)), 8);
        assert_eq!(effective_concurrency(Some(5)), 5);
        let auto = effective_concurrency(None);
        assert!((MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&auto));
    }

    #[tokio::test]
    async fn copies_skips_and_counts_faults() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let a = src.path().join("a.jpg");
        std::fs::write(&a, b"jpeg bytes").unwrap();

        let existing = out.path().join("resources/images/b.jpg");
        std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
        std::fs::write(&existing, b"already here").unwrap();

        let mut known = HashMap::new();
        known.insert("a.jpg".to_string(), a.clone());
        known.insert("b.jpg".to_string(), a.clone());
        let store: Arc<dyn ResourceStore> = Arc::new(FixedStore(known));

        let mut scheduler = ResourceScheduler::new(store, out.path(), Some(2));
        scheduler.schedule(task("a.jpg")).await;
        scheduler.schedule(task("b.jpg")).await;
        scheduler.schedule(task("missing.png")).await;
        let stats = scheduler.drain().await;

        assert_eq!(stats.referenced, 3);
        assert_eq!(stats.scheduled, 3);
        assert_eq!(stats.copied, 1);
        assert_eq!(stats.skipped_existing, 1);
        assert_eq!(stats.faults, 1);
        assert_eq!(
            std::fs::read(out.path().join("resources/images/a.jpg")).unwrap(),
            b"jpeg bytes"
        );
        assert_eq!(std::fs::read(&existing).unwrap(), b"already here");
        assert!(!out.path().join("resources/images/a.jpg.part").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_copy_once() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let a = src.path().join("a.jpg");
        std::fs::write(&a, b"jpeg bytes").unwrap();
        let mut known = HashMap::new();
        known.insert("a.jpg".to_string(), a);
        let store: Arc<dyn ResourceStore> = Arc::new(FixedStore(known));

        let mut scheduler = ResourceScheduler::new(store, out.path(), Some(4));
        for _ in 0..4 {
            scheduler.schedule(task("a.jpg")).await;
            scheduler.schedule(task("gone.png")).await;
        }
        let stats = scheduler.drain().await;

        assert_eq!(stats.copied, 1);
        assert_eq!(stats.skipped_existing, 3);
        // Every reference to the missing file is a fault; none is skipped.
        assert_eq!(stats.faults, 4);
        assert!(scheduler.in_flight.0.lock().unwrap().is_empty());
        let names: Vec<_> = std::fs::read_dir(out.path().join("resources/images"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["a.jpg".to_string()]);
    }

    #[tokio::test]
    async fn leftover_part_file_does_not_count_as_copied() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let a = src.path().join("a.jpg");
        std::fs::write(&a, b"jpeg bytes").unwrap();
        let images = out.path().join("resources/images");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("a.jpg.part"), b"half").unwrap();

        let mut known = HashMap::new();
        known.insert("a.jpg".to_string(), a);
        let store: Arc<dyn ResourceStore> = Arc::new(FixedStore(known));
        let mut scheduler = ResourceScheduler::new(store, out.path(), Some(2));
        scheduler.schedule(task("a.jpg")).await;
        let stats = scheduler.drain().await;

        assert_eq!(stats.copied, 1);
        assert_eq!(stats.skipped_existing, 0);
        assert_eq!(std::fs::read(images.join("a.jpg")).unwrap(), b"jpeg bytes");

        let removed = remove_stale_parts(&out.path().join("resources")).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!images.join("a.jpg.part").exists());
        assert!(images.join("a.jpg").exists());
    }

    struct SlowStore {
        file: PathBuf,
        active: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ResourceStore for SlowStore {
        async fn locate(&self, _resource: &ResourceRef) -> Option<PathBuf> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Some(self.file.clone())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn copies_in_flight_never_exceed_cap() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let file = src.path().join("blob.bin");
        std::fs::write(&file, vec![0u8; 4096]).unwrap();
        let store = Arc::new(SlowStore {
            file,
            active: Default::default(),
            peak: Default::default(),
        });

        let mut scheduler = ResourceScheduler::new(store.clone(), out.path(), Some(3));
        for i in 0..20 {
            let mut t = task(&format!("{}.bin", i));
            t.kind = ResourceKind::File;
            scheduler.schedule(t).await;
        }
        let stats = scheduler.drain().await;

        assert_eq!(stats.copied, 20);
        assert!(store.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(scheduler.in_flight(), 0);
        assert!(out.path().join("resources/files/19.bin").is_file());
    }

    #[tokio::test]
    async fn dir_store_resolves_by_location_and_name() {
        let root = TempDir::new().unwrap();
        let nested = root.path().join("2024/03");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("cat.gif"), b"gif").unwrap();

        let store = DirResourceStore::new(vec![root.path().to_path_buf()], Duration::from_secs(300));

        let by_name = ResourceRef {
            kind: ResourceKind::Image,
            file_name: "cat.gif".to_string(),
            source_location: "/nonexistent/cat.gif".to_string(),
        };
        assert_eq!(store.locate(&by_name).await, Some(nested.join("cat.gif")));

        let relative = ResourceRef {
            source_location: "2024/03/cat.gif".to_string(),
            ..by_name.clone()
        };
        assert_eq!(store.locate(&relative).await, Some(nested.join("cat.gif")));

        let absent = ResourceRef {
            file_name: "dog.gif".to_string(),
            source_location: String::new(),
            ..by_name
        };
        assert_eq!(store.locate(&absent).await, None);
    }

    #[tokio::test]
    async fn dir_store_index_expires() {
        let root = TempDir::new().unwrap();
        let store = DirResourceStore::new(vec![root.path().to_path_buf()], Duration::ZERO);
        let r = ResourceRef {
            kind: ResourceKind::File,
            file_name: "late.txt".to_string(),
            source_location: String::new(),
        };
        assert_eq!(store.locate(&r).await, None);

        std::fs::write(root.path().join("late.txt"), b"x").unwrap();
        assert_eq!(store.locate(&r).await, Some(root.path().join("late.txt")));
    }
}
