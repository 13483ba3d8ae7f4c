//! Incremental state cache feeding the directory browser
//!
//! Classification over NFS is slow, so results are cached per path keyed on
//! the Work file's modification time, populated lazily by a bounded worker
//! pool, and invalidated by a watcher that polls Work's status for external
//! edits. A partial refresh serves from the cache and keeps the UI
//! responsive; a full refresh drops everything and reclassifies
//! synchronously after operations that touch many files at once.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::classify::{Classifier, FileState};
use crate::logging::{debug, warn};
use crate::vcs::Vcs;

/// Entries older than this are invalid regardless of mtime
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Bounded pool size caps concurrent I/O on NFS
pub const DEFAULT_WORKERS: usize = 2;

/// Watcher polling interval
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct CacheEntry {
	state: FileState,
	mtime: Option<SystemTime>,
	captured_at: Instant,
}

/// Concurrent-safe map of classification results
pub struct StateCache {
	ttl: Duration,
	map: Mutex<HashMap<String, CacheEntry>>,
}

impl StateCache {
	pub fn new(ttl: Duration) -> Self {
		StateCache { ttl, map: Mutex::new(HashMap::new()) }
	}

	/// HIT iff an entry exists, is younger than the TTL, and the stored
	/// mtime equals the caller-provided current mtime.
	pub fn lookup(&self, rel_path: &str, current_mtime: Option<SystemTime>) -> Option<FileState> {
		let map = self.map.lock().ok()?;
		let entry = map.get(rel_path)?;
		if entry.captured_at.elapsed() >= self.ttl {
			return None;
		}
		if entry.mtime != current_mtime {
			return None;
		}
		Some(entry.state)
	}

	/// Record a classification together with the file mtime it was taken at
	pub fn insert(&self, rel_path: &str, state: FileState, mtime: Option<SystemTime>) {
		if let Ok(mut map) = self.map.lock() {
			map.insert(
				rel_path.to_string(),
				CacheEntry { state, mtime, captured_at: Instant::now() },
			);
		}
	}

	pub fn invalidate(&self, rel_path: &str) {
		if let Ok(mut map) = self.map.lock() {
			map.remove(rel_path);
		}
	}

	pub fn invalidate_many<'a>(&self, paths: impl IntoIterator<Item = &'a str>) {
		if let Ok(mut map) = self.map.lock() {
			for path in paths {
				map.remove(path);
			}
		}
	}

	pub fn clear(&self) {
		if let Ok(mut map) = self.map.lock() {
			map.clear();
		}
	}

	pub fn len(&self) -> usize {
		self.map.lock().map(|m| m.len()).unwrap_or(0)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Default for StateCache {
	fn default() -> Self {
		StateCache::new(DEFAULT_CACHE_TTL)
	}
}

type Job = (String, PathBuf);

/// Bounded pool of classification workers
///
/// Submissions are non-blocking; results land in the cache and on the
/// pending map the UI drains on each redraw tick. After shutdown further
/// submissions are refused; in-flight classifications run to completion.
pub struct WorkerPool {
	tx: Option<mpsc::UnboundedSender<Job>>,
	workers: Vec<JoinHandle<()>>,
	shutdown: Arc<AtomicBool>,
	pending: Arc<Mutex<HashMap<String, FileState>>>,
}

impl WorkerPool {
	pub fn new(classifier: Arc<Classifier>, cache: Arc<StateCache>, workers: usize) -> Self {
		let (tx, rx) = mpsc::unbounded_channel::<Job>();
		let rx = Arc::new(tokio::sync::Mutex::new(rx));
		let shutdown = Arc::new(AtomicBool::new(false));
		let pending = Arc::new(Mutex::new(HashMap::new()));

		let handles = (0..workers.max(1))
			.map(|worker_id| {
				let rx = rx.clone();
				let shutdown = shutdown.clone();
				let pending = pending.clone();
				let classifier = classifier.clone();
				let cache = cache.clone();
				tokio::spawn(async move {
					loop {
						let job = {
							let mut rx = rx.lock().await;
							rx.recv().await
						};
						let Some((rel_path, full_path)) = job else {
							break;
						};
						if shutdown.load(Ordering::SeqCst) {
							break;
						}

						let mtime = std::fs::metadata(&full_path)
							.and_then(|m| m.modified())
							.ok();
						let state = classifier.state_of(&rel_path).await;
						cache.insert(&rel_path, state, mtime);
						if let Ok(mut pending) = pending.lock() {
							pending.insert(rel_path, state);
						}
					}
					debug!("classification worker {} stopped", worker_id);
				})
			})
			.collect();

		WorkerPool { tx: Some(tx), workers: handles, shutdown, pending }
	}

	/// Enqueue a classification; returns false once the pool is shut down
	pub fn submit(&self, rel_path: &str, full_path: PathBuf) -> bool {
		if self.shutdown.load(Ordering::SeqCst) {
			return false;
		}
		match &self.tx {
			Some(tx) => tx.send((rel_path.to_string(), full_path)).is_ok(),
			None => false,
		}
	}

	/// Results produced since the last drain, for the UI redraw tick
	pub fn drain_pending(&self) -> HashMap<String, FileState> {
		match self.pending.lock() {
			Ok(mut pending) => std::mem::take(&mut *pending),
			Err(_) => HashMap::new(),
		}
	}

	/// Refuse new work, then wait briefly for workers to finish in-flight
	/// classifications. Never blocks indefinitely.
	pub async fn shutdown(&mut self) {
		self.shutdown.store(true, Ordering::SeqCst);
		self.tx.take();
		let handles: Vec<JoinHandle<()>> = self.workers.drain(..).collect();
		let joined =
			tokio::time::timeout(Duration::from_secs(2), futures::future::join_all(handles)).await;
		if joined.is_err() {
			warn!("classification workers did not stop in time");
		}
	}
}

/// Background poller that watches Work's status for external edits
///
/// Keeps the previous status snapshot; on transition it invalidates exactly
/// the changed cache entries within the directory the UI is displaying and
/// raises the redraw flag. Navigating to another directory resets the
/// snapshot so the first comparison there emits no spurious events.
pub struct StatusWatcher {
	shared: Arc<WatcherShared>,
	handle: Option<JoinHandle<()>>,
}

struct WatcherShared {
	current_dir: Mutex<String>,
	reset: AtomicBool,
	stop: AtomicBool,
	redraw: AtomicBool,
}

impl StatusWatcher {
	pub fn start(
		vcs: Arc<dyn Vcs>,
		work_dir: PathBuf,
		cache: Arc<StateCache>,
		interval: Duration,
	) -> Self {
		let shared = Arc::new(WatcherShared {
			current_dir: Mutex::new(String::new()),
			reset: AtomicBool::new(false),
			stop: AtomicBool::new(false),
			redraw: AtomicBool::new(false),
		});

		let task_shared = shared.clone();
		let handle = tokio::spawn(async move {
			let mut snapshot: Option<HashSet<(String, String)>> = None;
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

			loop {
				ticker.tick().await;
				if task_shared.stop.load(Ordering::SeqCst) {
					break;
				}
				if task_shared.reset.swap(false, Ordering::SeqCst) {
					snapshot = None;
				}

				let entries = match vcs.status_short(&work_dir).await {
					Ok(entries) => entries,
					Err(e) => {
						debug!("watcher status poll failed: {}", e);
						continue;
					}
				};
				let now: HashSet<(String, String)> =
					entries.into_iter().map(|e| (e.code, e.path)).collect();

				if let Some(prev) = &snapshot {
					let added: Vec<&(String, String)> = now.difference(prev).collect();
					let removed: Vec<&(String, String)> = prev.difference(&now).collect();
					if !added.is_empty() || !removed.is_empty() {
						let dir = task_shared
							.current_dir
							.lock()
							.map(|d| d.clone())
							.unwrap_or_default();
						let in_view = |path: &str| {
							dir.is_empty() || path.starts_with(&format!("{}/", dir))
						};
						let changed: Vec<String> = added
							.iter()
							.chain(removed.iter())
							.map(|(_, path)| path.clone())
							.filter(|path| in_view(path))
							.collect();
						if !changed.is_empty() {
							debug!("watcher invalidating {} entries", changed.len());
							cache.invalidate_many(changed.iter().map(|s| s.as_str()));
							task_shared.redraw.store(true, Ordering::SeqCst);
						}
					}
				}
				snapshot = Some(now);
			}
			debug!("status watcher stopped");
		});

		StatusWatcher { shared, handle: Some(handle) }
	}

	/// Tell the watcher which directory the UI is displaying; the snapshot
	/// is reset so no stale diff fires against the new view.
	pub fn set_current_dir(&self, rel_dir: &str) {
		if let Ok(mut dir) = self.shared.current_dir.lock() {
			*dir = rel_dir.trim_matches('/').to_string();
		}
		self.shared.reset.store(true, Ordering::SeqCst);
	}

	/// True once since the last call when a redraw is needed
	pub fn take_redraw(&self) -> bool {
		self.shared.redraw.swap(false, Ordering::SeqCst)
	}

	pub async fn stop(&mut self) {
		self.shared.stop.store(true, Ordering::SeqCst);
		if let Some(handle) = self.handle.take() {
			// Interval ticks are short; give the task one cycle to notice
			if tokio::time::timeout(Duration::from_secs(6), handle).await.is_err() {
				warn!("status watcher did not stop in time");
			}
		}
	}
}

/// Facade tying cache, worker pool and watcher together for the browser
pub struct StatusService {
	cache: Arc<StateCache>,
	classifier: Arc<Classifier>,
	pool: WorkerPool,
	watcher: StatusWatcher,
	work_dir: PathBuf,
}

impl StatusService {
	pub fn start(
		classifier: Arc<Classifier>,
		vcs: Arc<dyn Vcs>,
		work_dir: PathBuf,
		workers: usize,
		ttl: Duration,
		watch_interval: Duration,
	) -> Self {
		let cache = Arc::new(StateCache::new(ttl));
		let pool = WorkerPool::new(classifier.clone(), cache.clone(), workers);
		let watcher = StatusWatcher::start(vcs, work_dir.clone(), cache.clone(), watch_interval);
		StatusService { cache, classifier, pool, watcher, work_dir }
	}

	pub fn cache(&self) -> &Arc<StateCache> {
		&self.cache
	}

	/// Partial-refresh lookup: serve from cache or enqueue classification
	/// and report `Pending`.
	pub fn state_of(&self, rel_path: &str) -> FileState {
		let full_path = self.work_dir.join(rel_path);
		let mtime = std::fs::metadata(&full_path).and_then(|m| m.modified()).ok();
		if let Some(state) = self.cache.lookup(rel_path, mtime) {
			return state;
		}
		self.pool.submit(rel_path, full_path);
		FileState::Pending
	}

	/// Completed classifications since the last redraw tick
	pub fn drain_pending(&self) -> HashMap<String, FileState> {
		self.pool.drain_pending()
	}

	pub fn set_current_dir(&self, rel_dir: &str) {
		self.watcher.set_current_dir(rel_dir);
	}

	pub fn needs_redraw(&self) -> bool {
		self.watcher.take_redraw()
	}

	/// Full refresh: drop the cache and synchronously reclassify the given
	/// view. Used after Download/Upload/Save/Rollback.
	pub async fn full_refresh(
		&self,
		files: &[(PathBuf, String)],
	) -> HashMap<String, FileState> {
		self.cache.clear();
		let mut states = HashMap::new();
		for (_, rel_path) in files {
			let full_path = self.work_dir.join(rel_path);
			let mtime = std::fs::metadata(&full_path).and_then(|m| m.modified()).ok();
			let state = self.classifier.state_of(rel_path).await;
			self.cache.insert(rel_path, state, mtime);
			states.insert(rel_path.clone(), state);
		}
		states
	}

	/// Teardown, in order: stop the watcher, stop the workers (waiting
	/// briefly for in-flight classifications), clear the cache.
	pub async fn cleanup(mut self) {
		self.watcher.stop().await;
		self.pool.shutdown().await;
		self.cache.clear();
	}
}


// vim: ts=4
