// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The stream supervisor: spawns one recorder thread per enabled stream,
//! reconciles the catalog with the filesystem at startup, reacts to
//! configuration changes, and enforces retention.
//!
//! Workers are joined with a deadline at shutdown. A worker that misses the
//! deadline is detached rather than waited on forever: it owns all of its
//! resources and releases them on its own exit, so the cost is a leaked
//! thread until then, never a use-after-free.

use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use base::clock::Clocks;
use base::shutdown::{self, Coordinator};
use base::Error;
use jiff::tz::TimeZone;
use tracing::{debug, error, info, warn};

use crate::mp4;
use crate::recorder::{self, ExitReason, Recorder};
use crate::stream;

/// Upper bound on one pass of the supervisor loop, so a latched shutdown is
/// noticed promptly.
const EXIT_POLL: Duration = Duration::from_secs(1);

/// How often the supervisor polls the catalog for configuration changes.
const CONFIG_POLL: Duration = Duration::from_secs(10);

/// How often retention is enforced.
const RETENTION_INTERVAL: Duration = Duration::from_secs(60);

/// How long to wait for workers to quiesce before detaching them.
const JOIN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug)]
pub struct RetentionConfig {
    /// 0 = unlimited.
    pub max_storage_gb: u64,
    /// 0 = keep forever.
    pub retention_days: u32,
    pub auto_delete_oldest: bool,
}

/// What the startup sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Open rows sealed from mtime and on-disk size.
    pub sealed: usize,
    /// Open rows deleted because their file is gone.
    pub deleted: usize,
    /// Untracked on-disk files adopted into the catalog.
    pub adopted: usize,
}

fn mtime_secs(m: &std::fs::Metadata) -> i64 {
    m.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Parses the start time out of a `recording_YYYYMMDD_HHMMSS.mp4` filename
/// (local time, the format the recorder writes).
fn start_time_from_filename(name: &str) -> Option<i64> {
    let stamp = name
        .strip_prefix("recording_")?
        .strip_suffix(".mp4")?;
    let dt = jiff::civil::DateTime::strptime("%Y%m%d_%H%M%S", stamp).ok()?;
    Some(dt.to_zoned(TimeZone::system()).ok()?.timestamp().as_second())
}

/// Repairs catalog/filesystem divergence left by a crash:
///
/// * open rows whose file exists are sealed using mtime and size;
/// * open rows whose file is missing are deleted;
/// * untracked `recording_*.mp4` files under a configured stream's output
///   directory are adopted as complete rows (a `catalog_write_failed`
///   segment leaves exactly this residue).
///
/// Applied to a clean state, this is a no-op.
pub fn startup_sweep(db: &db::Database) -> Result<SweepStats, Error> {
    let mut stats = SweepStats::default();
    for rec in db.list_open_recordings()? {
        match std::fs::metadata(&rec.file_path) {
            Ok(m) => {
                let end = mtime_secs(&m).max(rec.start_time + 1);
                let size = i64::try_from(m.len()).unwrap_or(i64::MAX);
                info!(
                    "sweep: sealing orphan recording {} ({:?})",
                    rec.id, rec.file_path
                );
                db.update_recording(rec.id, end, size, true)?;
                stats.sealed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "sweep: deleting row {} for missing file {:?}",
                    rec.id, rec.file_path
                );
                db.delete_recording(rec.id)?;
                stats.deleted += 1;
            }
            Err(e) => {
                warn!(
                    "sweep: can't stat {:?}; sealing row {} with size 0: {e}",
                    rec.file_path, rec.id
                );
                db.update_recording(rec.id, rec.start_time + 1, 0, true)?;
                stats.sealed += 1;
            }
        }
    }

    for config in db.list_stream_configs()? {
        let entries = match std::fs::read_dir(&config.output_dir) {
            Ok(e) => e,
            Err(_) => continue, // nothing recorded there yet
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(start) = start_time_from_filename(name) else {
                continue;
            };
            if db.contains_file_path(&path)? {
                continue;
            }
            let Ok(m) = entry.metadata() else { continue };
            let end = mtime_secs(&m).max(start + 1);
            let size = i64::try_from(m.len()).unwrap_or(i64::MAX);
            info!("sweep: adopting untracked file {path:?}");
            db.insert_complete_recording(&config.name, &path, start, end, size)?;
            stats.adopted += 1;
        }
    }
    Ok(stats)
}

struct Worker {
    handle: thread::JoinHandle<()>,
}

/// Spawns, watches, and reaps stream recorders.
pub struct Supervisor<C: Clocks + Clone> {
    clocks: C,
    db: Arc<db::Database>,
    opener: Arc<dyn stream::Opener>,
    coordinator: Coordinator,
    retention: RetentionConfig,
    mux: mp4::MuxOptions,

    /// Entered by each worker thread so the RTSP layer can reach the tokio
    /// runtime; absent under tests that never touch the network.
    rt_handle: Option<tokio::runtime::Handle>,

    workers: HashMap<String, Worker>,
}

impl<C: Clocks + Clone> Supervisor<C> {
    pub fn new(
        clocks: C,
        db: Arc<db::Database>,
        opener: Arc<dyn stream::Opener>,
        coordinator: Coordinator,
        retention: RetentionConfig,
        mux: mp4::MuxOptions,
    ) -> Self {
        Supervisor {
            clocks,
            db,
            opener,
            coordinator,
            retention,
            mux,
            rt_handle: tokio::runtime::Handle::try_current().ok(),
            workers: HashMap::new(),
        }
    }

    /// Runs until shutdown: the supervisor's thread is the process's
    /// recording lifetime.
    pub fn run(&mut self) {
        let registration = self.coordinator.register(
            "supervisor",
            shutdown::ComponentKind::Supervisor,
            shutdown::SUPERVISOR_PRIORITY,
        );
        registration.update_state(shutdown::ComponentState::Running);

        match startup_sweep(&self.db) {
            Ok(stats) if stats != SweepStats::default() => {
                info!(
                    "startup sweep: sealed {}, deleted {}, adopted {}",
                    stats.sealed, stats.deleted, stats.adopted
                );
            }
            Ok(_) => debug!("startup sweep: catalog and filesystem agree"),
            Err(e) => error!("startup sweep failed: {}", e.chain()),
        }

        let (exit_tx, exit_rx) = mpsc::channel::<(String, ExitReason)>();
        self.reconcile(&exit_tx);
        let mut last_reconcile = self.clocks.monotonic();
        let mut last_retention = self.clocks.monotonic();
        self.enforce_retention();

        let shutdown_rx = self.coordinator.receiver();
        while shutdown_rx.check().is_ok() {
            match self.clocks.recv_timeout(&exit_rx, EXIT_POLL) {
                Ok((name, reason)) => self.reap(name, reason, &exit_tx),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.reap_finished();
                    let now = self.clocks.monotonic();
                    if now.saturating_sub(last_reconcile) >= CONFIG_POLL {
                        self.reconcile(&exit_tx);
                        last_reconcile = now;
                    }
                    if now.saturating_sub(last_retention) >= RETENTION_INTERVAL {
                        self.enforce_retention();
                        last_retention = now;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        registration.update_state(shutdown::ComponentState::Stopping);
        info!("waiting up to {JOIN_DEADLINE:?} for recorders to quiesce");
        // This supervisor's own registration is still live; wait only on the
        // other components.
        let laggards = match self.coordinator.wait_for_quiescence_except(
            JOIN_DEADLINE,
            "supervisor",
        ) {
            Ok(()) => Vec::new(),
            Err(l) => l,
        };
        for (name, worker) in self.workers.drain() {
            if worker.handle.is_finished() {
                if let Err(e) = worker.handle.join() {
                    error!("recorder {name} panicked: {e:?}");
                }
            } else {
                // Deliberate detach: see module comment.
                warn!("recorder {name} missed the join deadline; detaching");
            }
        }
        if !laggards.is_empty() {
            warn!("components still running at exit: {laggards:?}");
        }
        info!("supervisor exiting");
    }

    fn reap(&mut self, name: String, reason: ExitReason, exit_tx: &mpsc::Sender<(String, ExitReason)>) {
        if let Some(w) = self.workers.remove(&name) {
            if let Err(e) = w.handle.join() {
                error!("recorder {name} panicked: {e:?}");
            }
        }
        debug!("recorder {name} exited: {reason:?}");
        if reason == ExitReason::RestartRequired && self.coordinator.receiver().check().is_ok() {
            match self.db.get_stream_config(&name) {
                Ok(Some(config)) if config.enabled => self.spawn(&config, exit_tx),
                _ => {}
            }
        }
    }

    /// Joins workers that died without sending an exit message (panics).
    fn reap_finished(&mut self) {
        let finished: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, w)| w.handle.is_finished())
            .map(|(n, _)| n.clone())
            .collect();
        for name in finished {
            if let Some(w) = self.workers.remove(&name) {
                if let Err(e) = w.handle.join() {
                    error!("recorder {name} panicked: {e:?}");
                }
            }
        }
    }

    /// Starts recorders for enabled streams that don't have one.
    fn reconcile(&mut self, exit_tx: &mpsc::Sender<(String, ExitReason)>) {
        let configs = match self.db.list_stream_configs() {
            Ok(c) => c,
            Err(e) => {
                warn!("can't list streams: {}", e.chain());
                return;
            }
        };
        for config in configs {
            if config.enabled && !self.workers.contains_key(&config.name) {
                self.spawn(&config, exit_tx);
            }
        }
    }

    fn spawn(&mut self, config: &db::StreamConfig, exit_tx: &mpsc::Sender<(String, ExitReason)>) {
        let registration = self.coordinator.register(
            &format!("s-{}", config.name),
            shutdown::ComponentKind::Recorder,
            shutdown::RECORDER_PRIORITY,
        );
        let shutdown_rx = self.coordinator.receiver();
        let env = recorder::Environment {
            clocks: &self.clocks,
            opener: self.opener.clone(),
            db: &self.db,
            shutdown_rx: &shutdown_rx,
            mux: self.mux,
        };
        let mut recorder = match Recorder::new(&env, config, Some(registration)) {
            Ok(r) => r,
            Err(e) => {
                error!(
                    "can't start recorder for {:?}: {}",
                    config.name,
                    e.chain()
                );
                return;
            }
        };
        info!("starting recorder for {}", config.name);
        let name = config.name.clone();
        let thread_name = format!("s-{}", config.name);
        let tx = exit_tx.clone();
        let rt_handle = self.rt_handle.clone();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let _enter = rt_handle.as_ref().map(|h| h.enter());
                let reason = recorder.run();
                let _ = tx.send((recorder.stream_name().to_owned(), reason));
            })
            .expect("can't create thread");
        self.workers.insert(name, Worker { handle });
    }

    /// Deletes expired and over-budget recordings. The file is removed and
    /// its catalog row deleted in the same logical operation; a file already
    /// gone is not an error.
    fn enforce_retention(&self) {
        let now = self.clocks.realtime().as_second();
        if self.retention.retention_days > 0 {
            let cutoff = now - i64::from(self.retention.retention_days) * 86_400;
            match self.db.list_recordings_ending_before(cutoff) {
                Ok(expired) => {
                    for rec in expired {
                        self.delete_recording_and_file(&rec);
                    }
                }
                Err(e) => warn!("retention query failed: {}", e.chain()),
            }
        }
        if self.retention.max_storage_gb > 0 && self.retention.auto_delete_oldest {
            let limit = i64::try_from(self.retention.max_storage_gb << 30).unwrap_or(i64::MAX);
            loop {
                match self.db.total_recorded_bytes() {
                    Ok(total) if total > limit => {}
                    Ok(_) => break,
                    Err(e) => {
                        warn!("retention size query failed: {}", e.chain());
                        break;
                    }
                }
                match self.db.oldest_complete_recording() {
                    Ok(Some(rec)) => {
                        info!(
                            "over storage budget; deleting oldest recording {} ({:?})",
                            rec.id, rec.file_path
                        );
                        if !self.delete_recording_and_file(&rec) {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("retention query failed: {}", e.chain());
                        break;
                    }
                }
            }
        }
    }

    fn delete_recording_and_file(&self, rec: &db::Recording) -> bool {
        if let Err(e) = std::fs::remove_file(&rec.file_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("can't delete {:?}: {e}", rec.file_path);
                return false;
            }
        }
        match self.db.delete_recording(rec.id) {
            Ok(()) => true,
            Err(e) => {
                warn!("can't delete catalog row {}: {}", rec.id, e.chain());
                false
            }
        }
    }
}

/// Whether a path looks like a recording this program wrote.
#[cfg(test)]
fn is_recording_filename(path: &std::path::Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(start_time_from_filename)
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::ScriptedStream;
    use base::clock::SimulatedClocks;
    use base::Mutex;
    use db::testutil::TestDb;
    use std::collections::VecDeque;
    use std::path::Path;

    fn write_file(path: &Path, len: usize) {
        std::fs::write(path, vec![0u8; len]).unwrap();
    }

    #[test]
    fn filename_round_trip() {
        db::testutil::init();
        let start = start_time_from_filename("recording_20240601_120000.mp4").unwrap();
        // Local-time parse; just check it's a plausible 2024 timestamp.
        let lo: jiff::Timestamp = "2024-05-31T00:00:00Z".parse().unwrap();
        let hi: jiff::Timestamp = "2024-06-02T23:59:59Z".parse().unwrap();
        assert!(start >= lo.as_second() && start <= hi.as_second());

        assert!(start_time_from_filename("recording_2024_1200.mp4").is_none());
        assert!(start_time_from_filename("notes.txt").is_none());
        assert!(is_recording_filename(Path::new(
            "/tmp/recording_20240601_120000.mp4"
        )));
    }

    #[test]
    fn sweep_seals_deletes_and_adopts() {
        let tdb = TestDb::new();
        let config = tdb.add_test_stream("back");

        // Open row with a file on disk: sealed with mtime/size.
        let kept = config.output_dir.join("recording_20240601_120000.mp4");
        write_file(&kept, 1234);
        let kept_id = tdb.db.begin_recording("back", &kept, 100).unwrap();

        // Open row without a file: deleted.
        let gone = config.output_dir.join("recording_20240601_120100.mp4");
        let gone_id = tdb.db.begin_recording("back", &gone, 160).unwrap();

        // Untracked file: adopted.
        let untracked = config.output_dir.join("recording_20240601_120200.mp4");
        write_file(&untracked, 777);

        // Unrelated file: ignored.
        write_file(&config.output_dir.join("notes.txt"), 3);

        let stats = startup_sweep(&tdb.db).unwrap();
        assert_eq!(
            stats,
            SweepStats {
                sealed: 1,
                deleted: 1,
                adopted: 1
            }
        );

        let kept_row = tdb.db.get_recording(kept_id).unwrap();
        assert!(kept_row.is_complete);
        assert_eq!(kept_row.size_bytes, 1234);
        assert!(kept_row.end_time >= kept_row.start_time);

        tdb.db.get_recording(gone_id).unwrap_err();

        let rows = tdb.db.list_recordings("back").unwrap();
        assert_eq!(rows.len(), 2);
        let adopted = rows.iter().find(|r| r.file_path == untracked).unwrap();
        assert!(adopted.is_complete);
        assert_eq!(adopted.size_bytes, 777);
        assert!(adopted.end_time >= adopted.start_time);

        // Applied to the now-clean state, the sweep is a no-op.
        assert_eq!(startup_sweep(&tdb.db).unwrap(), SweepStats::default());
    }

    struct DryOpener {
        coordinator: Coordinator,
        streams: Mutex<VecDeque<ScriptedStream>>,
    }

    impl stream::Opener for DryOpener {
        fn open(
            &self,
            _label: &str,
            _url: &url::Url,
            _options: stream::Options,
        ) -> Result<Box<dyn stream::Stream>, stream::OpenError> {
            match self.streams.lock().pop_front() {
                Some(s) => Ok(Box::new(s)),
                None => {
                    self.coordinator.initiate_shutdown();
                    Err(stream::OpenError::Connect(base::err!(
                        Unavailable,
                        msg("out of streams")
                    )))
                }
            }
        }
    }

    fn supervisor_with(
        tdb: &TestDb,
        clocks: &SimulatedClocks,
        coordinator: &Coordinator,
        opener: Arc<dyn stream::Opener>,
        retention: RetentionConfig,
    ) -> Supervisor<SimulatedClocks> {
        Supervisor::new(
            clocks.clone(),
            tdb.db.clone(),
            opener,
            coordinator.clone(),
            retention,
            mp4::MuxOptions::default(),
        )
    }

    #[test]
    fn supervises_one_stream_to_shutdown() {
        db::testutil::init();
        let tdb = TestDb::new();
        tdb.add_test_stream("back");
        let clocks = SimulatedClocks::new("2024-06-01T12:00:00Z".parse().unwrap());
        let coordinator = Coordinator::new();

        let mut s = ScriptedStream::new(clocks.clone(), false);
        s.push_video(0.0, true);
        s.push_video(0.5, false);
        s.push_video(1.0, false);
        let opener = Arc::new(DryOpener {
            coordinator: coordinator.clone(),
            streams: Mutex::new(VecDeque::from([s])),
        });

        let mut sup = supervisor_with(
            &tdb,
            &clocks,
            &coordinator,
            opener,
            RetentionConfig {
                max_storage_gb: 0,
                retention_days: 0,
                auto_delete_oldest: true,
            },
        );
        sup.run();

        // The worker recorded one short segment, sealed its row at exit, and
        // quiesced; nothing is left open or running.
        let rows = tdb.db.list_recordings("back").unwrap();
        assert_eq!(rows.len(), 1, "rows: {rows:?}");
        assert!(rows[0].is_complete);
        assert!(rows[0].file_path.exists());
        coordinator
            .wait_for_quiescence(Duration::from_secs(1))
            .unwrap();
    }

    /// Opener for multi-stream tests: scripted sessions per URL, shutdown
    /// latched once every queue is dry.
    struct MultiOpener {
        coordinator: Coordinator,
        streams: Mutex<std::collections::HashMap<String, VecDeque<ScriptedStream>>>,
    }

    impl stream::Opener for MultiOpener {
        fn open(
            &self,
            _label: &str,
            url: &url::Url,
            _options: stream::Options,
        ) -> Result<Box<dyn stream::Stream>, stream::OpenError> {
            let mut l = self.streams.lock();
            let next = l.get_mut(url.as_str()).and_then(VecDeque::pop_front);
            if l.values().all(VecDeque::is_empty) {
                self.coordinator.initiate_shutdown();
            }
            drop(l);
            match next {
                Some(s) => Ok(Box::new(s)),
                None => Err(stream::OpenError::Connect(base::err!(
                    Unavailable,
                    msg("out of streams for {url}")
                ))),
            }
        }
    }

    #[test]
    fn two_streams_record_independently() {
        db::testutil::init();
        let tdb = TestDb::new();
        let front = tdb.add_test_stream("front"); // records audio
        let mut back = tdb.add_test_stream("back");
        back.record_audio = false;
        tdb.db.upsert_stream(&back).unwrap();

        let clocks = SimulatedClocks::new("2024-06-01T12:00:00Z".parse().unwrap());
        let coordinator = Coordinator::new();

        let mut front_s = ScriptedStream::new(clocks.clone(), true);
        front_s.push_video(0.0, true);
        front_s.push_audio(0.1);
        front_s.push_video(0.5, false);
        let mut back_s = ScriptedStream::new(clocks.clone(), true);
        back_s.push_video(0.0, true);
        back_s.push_audio(0.1);
        back_s.push_video(0.5, false);

        let opener = Arc::new(MultiOpener {
            coordinator: coordinator.clone(),
            streams: Mutex::new(
                [
                    (front.url.clone(), VecDeque::from([front_s])),
                    (back.url.clone(), VecDeque::from([back_s])),
                ]
                .into_iter()
                .collect(),
            ),
        });
        let mut sup = supervisor_with(
            &tdb,
            &clocks,
            &coordinator,
            opener,
            RetentionConfig {
                max_storage_gb: 0,
                retention_days: 0,
                auto_delete_oldest: true,
            },
        );
        sup.run();

        // One sealed recording per stream, in that stream's own directory,
        // with the audio track only where configured.
        for (name, wants_audio) in [("front", true), ("back", false)] {
            let rows = tdb.db.list_recordings(name).unwrap();
            assert_eq!(rows.len(), 1, "{name}: {rows:?}");
            assert!(rows[0].is_complete);
            assert!(rows[0].file_path.starts_with(tdb.tmpdir.path().join(name)));
            let buf = std::fs::read(&rows[0].file_path).unwrap();
            let moov = crate::mp4::testutil::child(&buf, 0..buf.len(), "moov");
            let expected: &[&str] = if wants_audio {
                &["mvhd", "trak", "trak", "mvex"]
            } else {
                &["mvhd", "trak", "mvex"]
            };
            assert_eq!(crate::mp4::testutil::names(&buf, moov), expected, "{name}");
        }
    }

    #[test]
    fn retention_deletes_oldest_over_budget() {
        db::testutil::init();
        let tdb = TestDb::new();
        let config = tdb.add_test_stream("back");
        let clocks = SimulatedClocks::new("2024-06-01T12:00:00Z".parse().unwrap());
        let coordinator = Coordinator::new();

        // Three sealed 1 GiB recordings (sizes faked in the catalog; files
        // small on disk).
        let gib = 1i64 << 30;
        let mut paths = Vec::new();
        for (i, start) in [(0, 100), (1, 200), (2, 300)] {
            let path = config.output_dir.join(format!("recording_2024060{}_000000.mp4", i + 1));
            write_file(&path, 10);
            tdb.db
                .insert_complete_recording("back", &path, start, start + 30, gib)
                .unwrap();
            paths.push(path);
        }

        let opener = Arc::new(DryOpener {
            coordinator: coordinator.clone(),
            streams: Mutex::new(VecDeque::new()),
        });
        let sup = supervisor_with(
            &tdb,
            &clocks,
            &coordinator,
            opener,
            RetentionConfig {
                max_storage_gb: 2,
                retention_days: 0,
                auto_delete_oldest: true,
            },
        );
        sup.enforce_retention();

        // The oldest recording went; the other two fit in the 2 GiB budget.
        let rows = tdb.db.list_recordings("back").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!paths[0].exists());
        assert!(paths[1].exists() && paths[2].exists());
        assert_eq!(tdb.db.total_recorded_bytes().unwrap(), 2 * gib);
    }

    #[test]
    fn retention_expires_by_age() {
        db::testutil::init();
        let tdb = TestDb::new();
        let config = tdb.add_test_stream("back");
        // Clock sits at epoch + 10 days.
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        clocks.sleep(Duration::from_secs(10 * 86_400));
        let coordinator = Coordinator::new();

        let old = config.output_dir.join("recording_19700101_000100.mp4");
        write_file(&old, 10);
        tdb.db
            .insert_complete_recording("back", &old, 60, 90, 10)
            .unwrap();
        let fresh = config.output_dir.join("recording_19700109_000000.mp4");
        write_file(&fresh, 10);
        let fresh_start = 8 * 86_400;
        tdb.db
            .insert_complete_recording("back", &fresh, fresh_start, fresh_start + 30, 10)
            .unwrap();

        let opener = Arc::new(DryOpener {
            coordinator: coordinator.clone(),
            streams: Mutex::new(VecDeque::new()),
        });
        let sup = supervisor_with(
            &tdb,
            &clocks,
            &coordinator,
            opener,
            RetentionConfig {
                max_storage_gb: 0,
                retention_days: 7,
                auto_delete_oldest: false,
            },
        );
        sup.enforce_retention();

        let rows = tdb.db.list_recordings("back").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].file_path, fresh);
        assert!(!old.exists());

        // Already-deleted files don't block row deletion.
        let orphan_row = config.output_dir.join("recording_19700101_000200.mp4");
        tdb.db
            .insert_complete_recording("back", &orphan_row, 120, 150, 10)
            .unwrap();
        sup.enforce_retention();
        assert_eq!(tdb.db.list_recordings("back").unwrap().len(), 1);
    }
}
