//! Batch scheduling.
//!
//! Subjects are dispatched in discovery order onto a fixed pool of
//! `max_processes` workers. GPU-bound stages additionally take a slot from
//! [`GpuSlots`], so the number of tasks using a device never exceeds
//! `max_gpus * max_processes_per_gpu`. Results are logged as they finish
//! and returned in dispatch order.
//!
//! A batch is interrupted by setting the cancel flag or by creating a
//! `STOP` file in the run directory. Running subjects finish; subjects that
//! have not started are reported as cancelled. Both triggers are cleared
//! when a run begins.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::unbounded;
use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::domain::{BatchRun, DeviceMode, PipelineConfig, Subject, SubjectOutcome, SubjectResult};
use crate::error::AppError;
use crate::schedule::{GpuSlots, cache};
use crate::task::run_subject;

pub const STOP_FILE: &str = "STOP";

#[derive(Debug)]
pub struct Scheduler {
    backend: Backend,
    cancel: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag; storing `true` stops dispatch of further subjects.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run every subject of `batch`. Per-subject failures are part of the
    /// returned results; `Err` means the batch itself could not run.
    pub fn run(&self, batch: &BatchRun) -> Result<Vec<SubjectResult>, AppError> {
        let run_dir = batch.run_dir();
        fs::create_dir_all(&run_dir)
            .map_err(|e| AppError::runtime(format!("Failed to create '{}': {e}", run_dir.display())))?;
        let stop = run_dir.join(STOP_FILE);
        if stop.exists() {
            info!("removing stale stop file '{}'", stop.display());
            let _ = fs::remove_file(&stop);
        }
        self.cancel.store(false, Ordering::SeqCst);

        let workers = batch.limits.workers();
        let gpu = match batch.config.device {
            DeviceMode::Gpu => Some(GpuSlots::new(
                batch.limits.max_gpus,
                batch.limits.max_processes_per_gpu,
            )),
            DeviceMode::Cpu => None,
        };
        info!(
            subjects = batch.subjects.len(),
            workers,
            gpu_slots = gpu.as_ref().map_or(0, GpuSlots::capacity),
            "starting batch '{}'",
            batch.name
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("ob-worker-{i}"))
            .build()
            .map_err(|e| AppError::runtime(format!("Failed to start worker pool: {e}")))?;

        let total = batch.subjects.len();
        let (tx, rx) = unbounded::<(usize, SubjectResult)>();
        let config = batch.config.as_ref();
        let gpu = gpu.as_ref();
        let run_dir = run_dir.as_path();

        let mut collected = thread::scope(|s| {
            let collector = s.spawn(move || {
                let mut out = Vec::with_capacity(total);
                for (index, result) in rx {
                    log_result(out.len() + 1, total, &result);
                    out.push((index, result));
                }
                out
            });

            pool.scope_fifo(|scope| {
                for (index, subject) in batch.subjects.iter().enumerate() {
                    let tx = tx.clone();
                    scope.spawn_fifo(move |_| {
                        let result = self.run_one(subject, config, gpu, run_dir);
                        let _ = tx.send((index, result));
                    });
                }
            });
            drop(tx);
            collector.join()
        })
        .map_err(|_| AppError::runtime("Result collector terminated unexpectedly."))?;

        collected.sort_by_key(|(index, _)| *index);
        Ok(collected.into_iter().map(|(_, result)| result).collect())
    }

    fn cancelled(&self, run_dir: &Path) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            return true;
        }
        if run_dir.join(STOP_FILE).exists() {
            warn!("stop file found; no further subjects will start");
            self.cancel.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    fn run_one(
        &self,
        subject: &Subject,
        config: &PipelineConfig,
        gpu: Option<&GpuSlots>,
        run_dir: &Path,
    ) -> SubjectResult {
        if self.cancelled(run_dir) {
            return SubjectResult {
                subject_id: subject.id.clone(),
                outcome: SubjectOutcome::Cancelled,
            };
        }

        let subject_dir = run_dir.join(&subject.id);
        let fingerprint = match cache::fingerprint(subject, config) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!(subject = %subject.id, "resume disabled: {e}");
                None
            }
        };
        if let Some(fp) = &fingerprint
            && let Some(manifest) = cache::load_cached(&subject_dir, fp)
        {
            return SubjectResult {
                subject_id: subject.id.clone(),
                outcome: SubjectOutcome::Cached(manifest),
            };
        }
        cache::invalidate(&subject_dir);

        let result = run_subject(subject, config, &self.backend, gpu, &subject_dir);
        if let (Some(fp), SubjectOutcome::Completed(manifest)) = (&fingerprint, &result.outcome)
            && let Err(e) = cache::store(&subject_dir, fp, manifest)
        {
            warn!(subject = %subject.id, "failed to store resume record: {e}");
        }
        result
    }
}

fn log_result(done: usize, total: usize, result: &SubjectResult) {
    let id = &result.subject_id;
    match &result.outcome {
        SubjectOutcome::Completed(m) if m.localized => info!("[{done}/{total}] {id}: completed"),
        SubjectOutcome::Completed(_) => info!("[{done}/{total}] {id}: completed (not localized)"),
        SubjectOutcome::Cached(_) => info!("[{done}/{total}] {id}: reused previous outputs"),
        SubjectOutcome::Failed { stage, error: e } => {
            error!("[{done}/{total}] {id}: failed during {stage}: {e}")
        }
        SubjectOutcome::Cancelled => warn!("[{done}/{total}] {id}: cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::domain::{ParallelLimits, Stage};
    use crate::testing::{FakeBackend, pipeline_config, write_scan};

    fn batch(root: &Path, subjects: &[(&str, &str)], limits: ParallelLimits, gpu: bool) -> BatchRun {
        let scans = root.join("scans");
        let subjects = subjects
            .iter()
            .map(|(id, behaviour)| Subject {
                id: id.to_string(),
                input: write_scan(&scans, id, behaviour),
            })
            .collect();
        let mut config = pipeline_config(root);
        if gpu {
            config.device = DeviceMode::Gpu;
        }
        BatchRun {
            name: "test_run".to_string(),
            subjects,
            skipped: Vec::new(),
            config: Arc::new(config),
            limits,
            work_dir: root.join("work"),
            output_dir: root.join("out"),
        }
    }

    fn limits(processes: usize, gpus: usize, per_gpu: usize) -> ParallelLimits {
        ParallelLimits {
            max_processes: processes,
            max_gpus: gpus,
            max_processes_per_gpu: per_gpu,
        }
    }

    fn ids(results: &[SubjectResult]) -> Vec<&str> {
        results.iter().map(|r| r.subject_id.as_str()).collect()
    }

    #[test]
    fn gpu_use_stays_within_slots_while_cpu_work_overlaps() {
        let dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = (0..8).map(|i| format!("sub-{i:02}")).collect();
        let subjects: Vec<_> = names.iter().map(|n| (n.as_str(), "ok")).collect();
        let batch = batch(dir.path(), &subjects, limits(4, 2, 1), true);

        let fake = Arc::new(FakeBackend::with_delay(Duration::from_millis(30)));
        let results = Scheduler::new(fake.backend()).run(&batch).unwrap();

        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| matches!(r.outcome, SubjectOutcome::Completed(_))));
        assert_eq!(ids(&results), names.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(fake.max_gpu_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(fake.max_per_device.load(Ordering::SeqCst), 1);
        let gpu_peak = fake.max_gpu_active.load(Ordering::SeqCst);
        let subject_peak = fake.max_in_flight.load(Ordering::SeqCst);
        assert!(subject_peak > 2, "only {subject_peak} subjects overlapped");
        assert!(subject_peak > gpu_peak);
    }

    #[test]
    fn failures_do_not_affect_other_subjects() {
        let dir = tempfile::tempdir().unwrap();
        let batch = batch(
            dir.path(),
            &[("a", "ok"), ("b", "fail"), ("c", "miss"), ("d", "panic"), ("e", "ok")],
            limits(2, 1, 1),
            false,
        );
        let fake = Arc::new(FakeBackend::default());
        let results = Scheduler::new(fake.backend()).run(&batch).unwrap();

        assert_eq!(ids(&results), vec!["a", "b", "c", "d", "e"]);
        assert!(matches!(results[0].outcome, SubjectOutcome::Completed(_)));
        assert!(matches!(
            results[1].outcome,
            SubjectOutcome::Failed {
                stage: Stage::Segmentation,
                ..
            }
        ));
        assert!(!results[2].manifest().unwrap().localized);
        assert!(results[3].is_failed());
        assert!(matches!(results[4].outcome, SubjectOutcome::Completed(_)));
    }

    #[test]
    fn cancel_flag_stops_pending_subjects() {
        let dir = tempfile::tempdir().unwrap();
        let batch = batch(dir.path(), &[("a", "ok"), ("b", "ok"), ("c", "ok")], limits(1, 1, 1), false);
        let fake = Arc::new(FakeBackend::with_delay(Duration::from_millis(40)));
        let scheduler = Scheduler::new(fake.backend());

        let flag = scheduler.cancel_flag();
        let results = thread::scope(|s| {
            s.spawn(move || {
                thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::SeqCst);
            });
            scheduler.run(&batch).unwrap()
        });

        assert!(matches!(results[0].outcome, SubjectOutcome::Completed(_)));
        assert_eq!(results[1].outcome, SubjectOutcome::Cancelled);
        assert_eq!(results[2].outcome, SubjectOutcome::Cancelled);
    }

    #[test]
    fn cancelled_scheduler_runs_again_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let batch = batch(dir.path(), &[("a", "ok"), ("b", "ok")], limits(1, 1, 1), false);
        let fake = Arc::new(FakeBackend::default());
        let scheduler = Scheduler::new(fake.backend());

        scheduler.cancel_flag().store(true, Ordering::SeqCst);
        fs::create_dir_all(batch.run_dir()).unwrap();
        fs::write(batch.run_dir().join(STOP_FILE), "").unwrap();
        let results = scheduler.run(&batch).unwrap();

        assert!(results.iter().all(|r| matches!(r.outcome, SubjectOutcome::Completed(_))));
        assert!(!scheduler.cancel_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn stop_file_stops_pending_subjects() {
        let dir = tempfile::tempdir().unwrap();
        let batch = batch(dir.path(), &[("a", "ok"), ("b", "ok")], limits(1, 1, 1), false);
        let fake = Arc::new(FakeBackend::with_delay(Duration::from_millis(40)));
        let scheduler = Scheduler::new(fake.backend());
        let stop: PathBuf = batch.run_dir().join(STOP_FILE);

        let results = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                fs::create_dir_all(stop.parent().unwrap()).unwrap();
                fs::write(&stop, "").unwrap();
            });
            scheduler.run(&batch).unwrap()
        });

        assert!(matches!(results[0].outcome, SubjectOutcome::Completed(_)));
        assert_eq!(results[1].outcome, SubjectOutcome::Cancelled);
    }

    #[test]
    fn rerun_reuses_completed_subjects() {
        let dir = tempfile::tempdir().unwrap();
        let batch = batch(dir.path(), &[("a", "ok"), ("b", "miss")], limits(2, 1, 1), false);
        let fake = Arc::new(FakeBackend::default());
        let scheduler = Scheduler::new(fake.backend());

        let first = scheduler.run(&batch).unwrap();
        assert!(first.iter().all(|r| matches!(r.outcome, SubjectOutcome::Completed(_))));

        let second = scheduler.run(&batch).unwrap();
        assert!(second.iter().all(|r| matches!(r.outcome, SubjectOutcome::Cached(_))));
        assert_eq!(first[0].manifest(), second[0].manifest());

        fs::write(&batch.subjects[1].input, "ok, changed").unwrap();
        let third = scheduler.run(&batch).unwrap();
        assert!(matches!(third[0].outcome, SubjectOutcome::Cached(_)));
        match &third[1].outcome {
            SubjectOutcome::Completed(m) => assert!(m.localized),
            other => panic!("expected recompute, got {other:?}"),
        }
    }
}
