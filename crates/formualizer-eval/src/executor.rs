//! C7: the parallel interpreter pool (`spec.md` §5).
//!
//! A persistent pool of worker threads, lazily started on the first
//! calculation that asks for more than one thread and torn down once, in
//! `Executor::drop`. Workers suspend only on a `Condvar` guarding the
//! current run's ready queue — never a work-stealing deque — matching the
//! original's thread-pool shape (`spec.md` §9 REDESIGN FLAGS keeps this,
//! it only asks that the *traversal* feeding the queue become iterative).
//!
//! Dispatch granularity is one formula cell per task, grouped or not. A
//! grouped formula's members are not split across tasks: one worker walks
//! every position in the group's rectangle, assembles the result as a
//! single [`LiteralValue::Array`], and publishes it once through the
//! shared [`ResultSlot`] — so no position within a group ever needs a
//! narrower, per-cell write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

use formualizer_common::cellref::AbsCellAddr;
use formualizer_common::coord::Coord;
use formualizer_common::error::{ExcelError, ExcelErrorKind};
use formualizer_common::value::LiteralValue;

use crate::config::EvalConfig;
use crate::interp::{self, EvalContext};
use crate::observer::CalcObserver;
use crate::schedule::{self, ScheduleResult};
use crate::store::{CellStore, FormulaHandle};

/// One in-flight calculation pass, shared by every worker thread that picks
/// it up. Built fresh per run by [`Executor::run`] and dropped once every
/// dirty formula has published a result.
struct RunJob {
    store: Arc<CellStore>,
    config: EvalConfig,
    observer: Arc<dyn CalcObserver>,
    cycle_members: FxHashSet<FormulaHandle>,
    dependents: FxHashMap<FormulaHandle, Vec<FormulaHandle>>,
    remaining: Mutex<FxHashMap<FormulaHandle, usize>>,
    queue: Mutex<VecDeque<FormulaHandle>>,
    queue_cv: Condvar,
    total: usize,
    completed: AtomicUsize,
    done: Mutex<bool>,
    done_cv: Condvar,
    cancel: Arc<AtomicBool>,
}

impl RunJob {
    fn push_ready(&self, handle: FormulaHandle) {
        let mut q = self.queue.lock().unwrap();
        q.push_back(handle);
        self.queue_cv.notify_one();
    }

    /// Called once a formula's result is published: wake every dependent
    /// whose last outstanding prerequisite was this one.
    fn on_resolved(&self, handle: &FormulaHandle) {
        let newly_ready: Vec<FormulaHandle> = {
            let mut remaining = self.remaining.lock().unwrap();
            let mut ready = Vec::new();
            if let Some(dependents) = self.dependents.get(handle) {
                for dep in dependents {
                    if let Some(count) = remaining.get_mut(dep) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(dep.clone());
                        }
                    }
                }
            }
            ready
        };
        for dep in newly_ready {
            self.push_ready(dep);
        }

        let finished = self.completed.fetch_add(1, Ordering::AcqRel) + 1 >= self.total;
        if finished {
            *self.done.lock().unwrap() = true;
            self.done_cv.notify_all();
            // Workers idle on `queue_cv` (an empty queue with the run not
            // yet finished) need their own wakeup: `done_cv` only reaches
            // `Executor::run`'s caller thread.
            self.queue_cv.notify_all();
        }
    }
}

/// Evaluate a single formula cell, covering every position for a grouped
/// formula, and publish the (possibly array-shaped) result exactly once.
fn interpret_one(job: &RunJob, handle: &FormulaHandle) {
    if !handle.0.result.try_begin_resolving() {
        // Already resolved this run (e.g. pre-published as a cycle member
        // before this worker got to it) or claimed by another worker racing
        // the same ready-queue pop, which the queue's own exclusivity rules
        // out in practice but costs nothing to guard against.
        job.on_resolved(handle);
        return;
    }

    job.observer.on_eval_start(handle.0.range.first_addr());
    let started = Instant::now();

    let value = if job.cycle_members.contains(handle) {
        job.observer.on_cycle_detected(&[handle.clone()]);
        LiteralValue::Error(ExcelError::new(ExcelErrorKind::Circ))
    } else if handle.0.is_grouped() {
        evaluate_grouped(job, handle)
    } else {
        let ctx = EvalContext {
            store: &job.store,
            config: &job.config,
            at: handle.0.range.first,
        };
        interp::evaluate(&handle.0.tokens, &ctx)
    };

    handle.0.result.publish(value);
    handle.0.interpreted.store(true, Ordering::Release);
    handle.0.dirty.store(false, Ordering::Release);
    job.observer
        .on_eval_complete(handle.0.range.first_addr(), started.elapsed());

    job.on_resolved(handle);
}

fn evaluate_grouped(job: &RunJob, handle: &FormulaHandle) -> LiteralValue {
    let range = handle.0.range;
    let mut rows = Vec::with_capacity(range.height() as usize);
    for row in range.first.row()..=range.last.row() {
        let mut cols = Vec::with_capacity(range.width() as usize);
        for col in range.first.col()..=range.last.col() {
            let ctx = EvalContext {
                store: &job.store,
                config: &job.config,
                at: Coord::new(row, col),
            };
            cols.push(interp::evaluate(&handle.0.tokens, &ctx));
        }
        rows.push(cols);
    }
    LiteralValue::Array(rows)
}

fn worker_loop(job_slot: Arc<Mutex<Option<Arc<RunJob>>>>, job_cv: Arc<Condvar>, shutdown: Arc<AtomicBool>) {
    loop {
        let job = {
            let mut slot = job_slot.lock().unwrap();
            loop {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = slot.clone() {
                    break job;
                }
                slot = job_cv.wait(slot).unwrap();
            }
        };
        work_job(&job, &shutdown);
    }
}

fn work_job(job: &RunJob, shutdown: &AtomicBool) {
    let mut since_cancel_check = 0usize;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let handle = {
            let mut q = job.queue.lock().unwrap();
            loop {
                // Checked unconditionally here (not throttled by
                // `cancel_check_interval`, which only paces the
                // already-dispatched-work case below): a worker about to
                // pop or block is exactly where "no further cell is
                // started" (`spec.md` §5) has to take effect.
                if *job.done.lock().unwrap()
                    || shutdown.load(Ordering::Acquire)
                    || job.cancel.load(Ordering::Acquire)
                {
                    return;
                }
                if let Some(h) = q.pop_front() {
                    break h;
                }
                // Cancellation is a plain flag with no dedicated
                // notification path (it's flipped from outside any
                // `RunJob`, e.g. `Model::cancel`), so poll for it on a
                // short timeout instead of waiting on `queue_cv`
                // indefinitely.
                let (guard, _timeout) = job
                    .queue_cv
                    .wait_timeout(q, Duration::from_millis(10))
                    .unwrap();
                q = guard;
            }
        };
        interpret_one(job, &handle);
        since_cancel_check += 1;
        if since_cancel_check >= job.config.cancel_check_interval.max(1) {
            since_cancel_check = 0;
            if job.cancel.load(Ordering::Acquire) {
                return;
            }
        }
    }
}

/// The persistent worker pool. `thread_count == 0` runs every batch
/// inline on the calling thread instead of standing one up at all.
pub struct Executor {
    pool: Mutex<Option<Pool>>,
}

struct Pool {
    threads: Vec<JoinHandle<()>>,
    job_slot: Arc<Mutex<Option<Arc<RunJob>>>>,
    job_cv: Arc<Condvar>,
    shutdown: Arc<AtomicBool>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(None),
        }
    }

    fn ensure_pool(&self, thread_count: usize) {
        let mut guard = self.pool.lock().unwrap();
        if guard.is_some() || thread_count == 0 {
            return;
        }
        let job_slot = Arc::new(Mutex::new(None));
        let job_cv = Arc::new(Condvar::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let threads = (0..thread_count)
            .map(|_| {
                let job_slot = job_slot.clone();
                let job_cv = job_cv.clone();
                let shutdown = shutdown.clone();
                std::thread::spawn(move || worker_loop(job_slot, job_cv, shutdown))
            })
            .collect();
        *guard = Some(Pool {
            threads,
            job_slot,
            job_cv,
            shutdown,
        });
    }

    /// Run every formula in `schedule.order` to completion, respecting
    /// prerequisite edges derived from `graph`. Blocks the calling thread
    /// until the whole dirty set has published a result.
    pub fn run(
        &self,
        store: &Arc<CellStore>,
        graph: &crate::depgraph::DependencyGraph,
        dirty: &FxHashSet<FormulaHandle>,
        schedule: &ScheduleResult,
        config: &EvalConfig,
        observer: &Arc<dyn CalcObserver>,
        cancel: &Arc<AtomicBool>,
    ) {
        if dirty.is_empty() {
            return;
        }

        // Every dirty handle is rearmed before dispatch: a `FormulaCell`'s
        // `ResultSlot` survives across runs (it lives behind the same
        // `Arc` the whole cell's life), so without this a cell resolved in
        // an earlier run stays `Resolved` forever and `interpret_one` would
        // skip it on every subsequent recalculation.
        for handle in dirty {
            handle.0.result.reset();
        }

        let (dependents, mut remaining) =
            schedule::build_dependency_edges(store, graph, dirty, &schedule.cycle_members);

        let initial_ready: Vec<FormulaHandle> = remaining
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(h, _)| h.clone())
            .collect();
        // Ready handles are queued up front; clearing their count keeps
        // `on_resolved` from re-queuing them a second time if something else
        // also happened to depend on zero prerequisites.
        for h in &initial_ready {
            remaining.insert(h.clone(), usize::MAX);
        }

        let job = Arc::new(RunJob {
            store: store.clone(),
            config: config.clone(),
            observer: observer.clone(),
            cycle_members: schedule.cycle_members.clone(),
            dependents,
            remaining: Mutex::new(remaining),
            queue: Mutex::new(initial_ready.clone().into()),
            queue_cv: Condvar::new(),
            total: dirty.len(),
            completed: AtomicUsize::new(0),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            cancel: cancel.clone(),
        });

        if config.thread_count == 0 {
            self.run_inline(&job);
        } else {
            self.ensure_pool(config.thread_count);
            let guard = self.pool.lock().unwrap();
            let pool = guard.as_ref().expect("pool just ensured");
            *pool.job_slot.lock().unwrap() = Some(job.clone());
            pool.job_cv.notify_all();
            drop(guard);

            // `done_cv` is notified the moment the run actually finishes,
            // but cancellation is a flag flipped from outside this job with
            // no dedicated notification, so this also has to poll it.
            let mut done = job.done.lock().unwrap();
            while !*done && !cancel.load(Ordering::Acquire) {
                let (guard, _timeout) = job
                    .done_cv
                    .wait_timeout(done, Duration::from_millis(10))
                    .unwrap();
                done = guard;
            }
            drop(done);

            let guard = self.pool.lock().unwrap();
            if let Some(pool) = guard.as_ref() {
                *pool.job_slot.lock().unwrap() = None;
                pool.job_cv.notify_all();
            }
        }
    }

    /// `thread_count == 0`: no pool, the caller's own thread drains the
    /// ready queue directly.
    fn run_inline(&self, job: &Arc<RunJob>) {
        loop {
            let handle = {
                let mut q = job.queue.lock().unwrap();
                match q.pop_front() {
                    Some(h) => h,
                    None => break,
                }
            };
            interpret_one(job, &handle);
            if job.cancel.load(Ordering::Acquire) {
                break;
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        let mut guard = self.pool.lock().unwrap();
        if let Some(pool) = guard.take() {
            pool.shutdown.store(true, Ordering::Release);
            let mut job_slot = pool.job_slot.lock().unwrap();
            // A worker blocked on `queue_cv` (no ready cell, run not yet
            // finished) only ever wakes from `on_resolved`'s completion
            // broadcast or this one; without it `t.join()` below blocks
            // forever whenever the dropped run still has an active job.
            if let Some(job) = job_slot.take() {
                job.queue_cv.notify_all();
            }
            drop(job_slot);
            pool.job_cv.notify_all();
            for t in pool.threads {
                let _ = t.join();
            }
        }
    }
}
