//! Pending-work queue and the two ways of driving it
//!
//! Pending work is the engine's promise-job queue (microtasks) plus a
//! host-owned queue of timer callbacks (macrotasks). One unit of work is a
//! full microtask checkpoint, or one due macrotask followed by a checkpoint.
//!
//! - Host-stepped: [`EventLoop::process_events`] runs at most one unit and
//!   never blocks.
//! - Guest-driven: [`EventLoop::run`] runs ticks until the queue is empty or a
//!   stop is requested, calling back into the host after every tick.
//!
//! A tick only runs the macrotasks that were due when it started; anything
//! scheduled meanwhile waits for a later tick. Stop requests are checked at
//! tick boundaries.

use crate::error::{EmbedError, GuestException};
use hostjs_metrics::{Counter, TickTimer};
use rquickjs::{Context, Ctx, Function, Object, Persistent, Runtime, Value};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest sleep between stop-flag checks while waiting for a timer.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Rolling window for tick timing.
const TICK_SAMPLES: usize = 128;

pub(crate) type GuestTask = Persistent<Function<'static>>;
pub(crate) type SharedQueue = Rc<RefCell<TaskQueue<GuestTask>>>;

/// Returned when work is offered to a queue that no longer accepts any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueClosed;

/// Macrotasks ordered by due time, then by scheduling order.
pub(crate) struct TaskQueue<T> {
    next_id: u32,
    accepting: bool,
    tasks: BTreeMap<(Instant, u32), T>,
    due_by_id: HashMap<u32, Instant>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            accepting: true,
            tasks: BTreeMap::new(),
            due_by_id: HashMap::new(),
        }
    }

    pub fn enqueue(&mut self, due: Instant, task: T) -> Result<u32, QueueClosed> {
        if !self.accepting {
            return Err(QueueClosed);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.tasks.insert((due, id), task);
        self.due_by_id.insert(id, due);
        Ok(id)
    }

    pub fn cancel(&mut self, id: u32) -> bool {
        self.take(id).is_some()
    }

    pub fn take(&mut self, id: u32) -> Option<T> {
        let due = self.due_by_id.remove(&id)?;
        self.tasks.remove(&(due, id))
    }

    /// Ids of every task due at `now`, in run order.
    pub fn due_ids(&self, now: Instant) -> Vec<u32> {
        self.tasks
            .keys()
            .take_while(|(due, _)| *due <= now)
            .map(|&(_, id)| id)
            .collect()
    }

    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        let (&(due, id), _) = self.tasks.first_key_value()?;
        if due > now {
            return None;
        }
        self.take(id)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.tasks.keys().next().map(|&(due, _)| due)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Refuse new work; queued work stays.
    pub fn close(&mut self) {
        self.accepting = false;
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.due_by_id.clear();
    }
}

/// Cloneable, thread-safe handle for requesting that a guest-driven loop
/// stop at its next tick boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Which drive call currently owns the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    HostStepped,
    GuestDriven,
}

/// Snapshot of loop activity since initialization. All zero when the
/// `metrics` feature is off.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoopStats {
    pub ticks: usize,
    pub units: usize,
    pub uncaught: usize,
    pub average_tick: Duration,
    pub slowest_tick: Duration,
}

struct LoopMetrics {
    timer: TickTimer,
    counter: Counter,
}

/// Resets the drive slot when a drive call returns, including by unwinding.
struct DriveGuard<'a> {
    slot: &'a Cell<Option<DriveMode>>,
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.slot.set(None);
    }
}

#[derive(Clone, Copy)]
enum Wait {
    /// Sleep until the next timer is due, or until a stop is requested.
    UntilDueOrStopped,
    /// Sleep until the next timer is due.
    UntilDue,
}

pub(crate) struct EventLoop {
    queue: SharedQueue,
    stop: StopHandle,
    driving: Cell<Option<DriveMode>>,
    metrics: RefCell<LoopMetrics>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            queue: Rc::new(RefCell::new(TaskQueue::new())),
            stop: StopHandle::default(),
            driving: Cell::new(None),
            metrics: RefCell::new(LoopMetrics {
                timer: TickTimer::new(TICK_SAMPLES),
                counter: Counter::new(),
            }),
        }
    }

    pub fn queue(&self) -> SharedQueue {
        self.queue.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn mode(&self) -> Option<DriveMode> {
        self.driving.get()
    }

    pub fn has_pending(&self, runtime: &Runtime) -> bool {
        runtime.is_job_pending() || !self.queue.borrow().is_empty()
    }

    pub fn stats(&self) -> LoopStats {
        let metrics = self.metrics.borrow();
        LoopStats {
            ticks: metrics.counter.get("ticks"),
            units: metrics.counter.get("units"),
            uncaught: metrics.counter.get("uncaught"),
            average_tick: metrics.timer.average(),
            slowest_tick: metrics.timer.slowest(),
        }
    }

    /// Host-stepped mode: run at most one unit. Returns whether anything was
    /// pending when called.
    pub fn process_events(&self, runtime: &Runtime, context: &Context) -> Result<bool, EmbedError> {
        let _guard = self.enter(DriveMode::HostStepped)?;
        if !self.has_pending(runtime) {
            return Ok(false);
        }

        if runtime.is_job_pending() {
            self.checkpoint(runtime);
            self.count("units", 1);
            return Ok(true);
        }

        let task = self.queue.borrow_mut().pop_due(Instant::now());
        if let Some(task) = task {
            self.run_task(runtime, context, task);
            self.count("units", 1);
        }
        Ok(true)
    }

    /// Guest-driven mode: tick until drained or stopped, calling `callback`
    /// after every tick. Runs at least one tick.
    pub fn run<F: FnMut()>(
        &self,
        runtime: &Runtime,
        context: &Context,
        mut callback: F,
    ) -> Result<(), EmbedError> {
        let _guard = self.enter(DriveMode::GuestDriven)?;
        self.stop.clear();
        tracing::debug!("event loop started");

        loop {
            self.tick(runtime, context, Wait::UntilDueOrStopped);
            callback();
            if self.stop.is_stop_requested() {
                tracing::debug!("event loop stopped on request");
                break;
            }
            if !self.has_pending(runtime) {
                tracing::debug!("event loop drained");
                break;
            }
        }
        Ok(())
    }

    /// Refuse new macrotasks, then run everything already pending.
    pub fn drain(&self, runtime: &Runtime, context: &Context) {
        self.queue.borrow_mut().close();
        while self.has_pending(runtime) {
            self.tick(runtime, context, Wait::UntilDue);
        }
    }

    /// Drop queued tasks without running them. Must happen while the
    /// runtime is still alive.
    pub fn discard(&self) {
        let mut queue = self.queue.borrow_mut();
        if !queue.is_empty() {
            tracing::warn!(dropped = queue.len(), "discarding pending guest tasks");
        }
        queue.close();
        queue.clear();
    }

    fn enter(&self, mode: DriveMode) -> Result<DriveGuard<'_>, EmbedError> {
        if self.driving.get().is_some() {
            return Err(EmbedError::EventLoopBusy);
        }
        self.driving.set(Some(mode));
        Ok(DriveGuard { slot: &self.driving })
    }

    fn tick(&self, runtime: &Runtime, context: &Context, wait: Wait) {
        self.metrics.borrow_mut().timer.begin();
        let mut units = 0;

        if runtime.is_job_pending() {
            self.checkpoint(runtime);
            units += 1;
        }

        let mut due = self.queue.borrow().due_ids(Instant::now());
        if due.is_empty() && units == 0 {
            let next = self.queue.borrow().next_due();
            if let Some(deadline) = next {
                if self.wait_until(deadline, wait) {
                    due = self.queue.borrow().due_ids(Instant::now());
                }
            }
        }

        for id in due {
            // Cancelled by an earlier task in this tick if absent.
            let task = self.queue.borrow_mut().take(id);
            if let Some(task) = task {
                self.run_task(runtime, context, task);
                units += 1;
            }
        }

        let mut metrics = self.metrics.borrow_mut();
        metrics.timer.end();
        metrics.counter.increment("ticks", 1);
        metrics.counter.increment("units", units);
    }

    /// Returns true once `deadline` has passed.
    fn wait_until(&self, deadline: Instant, wait: Wait) -> bool {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            match wait {
                Wait::UntilDueOrStopped if self.stop.is_stop_requested() => return false,
                _ => std::thread::sleep((deadline - now).min(WAIT_SLICE)),
            }
        }
    }

    fn run_task(&self, runtime: &Runtime, context: &Context, task: GuestTask) {
        context.with(|ctx| {
            let result = task
                .restore(&ctx)
                .and_then(|callback| callback.call::<_, Value>(()).map(|_| ()));
            if let Err(err) = result {
                self.report_error(&ctx, err);
            }
        });
        self.checkpoint(runtime);
    }

    /// Run promise jobs until none are left, including ones they enqueue.
    fn checkpoint(&self, runtime: &Runtime) {
        loop {
            match runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(job) => job.0.with(|ctx| {
                    let thrown = ctx.catch();
                    self.report_uncaught(&ctx, thrown);
                }),
            }
        }
    }

    fn report_error(&self, ctx: &Ctx<'_>, err: rquickjs::Error) {
        match err {
            rquickjs::Error::Exception => {
                let thrown = ctx.catch();
                self.report_uncaught(ctx, thrown);
            }
            other => {
                self.count("uncaught", 1);
                tracing::error!(error = %other, "engine error while running guest task");
            }
        }
    }

    /// Top-level handler: hand the error to `process.on('uncaughtException')`
    /// listeners, or log it when nobody listens.
    fn report_uncaught<'js>(&self, ctx: &Ctx<'js>, thrown: Value<'js>) {
        self.count("uncaught", 1);
        let exception = GuestException::capture(thrown.clone());

        match emit_uncaught(ctx, thrown) {
            Ok(true) => {
                tracing::debug!(error = %exception, "uncaught guest error handled by listener");
            }
            Ok(false) => {
                tracing::error!(
                    error = %exception,
                    stack = exception.stack.as_deref().unwrap_or(""),
                    "uncaught guest error"
                );
            }
            Err(err) => {
                let listener_error = match err {
                    rquickjs::Error::Exception => GuestException::capture(ctx.catch()).to_string(),
                    other => other.to_string(),
                };
                tracing::error!(
                    error = %exception,
                    listener_error = %listener_error,
                    "uncaughtException listener failed"
                );
            }
        }
    }

    fn count(&self, name: &'static str, value: usize) {
        self.metrics.borrow_mut().counter.increment(name, value);
    }
}

fn emit_uncaught<'js>(ctx: &Ctx<'js>, thrown: Value<'js>) -> rquickjs::Result<bool> {
    let process: Object = ctx.globals().get("process")?;
    let fatal: Function = process.get("_fatalException")?;
    fatal.call((thrown,))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_orders_by_due_then_schedule_order() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        queue.enqueue(now + Duration::from_millis(5), "late").unwrap();
        queue.enqueue(now, "first").unwrap();
        queue.enqueue(now, "second").unwrap();

        assert_eq!(queue.pop_due(now), Some("first"));
        assert_eq!(queue.pop_due(now), Some("second"));
        assert_eq!(queue.pop_due(now), None);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_due(), Some(now + Duration::from_millis(5)));
    }

    #[test]
    fn test_due_ids_snapshot_excludes_later_work() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        let a = queue.enqueue(now, 'a').unwrap();
        let b = queue.enqueue(now, 'b').unwrap();
        let snapshot = queue.due_ids(now);
        queue.enqueue(now, 'c').unwrap();

        assert_eq!(snapshot, vec![a, b]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_cancel() {
        let mut queue = TaskQueue::new();
        let id = queue.enqueue(Instant::now(), ()).unwrap();
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closed_queue_keeps_existing_work() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        queue.enqueue(now, 1).unwrap();
        queue.close();

        assert!(!queue.is_accepting());
        assert_eq!(queue.enqueue(now, 2), Err(QueueClosed));
        assert_eq!(queue.pop_due(now), Some(1));
    }

    #[test]
    fn test_stop_handle_is_shared() {
        let handle = StopHandle::default();
        let remote = handle.clone();
        std::thread::spawn(move || remote.stop()).join().unwrap();
        assert!(handle.is_stop_requested());
        handle.clear();
        assert!(!handle.is_stop_requested());
    }
}
