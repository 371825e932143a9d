//! Cooperative main tick loop.
//!
//! A single task drives timed work at a fixed cadence of 20 ticks per
//! second. Work is enqueued as short closures executed in submission order
//! on the tick task; anything long-running must be dispatched to a worker
//! via `tokio::spawn` instead of blocking a tick.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Ticks per second of the main loop.
pub const TPS: u64 = 20;

/// Duration of a single tick.
pub const TICK_DURATION: Duration = Duration::from_millis(1000 / TPS);

type TickTask = Box<dyn FnOnce() + Send + 'static>;

enum TickCommand {
    Run(TickTask),
    ScheduleAt(u64, TickTask),
}

struct ScheduledTask {
    tick: u64,
    seq: u64,
    task: TickTask,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.tick == other.tick && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap on (tick, seq) via reversed comparison.
        (other.tick, other.seq).cmp(&(self.tick, self.seq))
    }
}

/// Handle to the running tick loop.
///
/// Cloneable; all clones refer to the same loop. Tasks enqueued from the
/// same thread run in submission order. A task submitting from inside the
/// loop runs on the next tick - there is no reentrancy.
#[derive(Clone)]
pub struct TickLoop {
    running: Arc<AtomicBool>,
    current_tick: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<TickCommand>,
}

impl TickLoop {
    /// Spawns the tick loop task and returns its handle.
    pub fn start() -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            running: Arc::new(AtomicBool::new(true)),
            current_tick: Arc::new(AtomicU64::new(0)),
            tx,
        };
        let join = tokio::spawn(run_loop(
            Arc::clone(&handle.running),
            Arc::clone(&handle.current_tick),
            rx,
        ));
        (handle, join)
    }

    /// True while the loop is running. Flipped false exactly once by
    /// [`Self::stop`]; the loop drains nothing further after that.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The tick number currently being (or about to be) executed.
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::SeqCst)
    }

    /// Enqueues a task for the next tick, best effort.
    pub fn run_task<F: FnOnce() + Send + 'static>(&self, task: F) {
        if self.tx.send(TickCommand::Run(Box::new(task))).is_err() {
            debug!("tick loop gone, dropping task");
        }
    }

    /// Executes a task at a specific tick number. A tick in the past runs
    /// on the next tick.
    pub fn schedule_at<F: FnOnce() + Send + 'static>(&self, tick: u64, task: F) {
        if self
            .tx
            .send(TickCommand::ScheduleAt(tick, Box::new(task)))
            .is_err()
        {
            debug!(tick, "tick loop gone, dropping scheduled task");
        }
    }

    /// Stops the loop. Idempotent: returns true only for the call that
    /// actually flipped the flag.
    pub fn stop(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }
}

async fn run_loop(
    running: Arc<AtomicBool>,
    current_tick: Arc<AtomicU64>,
    mut rx: mpsc::UnboundedReceiver<TickCommand>,
) {
    let mut interval = tokio::time::interval(TICK_DURATION);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut scheduled: BinaryHeap<ScheduledTask> = BinaryHeap::new();
    let mut seq = 0u64;

    while running.load(Ordering::SeqCst) {
        interval.tick().await;
        let tick = current_tick.load(Ordering::SeqCst);

        // Drain only what is queued at tick start; tasks submitted while
        // executing land on the next tick.
        let mut batch = Vec::new();
        while let Ok(command) = rx.try_recv() {
            batch.push(command);
        }

        for command in batch {
            match command {
                TickCommand::Run(task) => run_guarded(task, tick),
                TickCommand::ScheduleAt(at, task) => {
                    scheduled.push(ScheduledTask {
                        tick: at,
                        seq,
                        task,
                    });
                    seq += 1;
                }
            }
        }

        while scheduled.peek().is_some_and(|s| s.tick <= tick) {
            let entry = scheduled.pop().expect("peeked entry present");
            run_guarded(entry.task, tick);
        }

        current_tick.store(tick + 1, Ordering::SeqCst);
    }

    debug!("tick loop stopped");
}

fn run_guarded(task: TickTask, tick: u64) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        warn!(tick, ?panic, "tick task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        let (tick, join) = TickLoop::start();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            tick.run_task(move || order.lock().unwrap().push(i));
        }

        tokio::time::sleep(TICK_DURATION * 4).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);

        tick.stop();
        let _ = join.await;
    }

    #[tokio::test]
    async fn test_task_submitted_from_tick_runs_next_tick() {
        let (tick, join) = TickLoop::start();
        let ticks_seen = Arc::new(Mutex::new(Vec::new()));

        let inner_handle = tick.clone();
        let seen = Arc::clone(&ticks_seen);
        tick.run_task(move || {
            let outer_tick = inner_handle.current_tick();
            seen.lock().unwrap().push(("outer", outer_tick));
            let seen_inner = Arc::clone(&seen);
            let handle = inner_handle.clone();
            inner_handle.run_task(move || {
                seen_inner
                    .lock()
                    .unwrap()
                    .push(("inner", handle.current_tick()));
            });
        });

        tokio::time::sleep(TICK_DURATION * 6).await;
        let seen = ticks_seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "outer");
        assert_eq!(seen[1].0, "inner");
        assert!(seen[1].1 > seen[0].1, "inner task must run on a later tick");

        tick.stop();
        let _ = join.await;
    }

    #[tokio::test]
    async fn test_schedule_at_future_tick() {
        let (tick, join) = TickLoop::start();
        let fired_at = Arc::new(Mutex::new(None));

        let target = tick.current_tick() + 4;
        let fired = Arc::clone(&fired_at);
        let handle = tick.clone();
        tick.schedule_at(target, move || {
            *fired.lock().unwrap() = Some(handle.current_tick());
        });

        tokio::time::sleep(TICK_DURATION * 10).await;
        let fired = fired_at.lock().unwrap().expect("scheduled task fired");
        assert!(fired >= target);

        tick.stop();
        let _ = join.await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (tick, join) = TickLoop::start();
        assert!(tick.running());
        assert!(tick.stop(), "first stop flips the flag");
        assert!(!tick.stop(), "second stop is a no-op");
        assert!(!tick.running());
        let _ = join.await;
    }
}
