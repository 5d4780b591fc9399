use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::Clock;

type TaskFn = Box<dyn FnOnce() + Send>;

struct Task {
    due_ms: u32,
    exec: TaskFn,
}

struct QueuedTask {
    due_ms: u32,
    seq: u64,
    exec: TaskFn,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &QueuedTask) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &QueuedTask) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &QueuedTask) -> Ordering {
        (self.due_ms, self.seq).cmp(&(other.due_ms, other.seq))
    }
}

/// Drives many connections' update ticks from a bounded worker pool.
///
/// Tasks are `(due-time, callback)` pairs. A dispatcher forwards pushed
/// tasks round-robin to the workers; each worker runs due tasks off its
/// own min-heap. Due-time order is strict within one worker and
/// best-effort across workers. Callbacks must not block: a stalled
/// callback starves every task parked on the same worker.
#[derive(Clone)]
pub(crate) struct TimerScheduler {
    ingress: mpsc::UnboundedSender<Task>,
    cancel: CancellationToken,
}

impl TimerScheduler {
    pub(crate) fn new(parallelism: u32, clock: Clock) -> TimerScheduler {
        let parallelism = parallelism.max(1);
        let cancel = CancellationToken::new();
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();

        let mut workers = Vec::with_capacity(parallelism as usize);
        for _ in 0..parallelism {
            let (worker_tx, worker_rx) = mpsc::unbounded_channel();
            workers.push(worker_tx);
            tokio::spawn(worker_loop(worker_rx, cancel.child_token(), clock));
        }
        tokio::spawn(dispatch_loop(ingress_rx, workers, cancel.child_token()));

        TimerScheduler {
            ingress: ingress_tx,
            cancel,
        }
    }

    /// Enqueue `exec` to run once the clock reaches `due_ms`. Dropped
    /// silently after `close`.
    pub(crate) fn push<F>(&self, due_ms: u32, exec: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.ingress.send(Task {
            due_ms,
            exec: Box::new(exec),
        });
    }

    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }
}

async fn dispatch_loop(
    mut ingress: mpsc::UnboundedReceiver<Task>,
    workers: Vec<mpsc::UnboundedSender<Task>>,
    cancel: CancellationToken,
) {
    let mut next = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            task = ingress.recv() => {
                let Some(task) = task else { return };
                let _ = workers[next % workers.len()].send(task);
                next = next.wrapping_add(1);
            }
        }
    }
}

async fn worker_loop(
    mut ingress: mpsc::UnboundedReceiver<Task>,
    cancel: CancellationToken,
    clock: Clock,
) {
    let mut heap: BinaryHeap<Reverse<QueuedTask>> = BinaryHeap::new();
    let mut seq: u64 = 0;

    let sleep = tokio::time::sleep(Duration::from_secs(3600));
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            task = ingress.recv() => {
                let Some(task) = task else { return };
                let now = clock.now_ms();
                if now >= task.due_ms {
                    (task.exec)();
                } else {
                    heap.push(Reverse(QueuedTask {
                        due_ms: task.due_ms,
                        seq,
                        exec: task.exec,
                    }));
                    seq = seq.wrapping_add(1);
                    let wait = heap.peek().map(|t| t.0.due_ms.saturating_sub(now)).unwrap_or(0);
                    sleep.as_mut().reset(
                        tokio::time::Instant::now() + Duration::from_millis(wait as u64),
                    );
                }
            }
            _ = &mut sleep, if !heap.is_empty() => {
                let now = clock.now_ms();
                while let Some(top) = heap.peek() {
                    if now < top.0.due_ms {
                        break;
                    }
                    let Reverse(task) = heap.pop().expect("heap top just observed");
                    (task.exec)();
                }
                if let Some(top) = heap.peek() {
                    let wait = top.0.due_ms.saturating_sub(clock.now_ms()).max(1);
                    sleep.as_mut().reset(
                        tokio::time::Instant::now() + Duration::from_millis(wait as u64),
                    );
                }
            }
        }
    }
}
