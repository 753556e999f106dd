//! Cooperative serial queue for extension callbacks.
//!
//! The dispatcher is a single logical consumer: submission is thread-safe
//! from any task, execution is strictly serial and FIFO on one spawned
//! consumer. Extension callbacks that are not declared thread-safe are
//! funnelled through here, which gives them an "application thread" to live
//! on without blocking transport I/O.
//!
//! A submission optionally carries a continuation that runs on the
//! dispatcher immediately after the primary task. The primary's return value
//! decides whether the continuation runs, which lets callers make it
//! conditional (admission uses this: a failing `client_connected` handler
//! must not start the receive loop).

use tokio::sync::mpsc;

tokio::task_local! {
    static ON_DISPATCHER: ();
}

pub(crate) type PrimaryFn = Box<dyn FnOnce() -> bool + Send>;
pub(crate) type ContinuationFn = Box<dyn FnOnce() + Send>;

struct Task {
    primary: PrimaryFn,
    continuation: Option<ContinuationFn>,
}

fn run_task(task: Task) {
    let run_continuation = (task.primary)();
    if run_continuation {
        if let Some(continuation) = task.continuation {
            continuation();
        }
    }
}

/// Handle to the serial callback queue. Cloning is cheap; all clones feed
/// the same consumer.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Task>,
}

impl Dispatcher {
    /// Spawn the consumer task. `queue_bound` caps how many submissions may
    /// sit unprocessed; producers awaiting `enqueue` beyond that are held
    /// back, which keeps a slow extension from buffering unbounded work.
    pub(crate) fn start(queue_bound: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Task>(queue_bound.max(1));
        tokio::spawn(ON_DISPATCHER.scope((), async move {
            while let Some(task) = rx.recv().await {
                run_task(task);
            }
        }));
        Self { tx }
    }

    /// True when the calling code is already executing on the dispatcher.
    pub fn is_current() -> bool {
        ON_DISPATCHER.try_with(|_| ()).is_ok()
    }

    /// Unconditionally queue a task.
    pub async fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(
            Box::new(move || {
                task();
                true
            }),
            None,
        )
        .await;
    }

    /// Run `task` immediately when already on the dispatcher, otherwise
    /// queue it. The immediate path is what lets an extension callback chain
    /// follow-up work without deadlocking on its own queue slot.
    pub fn dispatch_if_needed<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if Self::is_current() {
            task();
            return;
        }
        let boxed: PrimaryFn = Box::new(move || {
            task();
            true
        });
        match self.tx.try_send(Task { primary: boxed, continuation: None }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                // Saturated queue: fall back to an awaited send off-task so
                // the submitter is never blocked.
                let tx = self.tx.clone();
                log::warn!("dispatcher queue saturated; deferring submission");
                tokio::spawn(async move {
                    let _ = tx.send(task).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("dispatcher stopped; dropping submitted task");
            }
        }
    }

    /// Queue a primary task with an optional continuation. The continuation
    /// runs right after the primary, and only if the primary returns true.
    pub(crate) async fn submit(&self, primary: PrimaryFn, continuation: Option<ContinuationFn>) {
        if self
            .tx
            .send(Task { primary, continuation })
            .await
            .is_err()
        {
            log::warn!("dispatcher stopped; dropping queued callback");
        }
    }
}
