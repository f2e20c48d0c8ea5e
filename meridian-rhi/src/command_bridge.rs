//! Deferred-command bridge between the submission thread and the thread
//! that owns the execution context.
//!
//! Every state-mutating operation goes through [`CommandBridge`]: it either
//! runs inline (the caller already is the execution thread, no worker is
//! configured, or bypass is active) or is enqueued for the worker. The
//! queue is strictly FIFO; later commands may read state produced by
//! earlier ones, so no reordering or coalescing is ever permitted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::device::ExecutionState;

pub(crate) type DeferredCommand = Box<dyn FnOnce(&mut ExecutionState) + Send + 'static>;

/// Failure reported back to a caller waiting on a deferred command.
#[derive(Debug)]
pub enum CommandFault {
    /// The command panicked on the execution thread.
    Panicked(String),
    /// The execution thread went away before the command could run.
    ExecutionStopped,
}

impl CommandFault {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        CommandFault::Panicked(message)
    }
}

impl std::fmt::Display for CommandFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandFault::Panicked(message) => {
                write!(f, "Deferred command panicked on the execution thread: {}", message)
            }
            CommandFault::ExecutionStopped => {
                write!(f, "Execution thread terminated before the command could run")
            }
        }
    }
}

impl std::error::Error for CommandFault {}

struct QueueInner {
    commands: VecDeque<(u64, DeferredCommand)>,
    /// Tickets are handed out under the queue lock, so ticket order is
    /// exactly execution order.
    next_ticket: u64,
    stopped: bool,
}

#[derive(Default)]
struct Progress {
    completed: u64,
    retired: bool,
    abnormal: bool,
}

/// Queue machinery shared by the submission and execution threads.
pub(crate) struct CommandBridge {
    queue: Mutex<QueueInner>,
    work_available: Condvar,
    progress: Mutex<Progress>,
    completion: Condvar,
    execution_thread: Mutex<Option<ThreadId>>,
    bypass: AtomicBool,
    threaded: bool,
}

impl CommandBridge {
    pub fn new(threaded: bool) -> Self {
        Self {
            queue: Mutex::new(QueueInner {
                commands: VecDeque::new(),
                next_ticket: 1,
                stopped: false,
            }),
            work_available: Condvar::new(),
            progress: Mutex::new(Progress::default()),
            completion: Condvar::new(),
            execution_thread: Mutex::new(None),
            bypass: AtomicBool::new(false),
            threaded,
        }
    }

    pub fn set_bypass(&self, bypass: bool) {
        self.bypass.store(bypass, Ordering::Relaxed);
    }

    pub fn bypass(&self) -> bool {
        self.bypass.load(Ordering::Relaxed)
    }

    /// Register the calling thread as the execution thread.
    pub fn adopt_execution_thread(&self) {
        *self.execution_thread.lock() = Some(thread::current().id());
    }

    /// Whether an operation issued by the calling thread must run inline
    /// rather than be enqueued. Enqueueing from the execution thread itself
    /// would deadlock a blocking flush, so that case is always inline.
    pub fn runs_inline(&self) -> bool {
        if self.bypass() || !self.threaded {
            return true;
        }
        if self.queue.lock().stopped {
            // Teardown: the worker is gone and the queue has been drained.
            return true;
        }
        *self.execution_thread.lock() == Some(thread::current().id())
    }

    /// The execution thread terminated without a clean stop.
    pub fn is_dead(&self) -> bool {
        self.progress.lock().abnormal
    }

    pub fn enqueue(&self, command: DeferredCommand) -> u64 {
        let mut queue = self.queue.lock();
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        queue.commands.push_back((ticket, command));
        self.work_available.notify_one();
        ticket
    }

    /// Block until the execution thread has processed the queue up to and
    /// including `ticket`. No timeout: progress is guaranteed structurally,
    /// not by the clock.
    pub fn flush_until(&self, ticket: u64) -> Result<(), CommandFault> {
        let mut progress = self.progress.lock();
        while progress.completed < ticket {
            if progress.retired {
                return Err(CommandFault::ExecutionStopped);
            }
            self.completion.wait(&mut progress);
        }
        Ok(())
    }

    /// Next command for the execution thread; `None` once stopped and
    /// drained.
    pub fn wait_next(&self) -> Option<(u64, DeferredCommand)> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(entry) = queue.commands.pop_front() {
                return Some(entry);
            }
            if queue.stopped {
                return None;
            }
            self.work_available.wait(&mut queue);
        }
    }

    pub fn try_pop(&self) -> Option<(u64, DeferredCommand)> {
        self.queue.lock().commands.pop_front()
    }

    pub fn mark_completed(&self, ticket: u64) {
        let mut progress = self.progress.lock();
        // Teardown drains can interleave with the worker's tail; completion
        // only ever moves forward.
        progress.completed = progress.completed.max(ticket);
        self.completion.notify_all();
    }

    /// Ask the execution thread to exit once the queue is drained.
    pub fn stop(&self) {
        self.queue.lock().stopped = true;
        self.work_available.notify_all();
    }

    /// Called by the execution thread on the way out, cleanly or not.
    /// Wakes every blocked flush so nobody waits on a thread that is gone.
    pub fn mark_worker_exit(&self, abnormal: bool) {
        let mut progress = self.progress.lock();
        progress.retired = true;
        progress.abnormal |= abnormal;
        self.completion.notify_all();
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().commands.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickets_are_handed_out_in_order() {
        let bridge = CommandBridge::new(true);
        let t1 = bridge.enqueue(Box::new(|_| {}));
        let t2 = bridge.enqueue(Box::new(|_| {}));
        let t3 = bridge.enqueue(Box::new(|_| {}));

        assert!(t1 < t2 && t2 < t3);
        assert_eq!(bridge.queue_depth(), 3);

        let (first, _) = bridge.try_pop().unwrap();
        let (second, _) = bridge.try_pop().unwrap();
        assert_eq!((first, second), (t1, t2));
    }

    #[test]
    fn flush_returns_once_ticket_completed() {
        let bridge = CommandBridge::new(true);
        let ticket = bridge.enqueue(Box::new(|_| {}));

        let (popped, _) = bridge.try_pop().unwrap();
        bridge.mark_completed(popped);

        assert!(bridge.flush_until(ticket).is_ok());
    }

    #[test]
    fn flush_reports_a_retired_worker() {
        let bridge = CommandBridge::new(true);
        let ticket = bridge.enqueue(Box::new(|_| {}));
        bridge.mark_worker_exit(true);

        assert!(matches!(
            bridge.flush_until(ticket),
            Err(CommandFault::ExecutionStopped)
        ));
        assert!(bridge.is_dead());
    }

    #[test]
    fn unthreaded_bridge_is_always_inline() {
        let bridge = CommandBridge::new(false);
        assert!(bridge.runs_inline());
    }

    #[test]
    fn bypass_forces_inline() {
        let bridge = CommandBridge::new(true);
        assert!(!bridge.runs_inline());
        bridge.set_bypass(true);
        assert!(bridge.runs_inline());
    }

    #[test]
    fn execution_thread_is_inline_after_adoption() {
        let bridge = CommandBridge::new(true);
        assert!(!bridge.runs_inline());
        bridge.adopt_execution_thread();
        assert!(bridge.runs_inline());
    }

    #[test]
    fn fault_display_carries_the_panic_message() {
        let fault = CommandFault::from_panic(Box::new("boom"));
        assert!(fault.to_string().contains("boom"));
    }
}
