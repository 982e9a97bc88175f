use crate::{PipelineHandle, Task, TaskSpec};
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued(u64),
    Duplicate,
    Closed,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Task>,
    seen: HashSet<(usize, String)>,
    in_flight: usize,
    closed: bool,
}

/// Pending tasks of every pipeline plus the count of tasks being processed.
///
/// A task handed out by [`Scheduler::next`] stays in flight until the worker
/// calls [`Scheduler::complete`], which it does only after every task derived
/// from it was enqueued. `next` therefore only reports end of work once
/// nothing is pending and nothing running can add more.
pub struct Scheduler {
    state: Mutex<State>,
    notify: Notify,
    seq: AtomicU64,
    dedupe: bool,
}

impl Scheduler {
    pub fn new(dedupe: bool) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            dedupe,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, pipeline: &PipelineHandle, spec: TaskSpec) -> Enqueued {
        let mut state = self.lock();
        if state.closed {
            return Enqueued::Closed;
        }
        if self.dedupe && !state.seen.insert((pipeline.index(), spec.url().to_string())) {
            return Enqueued::Duplicate;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        state.pending.push_back(Task::new(seq, pipeline.clone(), spec));
        drop(state);

        self.notify.notify_one();
        Enqueued::Queued(seq)
    }

    /// Next task in sequence order, or `None` once the crawl is drained or closed.
    pub async fn next(&self) -> Option<Task> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(task) = state.pending.pop_front() {
                    state.in_flight += 1;
                    return Some(task);
                }
                if state.in_flight == 0 {
                    drop(state);
                    self.notify.notify_waiters();
                    return None;
                }
            }

            notified.await;
        }
    }

    pub fn complete(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Stop handing out tasks. Tasks already in flight may still complete.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    fn handle(index: usize, name: &str) -> PipelineHandle {
        PipelineHandle::new(index, name)
    }

    #[tokio::test]
    async fn empty_scheduler_ends_immediately() {
        let scheduler = Scheduler::new(true);
        assert_eq!(scheduler.next().await, None);
    }

    #[tokio::test]
    async fn hands_out_tasks_in_sequence_order() {
        let scheduler = Scheduler::new(true);
        let links = handle(0, "links");
        let details = handle(1, "details");
        assert_eq!(scheduler.enqueue(&links, TaskSpec::new("a")), Enqueued::Queued(0));
        assert_eq!(scheduler.enqueue(&details, TaskSpec::new("b")), Enqueued::Queued(1));

        let first = scheduler.next().await.unwrap();
        let second = scheduler.next().await.unwrap();
        assert_eq!((first.seq(), first.pipeline().name()), (0, "links"));
        assert_eq!((second.seq(), second.pipeline().name()), (1, "details"));
        assert_eq!(scheduler.in_flight(), 2);
    }

    #[tokio::test]
    async fn duplicates_are_per_pipeline() {
        let scheduler = Scheduler::new(true);
        let links = handle(0, "links");
        let details = handle(1, "details");
        scheduler.enqueue(&links, TaskSpec::new("a"));
        assert_eq!(scheduler.enqueue(&links, TaskSpec::new("a")), Enqueued::Duplicate);
        assert!(matches!(
            scheduler.enqueue(&details, TaskSpec::new("a")),
            Enqueued::Queued(_)
        ));

        let scheduler = Scheduler::new(false);
        scheduler.enqueue(&links, TaskSpec::new("a"));
        assert!(matches!(
            scheduler.enqueue(&links, TaskSpec::new("a")),
            Enqueued::Queued(_)
        ));
    }

    #[tokio::test]
    async fn waits_for_in_flight_task_before_ending() {
        let scheduler = Arc::new(Scheduler::new(true));
        let links = handle(0, "links");
        scheduler.enqueue(&links, TaskSpec::new("page-1"));
        let running = scheduler.next().await.unwrap();

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        scheduler.enqueue(running.pipeline(), TaskSpec::new("page-2"));
        scheduler.complete();

        let derived = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(derived.url(), "page-2");

        scheduler.complete();
        assert_eq!(scheduler.next().await, None);
    }

    #[tokio::test]
    async fn completion_of_last_task_releases_all_waiters() {
        let scheduler = Arc::new(Scheduler::new(true));
        scheduler.enqueue(&handle(0, "links"), TaskSpec::new("only"));
        scheduler.next().await.unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move { scheduler.next().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.complete();

        for waiter in waiters {
            let next = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            assert_eq!(next, None);
        }
    }

    #[tokio::test]
    async fn closed_scheduler_rejects_and_ends() {
        let scheduler = Scheduler::new(true);
        let links = handle(0, "links");
        scheduler.enqueue(&links, TaskSpec::new("a"));
        scheduler.close();

        assert_eq!(scheduler.enqueue(&links, TaskSpec::new("b")), Enqueued::Closed);
        assert_eq!(scheduler.next().await, None);
        assert_eq!(scheduler.pending(), 1);
    }
}
