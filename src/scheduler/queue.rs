use std::collections::HashSet;

use parking_lot::Mutex;

use crate::scheduler::job::DocumentTask;

const DEFAULT_PROGRESS_EVERY: usize = 100;

#[derive(Debug)]
struct QueueState {
    tasks: Vec<Option<DocumentTask>>,
    next: usize,
    /// Document ids already handed out or recorded in this job
    processed: HashSet<i64>,
    completed: usize,
}

/// The job's document list, drained by the worker pool.
///
/// One mutex guards the shared index, the processed set and the progress
/// counter. A task is moved out of the queue when claimed, so the claiming
/// worker owns it exclusively.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    total: usize,
    progress_every: usize,
}

impl WorkQueue {
    pub fn new(tasks: Vec<DocumentTask>) -> Self {
        Self::with_processed(tasks, std::iter::empty(), DEFAULT_PROGRESS_EVERY)
    }

    /// Build a queue that will refuse ids in `already_processed`.
    pub fn with_processed(
        tasks: Vec<DocumentTask>,
        already_processed: impl IntoIterator<Item = i64>,
        progress_every: usize,
    ) -> Self {
        let total = tasks.len();
        Self {
            state: Mutex::new(QueueState {
                tasks: tasks.into_iter().map(Some).collect(),
                next: 0,
                processed: already_processed.into_iter().collect(),
                completed: 0,
            }),
            total,
            progress_every: progress_every.max(1),
        }
    }

    /// Claim the next unprocessed task, advancing the shared index.
    /// Returns None once the list is exhausted.
    pub fn claim(&self) -> Option<DocumentTask> {
        let mut state = self.state.lock();
        while state.next < state.tasks.len() {
            let index = state.next;
            state.next += 1;
            let Some(task) = state.tasks[index].take() else {
                continue;
            };
            if !state.processed.insert(task.doc_id) {
                tracing::warn!(doc_id = task.doc_id, "Document already processed, skipping");
                continue;
            }
            return Some(task);
        }
        None
    }

    /// Count one finished document. Returns the running total when it lands
    /// on the progress cadence.
    pub fn complete_one(&self) -> Option<usize> {
        let mut state = self.state.lock();
        state.completed += 1;
        if state.completed % self.progress_every == 0 {
            Some(state.completed)
        } else {
            None
        }
    }

    pub fn is_processed(&self, doc_id: i64) -> bool {
        self.state.lock().processed.contains(&doc_id)
    }

    pub fn completed(&self) -> usize {
        self.state.lock().completed
    }

    pub fn claimed(&self) -> usize {
        self.state.lock().next
    }

    /// Returns the number of tasks the queue was built with
    pub fn len(&self) -> usize {
        self.total
    }

    /// Returns true if the queue was built without tasks
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}
