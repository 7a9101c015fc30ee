/// Shared priority queue of fetch requests.
///
/// Every peer fetch loop draws work from one scheduler. Requests are served
/// lowest priority (height) first; ties go to the earlier push. Poppers never
/// poll: they sleep until a push wakes them.
///
/// ## Deduplication
///
/// At most one request per block identity is queued. Pushing a second request
/// for a queued identity merges its tried peers into the queued entry (and
/// keeps the lower priority). Pushing a request whose signal already settled
/// is a silent no-op.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use containers::Bytes32;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::request::FetchRequest;

#[derive(Debug, Default)]
struct SchedulerState {
    /// (priority, push sequence, identity); entries whose priority no longer
    /// matches `entries` are stale and skipped.
    heap: BinaryHeap<Reverse<(u64, u64, Bytes32)>>,
    entries: HashMap<Bytes32, FetchRequest>,
    next_seq: u64,
    /// Bumped on every accepted push.
    generation: u64,
    closed: bool,
}

impl SchedulerState {
    fn insert(&mut self, request: FetchRequest) -> bool {
        if request.is_done() {
            return false;
        }

        let hash = request.hash();
        let priority = request.priority;

        if let Some(queued) = self.entries.get_mut(&hash) {
            queued.peers_tried.extend(request.peers_tried);
            if priority >= queued.priority {
                return true;
            }
            queued.priority = priority;
        } else {
            self.entries.insert(hash, request);
        }

        self.heap.push(Reverse((priority, self.next_seq, hash)));
        self.next_seq += 1;
        true
    }

    fn pop(&mut self) -> Option<FetchRequest> {
        while let Some(Reverse((priority, _, hash))) = self.heap.pop() {
            let current = self.entries.get(&hash).map(|queued| queued.priority);
            if current == Some(priority) {
                return self.entries.remove(&hash);
            }
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct BlockFetchScheduler {
    state: Mutex<SchedulerState>,
    pushed: Notify,
}

impl BlockFetchScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `request`. Returns `false` if it was dropped (signal settled or
    /// scheduler closed).
    pub fn push(&self, request: FetchRequest) -> bool {
        let accepted = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            let accepted = state.insert(request);
            if accepted {
                state.generation += 1;
            }
            accepted
        };

        if accepted {
            self.pushed.notify_waiters();
        }
        accepted
    }

    /// Push every request back and return the generation observed right
    /// after, for use with [`Self::wait_for_push`].
    pub fn requeue(&self, requests: impl IntoIterator<Item = FetchRequest>) -> u64 {
        let (accepted, generation) = {
            let mut state = self.state.lock();
            let mut accepted = 0;
            if !state.closed {
                for request in requests {
                    if state.insert(request) {
                        accepted += 1;
                    }
                }
            }
            state.generation += accepted;
            (accepted, state.generation)
        };

        if accepted > 0 {
            self.pushed.notify_waiters();
        }
        generation
    }

    pub fn try_pop(&self) -> Option<FetchRequest> {
        self.state.lock().pop()
    }

    /// Lowest-priority request, waiting for a push if the queue is empty.
    /// Returns `None` once the scheduler is closed.
    pub async fn pop(&self) -> Option<FetchRequest> {
        loop {
            let notified = self.pushed.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(request) = state.pop() {
                    return Some(request);
                }
            }
            notified.await;
        }
    }

    /// Wait until something was pushed after `generation` was observed.
    /// Returns `false` if the scheduler closed instead.
    pub async fn wait_for_push(&self, generation: u64) -> bool {
        loop {
            let notified = self.pushed.notified();
            {
                let state = self.state.lock();
                if state.closed {
                    return false;
                }
                if state.generation > generation {
                    return true;
                }
            }
            notified.await;
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn contains(&self, hash: &Bytes32) -> bool {
        self.state.lock().entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Drop everything queued and wake every waiter.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.heap.clear();
            state.entries.clear();
        }
        self.pushed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
