//! Per-address version tracking for in-flight tasks.
//!
//! Writes reach the file asynchronously and lag behind the in-memory tree.
//! The tracker bridges that gap: every mutation records, per disk address,
//! what the address held before (`head`) and after (`tail`) the mutating task.
//! Any task can then ask what an address looks like at its own point in the
//! task order, whether or not the real bytes have landed yet.
//!
//! # Tasks
//!
//! Every engine operation runs under a task. Active tasks (writes) always get
//! a fresh id. Passive tasks (reads) coalesce: while the newest queued task is
//! passive it is handed out again, so a burst of reads shares one id.
//!
//! # Invariants
//!
//! - Task ids in the queue are strictly increasing.
//! - The ids of one address's memo chain are strictly increasing.
//! - An address is tracked only while a queued active task owns a memo for it.
//! - Tasks leave the queue in FIFO order, and only once they have no
//!   outstanding commands.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::storage::btree::node::IndexNode;

/// Identifier of a task, ordered by creation.
pub type TaskId = u64;

/// What an address holds at some point in the task order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version<K> {
    /// An 8-byte pointer slot holding this address.
    Pointer(u64),
    /// A placed index node.
    Node(Arc<IndexNode<K>>),
}

impl<K> Version<K> {
    /// Wrap a node snapshot.
    #[must_use]
    pub fn node(node: &IndexNode<K>) -> Self
    where
        K: Clone,
    {
        Self::Node(Arc::new(node.clone()))
    }
}

/// One recorded overwrite of an address.
///
/// `head` is visible to tasks created before the recording task, `tail` to
/// the recording task and everything after it. `None` means "nothing tracked":
/// the reader falls back to the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memo<K> {
    pub head: Option<Version<K>>,
    pub tail: Option<Version<K>>,
}

/// A space range to hand back to the allocator once a task is retired.
pub type Reclaim = (u64, u64);

#[derive(Debug)]
struct Task {
    id: TaskId,
    is_active: bool,
    /// Outstanding commands; the task cannot retire until this is 0.
    commands: usize,
    /// Addresses this task recorded memos for (active only).
    addresses: Vec<u64>,
    /// Space to free on retirement (active only).
    reclaim: Vec<Reclaim>,
}

/// An active task that left the queue but whose memos may still be needed.
#[derive(Debug)]
struct Retired {
    id: TaskId,
    /// First id the task never overlapped; every task below it must retire
    /// before the memos can go.
    watermark: TaskId,
    addresses: Vec<u64>,
    reclaim: Vec<Reclaim>,
}

#[derive(Debug)]
struct Chain<K> {
    ids: Vec<TaskId>,
    memos: Vec<Memo<K>>,
}

/// The task queue plus the per-address memo chains.
#[derive(Debug)]
pub struct VersionTracker<K> {
    next_id: TaskId,
    queue: VecDeque<Task>,
    retired: VecDeque<Retired>,
    chains: HashMap<u64, Chain<K>>,
    idle: Arc<Notify>,
}

impl<K> Default for VersionTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> VersionTracker<K> {
    /// Create an idle tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 0,
            queue: VecDeque::new(),
            retired: VecDeque::new(),
            chains: HashMap::new(),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Start a task.
    ///
    /// Returns the newest queued task instead of a new one when both it and
    /// the request are passive.
    pub fn create_task(&mut self, is_active: bool) -> TaskId {
        if !is_active {
            if let Some(last) = self.queue.back().filter(|last| !last.is_active) {
                return last.id;
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(Task {
            id,
            is_active,
            commands: 0,
            addresses: Vec::new(),
            reclaim: Vec::new(),
        });
        id
    }

    /// Register one more outstanding command against `task`.
    pub fn add_command(&mut self, task: TaskId) {
        if let Some(task) = self.task_mut(task) {
            task.commands += 1;
        }
    }

    /// Outstanding commands of `task`, or `None` if it already retired.
    #[must_use]
    pub fn commands(&self, task: TaskId) -> Option<usize> {
        self.task(task).map(|t| t.commands)
    }

    /// Add a range to free once `task` retires.
    ///
    /// Retirement waits for every older task, so no reader that could still
    /// reach the range is left when it is handed out again.
    pub fn add_reclaim(&mut self, task: TaskId, address: u64, size: u64) {
        if let Some(task) = self.task_mut(task) {
            debug_assert!(task.is_active, "passive tasks own no space");
            task.reclaim.push((address, size));
        }
    }

    /// Record that `task` changed `address` from `head` to `tail`.
    ///
    /// A second record by the same task at the same address replaces the
    /// first. Address 0 is the null pointer and is never tracked.
    pub fn record(
        &mut self,
        task: TaskId,
        address: u64,
        head: Option<Version<K>>,
        tail: Option<Version<K>>,
    ) {
        if address == 0 {
            return;
        }

        let memo = Memo { head, tail };
        let chain = self.chains.entry(address).or_insert_with(|| Chain {
            ids: Vec::new(),
            memos: Vec::new(),
        });

        if chain.ids.last() == Some(&task) {
            if let Some(last) = chain.memos.last_mut() {
                *last = memo;
                return;
            }
        }

        chain.ids.push(task);
        chain.memos.push(memo);
        if let Some(task) = self.task_mut(task) {
            task.addresses.push(address);
        }
    }

    /// What `address` holds as seen by `task`, or `None` to read the file.
    ///
    /// `depend` is the address of the node that holds `address`. Only memos
    /// recorded while the version of `depend` visible to `task` existed count:
    /// older ones predate that node, and ones at or after its next version
    /// belong to whatever reused its space.
    #[must_use]
    pub fn resolve(&self, task: TaskId, address: u64, depend: u64) -> Option<&Version<K>> {
        let chain = self.chains.get(&address)?;
        let (barrier, horizon) = self.window(task, depend);
        let index = chain.ids.partition_point(|&id| id <= task);

        if index > 0 && chain.ids[index - 1] >= barrier {
            return chain.memos[index - 1].tail.as_ref();
        }
        if index < chain.ids.len() && chain.ids[index] >= barrier && chain.ids[index] < horizon {
            return chain.memos[index].head.as_ref();
        }
        None
    }

    /// Resolve a pointer slot.
    #[must_use]
    pub fn resolve_pointer(&self, task: TaskId, address: u64, depend: u64) -> Option<u64> {
        match self.resolve(task, address, depend)? {
            Version::Pointer(pointer) => Some(*pointer),
            Version::Node(_) => None,
        }
    }

    /// Resolve a node address to a shared, read-only snapshot.
    #[must_use]
    pub fn resolve_node(
        &self,
        task: TaskId,
        address: u64,
        depend: u64,
    ) -> Option<Arc<IndexNode<K>>> {
        match self.resolve(task, address, depend)? {
            #[allow(clippy::disallowed_methods)] // Arc::clone shares the snapshot
            Version::Node(node) => Some(Arc::clone(node)),
            Version::Pointer(_) => None,
        }
    }

    /// Resolve a node address to a private copy the caller may mutate.
    #[must_use]
    pub fn materialize_node(&self, task: TaskId, address: u64, depend: u64) -> Option<IndexNode<K>>
    where
        K: Clone,
    {
        match self.resolve(task, address, depend)? {
            Version::Node(node) => Some(IndexNode::clone(node)),
            Version::Pointer(_) => None,
        }
    }

    /// Whether a write to `address` queued by `task` has been superseded.
    ///
    /// True when a newer task recorded a memo there, or when the newest memo
    /// says the address no longer holds anything.
    #[must_use]
    pub fn is_stale(&self, task: TaskId, address: u64) -> bool {
        let Some(chain) = self.chains.get(&address) else {
            return false;
        };
        match (chain.ids.last(), chain.memos.last()) {
            (Some(&newest), Some(memo)) => newest > task || memo.tail.is_none(),
            _ => false,
        }
    }

    /// Mark one command of `task` finished.
    ///
    /// When that was its last command the queue is pruned, and the ranges of
    /// every retired task are returned for the allocator.
    #[must_use]
    pub fn command_done(&mut self, task: TaskId) -> Vec<Reclaim> {
        let Some(entry) = self.task_mut(task) else {
            return Vec::new();
        };
        entry.commands = entry.commands.saturating_sub(1);
        if entry.commands == 0 {
            self.prune()
        } else {
            Vec::new()
        }
    }

    /// Retire finished tasks from the front of the queue.
    ///
    /// Stops at the first task with outstanding commands, even if younger
    /// tasks have finished. A retired active task keeps its memos and space
    /// until every task that overlapped it has retired too, since a younger
    /// reader may have read a node from the file before this task's writes
    /// landed. Its memos are the oldest of their chains by then.
    #[must_use]
    pub fn prune(&mut self) -> Vec<Reclaim> {
        while self.queue.front().is_some_and(|task| task.commands == 0) {
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            if task.is_active {
                self.retired.push_back(Retired {
                    id: task.id,
                    watermark: self.next_id,
                    addresses: task.addresses,
                    reclaim: task.reclaim,
                });
            }
        }

        let oldest = self.queue.front().map_or(TaskId::MAX, |task| task.id);
        let mut reclaimed = Vec::new();
        while self.retired.front().is_some_and(|task| task.watermark <= oldest) {
            let Some(task) = self.retired.pop_front() else {
                break;
            };
            reclaimed.extend(task.reclaim);

            for address in task.addresses {
                let Some(chain) = self.chains.get_mut(&address) else {
                    continue;
                };
                debug_assert_eq!(chain.ids.first(), Some(&task.id), "memo chain out of order");
                chain.ids.remove(0);
                chain.memos.remove(0);
                if chain.ids.is_empty() {
                    self.chains.remove(&address);
                }
            }
        }

        if self.queue.is_empty() {
            self.next_id = 0;
            self.idle.notify_waiters();
        }
        reclaimed
    }

    /// Drop a task that failed before queueing any command.
    ///
    /// Its memos are the newest of their chains because mutations run one at a
    /// time, so removing them restores what the address showed before. Its
    /// reclaim ranges are forgotten. Call [`prune`](Self::prune) afterwards to
    /// retire whatever the removal unblocked.
    pub fn abandon(&mut self, task: TaskId) {
        let Ok(index) = self.queue.binary_search_by_key(&task, |t| t.id) else {
            return;
        };
        let Some(entry) = self.queue.remove(index) else {
            return;
        };
        debug_assert_eq!(entry.commands, 0, "abandoned task has queued commands");

        for address in entry.addresses {
            let Some(chain) = self.chains.get_mut(&address) else {
                continue;
            };
            if chain.ids.last() == Some(&task) {
                chain.ids.pop();
                chain.memos.pop();
            }
            if chain.ids.is_empty() {
                self.chains.remove(&address);
            }
        }
    }

    /// Whether no task is pending.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Number of addresses with at least one memo.
    #[must_use]
    pub fn tracked_addresses(&self) -> usize {
        self.chains.len()
    }

    /// Signal fired whenever the queue drains.
    #[must_use]
    pub fn idle_signal(&self) -> Arc<Notify> {
        #[allow(clippy::disallowed_methods)] // Arc::clone shares the signal
        Arc::clone(&self.idle)
    }

    /// Task range in which `depend`'s version visible to `task` was current.
    ///
    /// The lower bound is the newest id of `depend`'s chain not after `task`;
    /// the upper bound is the first id after `task`.
    fn window(&self, task: TaskId, depend: u64) -> (TaskId, TaskId) {
        let Some(chain) = self.chains.get(&depend) else {
            return (0, TaskId::MAX);
        };
        let index = chain.ids.partition_point(|&id| id <= task);
        if index > 0 {
            let horizon = chain.ids.get(index).copied().unwrap_or(TaskId::MAX);
            (chain.ids[index - 1], horizon)
        } else {
            (0, chain.ids.first().copied().unwrap_or(TaskId::MAX))
        }
    }

    fn task(&self, id: TaskId) -> Option<&Task> {
        let index = self.queue.binary_search_by_key(&id, |t| t.id).ok()?;
        self.queue.get(index)
    }

    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        let index = self.queue.binary_search_by_key(&id, |t| t.id).ok()?;
        self.queue.get_mut(index)
    }
}

/// Suspend until `is_idle` holds.
///
/// `signal` must be the tracker's [`idle_signal`](VersionTracker::idle_signal).
/// The waiter registers before checking, so a drain between the check and the
/// await is not missed.
pub async fn wait_until_idle(signal: &Notify, is_idle: impl Fn() -> bool + Send) {
    loop {
        let mut notified = pin!(signal.notified());
        notified.as_mut().enable();
        if is_idle() {
            return;
        }
        notified.await;
    }
}
