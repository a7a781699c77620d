//! Priority levels and the pending-task heap.
//!
//! Tasks are ordered by:
//! - Priority (urgent first)
//! - Creation time (older first)
//! - Insertion sequence (strict FIFO when creation times collide)

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::id::TaskId;
use crate::scheduler::task::Task;

/// Task priority. Lower value is served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

struct Entry {
    seq: u64,
    task: Task,
}

impl Entry {
    fn cmp_key(&self, other: &Entry) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then(self.task.created_at.cmp(&other.task.created_at))
            .then(self.seq.cmp(&other.seq))
    }

    fn before(&self, other: &Entry) -> bool {
        self.cmp_key(other) == Ordering::Less
    }
}

/// Binary min-heap of pending tasks.
///
/// `std::collections::BinaryHeap` has no removal by key, and cancellation
/// needs one, so the sift operations live here.
#[derive(Default)]
pub struct PriorityQueue {
    heap: Vec<Entry>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert a task. O(log n).
    pub fn push(&mut self, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { seq, task });
        let last = self.heap.len() - 1;
        self.sift_up(last);
    }

    /// Remove and return the most urgent task. O(log n).
    pub fn pop(&mut self) -> Option<Task> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let entry = self.heap.pop()?;
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(entry.task)
    }

    /// The most urgent task without removing it. O(1).
    pub fn peek(&self) -> Option<&Task> {
        self.heap.first().map(|e| &e.task)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.heap.iter().any(|e| e.task.id == id)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.heap.iter().find(|e| e.task.id == id).map(|e| &e.task)
    }

    /// Remove an arbitrary task. O(n) scan plus O(log n) repair.
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let index = self.heap.iter().position(|e| e.task.id == id)?;
        let last = self.heap.len() - 1;
        self.heap.swap(index, last);
        let entry = self.heap.pop()?;
        if index < self.heap.len() {
            // The element moved into the hole may belong above or below it
            if index > 0 && self.heap[index].before(&self.heap[(index - 1) / 2]) {
                self.sift_up(index);
            } else {
                self.sift_down(index);
            }
        }
        Some(entry.task)
    }

    /// Tasks in heap order (not sorted).
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.heap.iter().map(|e| &e.task)
    }

    /// Sorted copy of the queue, for introspection only. O(n log n).
    pub fn snapshot(&self) -> Vec<Task> {
        let mut entries: Vec<&Entry> = self.heap.iter().collect();
        entries.sort_by(|a, b| a.cmp_key(b));
        entries.into_iter().map(|e| e.task.clone()).collect()
    }

    /// Remove every task, most urgent first.
    pub fn drain(&mut self) -> Vec<Task> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(task) = self.pop() {
            out.push(task);
        }
        out
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].before(&self.heap[parent]) {
                self.heap.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.heap[left].before(&self.heap[smallest]) {
                smallest = left;
            }
            if right < len && self.heap[right].before(&self.heap[smallest]) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.heap.swap(index, smallest);
            index = smallest;
        }
    }
}
