//! Blocking FIFO between producer and consumer threads
//!
//! A [`Queue`] keeps simple usage statistics: how long elements wait in the
//! queue, how often a consumer found it empty, and how deep it was when
//! elements were added. They are logged when the queue is dropped.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct Element<T> {
    value: T,
    arrival: Option<Instant>,
}

#[derive(Debug, Default)]
struct Counters {
    appends: u64,
    depth_total: u64,
    removes: u64,
    empty_removes: u64,
    retention_total: Duration,
    retention_count: u64,
}

struct State<T> {
    items: VecDeque<Element<T>>,
    counters: Counters,
}

/// Snapshot of a queue's usage
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueStats {
    /// Elements added with [`Queue::append`] or [`Queue::append_untimed`]
    pub appends: u64,
    /// Elements removed
    pub removes: u64,
    /// Mean time timed elements spent in the queue
    pub mean_retention: Option<Duration>,
    /// Fraction of removals that found the queue empty
    pub empty_fraction: f64,
    /// Mean number of queued elements at the moment of an append
    pub mean_depth: f64,
}

/// Named multi-producer, multi-consumer FIFO
pub struct Queue<T> {
    name: String,
    state: Mutex<State<T>>,
    available: Condvar,
}

impl<T> Queue<T> {
    /// Create an empty queue; the name is used in log output
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                items: VecDeque::new(),
                counters: Counters::default(),
            }),
            available: Condvar::new(),
        }
    }

    /// Name given at construction
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an element at the back and record when it arrived
    pub fn append(&self, value: T) {
        self.push_back(value, Some(Instant::now()));
    }

    /// Add an element at the back without tracking its retention time
    pub fn append_untimed(&self, value: T) {
        self.push_back(value, None);
    }

    fn push_back(&self, value: T, arrival: Option<Instant>) {
        let mut state = self.state.lock();
        state.counters.appends += 1;
        state.counters.depth_total += state.items.len() as u64;
        state.items.push_back(Element { value, arrival });
        self.available.notify_all();
    }

    /// Add an element at the front, ahead of everything already queued
    pub fn prepend(&self, value: T) {
        let mut state = self.state.lock();
        state.items.push_front(Element { value, arrival: None });
        self.available.notify_all();
    }

    /// Remove the front element, blocking while the queue is empty
    pub fn remove(&self) -> T {
        let mut state = self.state.lock();
        Self::note_remove(&mut state);

        loop {
            if let Some(element) = state.items.pop_front() {
                return Self::take(&mut state, element);
            }
            self.available.wait(&mut state);
        }
    }

    /// Remove the front element, giving up at `deadline`
    pub fn remove_until(&self, deadline: Instant) -> Option<T> {
        let mut state = self.state.lock();
        Self::note_remove(&mut state);

        loop {
            if let Some(element) = state.items.pop_front() {
                return Some(Self::take(&mut state, element));
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return state.items.pop_front().map(|element| Self::take(&mut state, element));
            }
        }
    }

    /// Remove everything currently queued without blocking
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let items: Vec<_> = state.items.drain(..).collect();
        state.counters.removes += items.len() as u64;
        items.into_iter().map(|element| element.value).collect()
    }

    /// Number of queued elements
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Usage statistics so far
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let counters = &state.counters;

        let ratio = |part: u64, whole: u64| {
            if whole == 0 {
                0.0
            } else {
                part as f64 / whole as f64
            }
        };

        QueueStats {
            appends: counters.appends,
            removes: counters.removes,
            mean_retention: mean_duration(counters.retention_total, counters.retention_count),
            empty_fraction: ratio(counters.empty_removes, counters.removes),
            mean_depth: ratio(counters.depth_total, counters.appends),
        }
    }

    fn note_remove(state: &mut State<T>) {
        state.counters.removes += 1;
        if state.items.is_empty() {
            state.counters.empty_removes += 1;
        }
    }

    fn take(state: &mut State<T>, element: Element<T>) -> T {
        if let Some(arrival) = element.arrival {
            state.counters.retention_total += arrival.elapsed();
            state.counters.retention_count += 1;
        }
        element.value
    }
}

fn mean_duration(total: Duration, count: u64) -> Option<Duration> {
    if count == 0 {
        return None;
    }
    let nanos = total.as_nanos() / count as u128;
    Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let stats = self.stats();
        if stats.appends == 0 && stats.removes == 0 {
            return;
        }

        log::info!(
            "queue {}: {} appends, {} removes, mean retention {:?}, {:.1}% removes on empty queue, mean depth {:.2}",
            self.name,
            stats.appends,
            stats.removes,
            stats.mean_retention.unwrap_or_default(),
            stats.empty_fraction * 100.0,
            stats.mean_depth
        );
    }
}
