use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub type Factory<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// A bounded pool of lazily created resources.
///
/// Resources are built on demand up to `capacity`. `get` blocks when the
/// pool is exhausted; `put(None)` reports a broken resource and frees its
/// slot so the next `get` builds a fresh one. Idle resources past the idle
/// timeout are dropped on the way out.
pub struct ResourcePool<T> {
    factory: Factory<T>,
    capacity: usize,
    idle_timeout: Duration,
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

struct PoolState<T> {
    idle: VecDeque<Idle<T>>,
    borrowed: usize,
    closed: bool,
    wait_count: u64,
    wait_time: Duration,
}

impl<T> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("capacity", &self.capacity)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

struct Idle<T> {
    resource: T,
    since: Instant,
}

impl<T> ResourcePool<T> {
    pub fn new(factory: Factory<T>, capacity: usize, idle_timeout: Duration) -> ResourcePool<T> {
        ResourcePool {
            factory,
            capacity,
            idle_timeout,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                borrowed: 0,
                closed: false,
                wait_count: 0,
                wait_time: Duration::ZERO,
            }),
            available: Condvar::new(),
        }
    }

    /// Takes a resource, blocking until one is free. A zero timeout waits
    /// without bound.
    pub fn get(&self, timeout: Duration) -> Result<T> {
        let deadline = (timeout > Duration::ZERO).then(|| Instant::now() + timeout);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::PoolClosed);
            }
            if self.idle_timeout > Duration::ZERO {
                while state
                    .idle
                    .front()
                    .is_some_and(|idle| idle.since.elapsed() > self.idle_timeout)
                {
                    state.idle.pop_front();
                }
            }
            if let Some(idle) = state.idle.pop_front() {
                state.borrowed += 1;
                return Ok(idle.resource);
            }
            if state.borrowed + state.idle.len() < self.capacity {
                state.borrowed += 1;
                drop(state);
                return match (self.factory)() {
                    Ok(resource) => Ok(resource),
                    Err(e) => {
                        self.state.lock().borrowed -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }
            state.wait_count += 1;
            let started = Instant::now();
            let timed_out = match deadline {
                None => {
                    self.available.wait(&mut state);
                    false
                }
                Some(deadline) => self.available.wait_until(&mut state, deadline).timed_out(),
            };
            state.wait_time += started.elapsed();
            if timed_out {
                return Err(Error::PoolTimeout);
            }
        }
    }

    /// Returns a resource, or `None` to report it broken and refill the slot.
    pub fn put(&self, resource: Option<T>) {
        let mut state = self.state.lock();
        state.borrowed = state.borrowed.saturating_sub(1);
        if let Some(resource) = resource {
            if !state.closed {
                state.idle.push_back(Idle {
                    resource,
                    since: Instant::now(),
                });
            }
        }
        drop(state);
        self.available.notify_one();
    }

    /// Marks the pool closed, drops idle resources, and waits for borrowed
    /// ones to come home.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.idle.clear();
        self.available.notify_all();
        while state.borrowed > 0 {
            self.available.wait(&mut state);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_cap(&self) -> usize {
        self.capacity
    }

    /// Free slots: capacity minus resources currently out.
    pub fn available(&self) -> usize {
        self.capacity - self.state.lock().borrowed
    }

    pub fn wait_count(&self) -> u64 {
        self.state.lock().wait_count
    }

    pub fn wait_time(&self) -> Duration {
        self.state.lock().wait_time
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn stats_json(&self) -> String {
        let state = self.state.lock();
        serde_json::json!({
            "Capacity": self.capacity,
            "Available": self.capacity - state.borrowed,
            "MaxCapacity": self.capacity,
            "WaitCount": state.wait_count,
            "WaitTimeTotal": state.wait_time.as_nanos() as u64,
            "IdleTimeout": self.idle_timeout.as_nanos() as u64,
        })
        .to_string()
    }
}
