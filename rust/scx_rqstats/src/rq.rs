// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Run-queue depth average
//!
//! A single system-wide average of the number of runnable tasks, kept in
//! tenths (37 reads as 3.7). A periodic caller feeds `tick()` with the
//! instantaneous count. Every `poll_interval` the count is folded into the
//! average, weighted by how long it has been since the previous fold.
//! Readers drain the average with `read_and_reset_run_queue_average()`.
//!
//! The same tick drives the deferred timer: once `deferred_timer_interval`
//! has passed, the time elapsed since the deferred window was last (re)armed
//! is published and every thread blocked in `wait_deferred_timer_change()` is
//! woken.

use crate::misc::lock;
use log::trace;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// One jiffy at HZ=100.
pub const DEFAULT_RQ_POLL_MS: u32 = 10;
/// Five jiffies at HZ=100.
pub const DEFAULT_DEF_TIMER_MS: u32 = 50;

#[derive(Debug)]
struct RqInfo {
    rq_avg: u32,
    rq_poll_ms: u32,
    def_timer_ms: u32,
    rq_poll_total: Duration,
    rq_poll_last: Instant,
    def_timer_last: Instant,
}

pub struct RunQueueSampler {
    rq: Mutex<RqInfo>,
    epoch: Instant,
    def_start_ns: AtomicU64,
    def_interval_ms: AtomicU32,
    def_gen: Mutex<u64>,
    def_changed: Condvar,
}

impl RunQueueSampler {
    pub fn new(rq_poll_ms: u32, def_timer_ms: u32) -> Self {
        Self::new_at(rq_poll_ms, def_timer_ms, Instant::now())
    }

    pub fn new_at(rq_poll_ms: u32, def_timer_ms: u32, now: Instant) -> Self {
        Self {
            rq: Mutex::new(RqInfo {
                rq_avg: 0,
                rq_poll_ms,
                def_timer_ms,
                rq_poll_total: Duration::ZERO,
                rq_poll_last: now,
                def_timer_last: now,
            }),
            epoch: now,
            def_start_ns: AtomicU64::new(0),
            def_interval_ms: AtomicU32::new(0),
            def_gen: Mutex::new(0),
            def_changed: Condvar::new(),
        }
    }

    pub fn poll_interval_ms(&self) -> u32 {
        lock(&self.rq).rq_poll_ms
    }

    pub fn set_poll_interval_ms(&self, ms: u32) {
        lock(&self.rq).rq_poll_ms = ms;
    }

    /// Configured deferred timer interval, as opposed to the elapsed time
    /// reported by `deferred_timer_elapsed_ms()`.
    pub fn deferred_timer_interval_ms(&self) -> u32 {
        lock(&self.rq).def_timer_ms
    }

    pub fn set_deferred_timer_ms(&self, ms: u32) {
        self.set_deferred_timer_ms_at(ms, Instant::now());
    }

    /// Set the deferred timer interval and restart its measurement window.
    pub fn set_deferred_timer_ms_at(&self, ms: u32, now: Instant) {
        lock(&self.rq).def_timer_ms = ms;
        let start = now.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.def_start_ns.store(start, Ordering::Release);
    }

    /// Return the run-queue average in tenths and clear it.
    pub fn read_and_reset_run_queue_average(&self) -> u32 {
        let mut rq = lock(&self.rq);
        let val = rq.rq_avg;
        rq.rq_avg = 0;
        rq.rq_poll_total = Duration::ZERO;
        val
    }

    /// Milliseconds between the start of the deferred window and the last
    /// time the deferred timer fired.
    pub fn deferred_timer_elapsed_ms(&self) -> u32 {
        self.def_interval_ms.load(Ordering::Acquire)
    }

    /// Number of times the deferred readout has been recomputed.
    pub fn deferred_timer_generation(&self) -> u64 {
        *lock(&self.def_gen)
    }

    pub fn fire_deferred_timer(&self) {
        self.fire_deferred_timer_at(Instant::now());
    }

    /// Recompute the deferred readout and wake all waiters.
    pub fn fire_deferred_timer_at(&self, now: Instant) {
        let start = self.epoch + Duration::from_nanos(self.def_start_ns.load(Ordering::Acquire));
        let elapsed = now.saturating_duration_since(start).as_millis();
        self.def_interval_ms
            .store(elapsed.min(u32::MAX as u128) as u32, Ordering::Release);

        let mut gen = lock(&self.def_gen);
        *gen += 1;
        self.def_changed.notify_all();
    }

    /// Block until the deferred readout is recomputed after generation
    /// `seen` or until `timeout` passes. A recompute that happened before the
    /// call is not missed. Returns the generation observed on wakeup.
    pub fn wait_deferred_timer_change(&self, seen: u64, timeout: Duration) -> u64 {
        let gen = lock(&self.def_gen);
        let (gen, _) = self
            .def_changed
            .wait_timeout_while(gen, timeout, |gen| *gen == seen)
            .unwrap_or_else(|e| e.into_inner());
        *gen
    }

    pub fn tick(&self, nr_running: u32) {
        self.tick_at(nr_running, Instant::now());
    }

    /// Fold `nr_running` into the average if the poll interval has passed
    /// and fire the deferred timer if its interval has passed.
    pub fn tick_at(&self, nr_running: u32, now: Instant) {
        let fire_def = {
            let mut rq = lock(&self.rq);

            let gap = now.saturating_duration_since(rq.rq_poll_last);
            if gap >= Duration::from_millis(rq.rq_poll_ms as u64) {
                rq.rq_poll_last = now;
                rq.rq_poll_total += gap;

                let total = rq.rq_poll_total.as_micros();
                if total > 0 {
                    let gap = gap.as_micros();
                    let sample = nr_running as u128 * 10;
                    let avg = (sample * gap + rq.rq_avg as u128 * (total - gap)) / total;
                    rq.rq_avg = avg.min(u32::MAX as u128) as u32;
                }
                trace!("rq_avg={} nr_running={}", rq.rq_avg, nr_running);
            }

            let def_gap = now.saturating_duration_since(rq.def_timer_last);
            if def_gap >= Duration::from_millis(rq.def_timer_ms as u64) {
                rq.def_timer_last = now;
                true
            } else {
                false
            }
        };

        if fire_def {
            self.fire_deferred_timer_at(now);
        }
    }
}

impl Default for RunQueueSampler {
    fn default() -> Self {
        Self::new(DEFAULT_RQ_POLL_MS, DEFAULT_DEF_TIMER_MS)
    }
}
