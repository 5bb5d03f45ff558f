// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Frequency-normalized per-CPU load
//!
//! Every possible CPU owns a `CpuLoad` record behind its own mutex. Whenever
//! the record is sampled, the idle / iowait / wall deltas since the previous
//! sample are turned into a busy percentage, scaled by the ratio between the
//! frequency the CPU ran at and the maximum frequency of its domain, and
//! merged into a time-weighted average covering the current window:
//!
//! ```text
//! busy     = 100 * (wall - idle) / wall
//! load     = busy * freq / policy_max
//! avg      = (avg * window + load * wall) / (window + wall)
//! window  += wall
//! ```
//!
//! A CPU at 50% busy while clocked at half its maximum thus reports 25, the
//! load it would show at full speed. Readers drain the average with
//! `CpuLoadGuard::take()`, which zeroes the window.
//!
//! The only way to reach a record is through `CpuLoadTracker::lock_cpu()`,
//! so an update can never run without the CPU's lock held. Callers must never
//! hold two CPUs' guards at the same time.

use crate::misc::lock;
use crate::time_source::CpuTimes;
use crate::time_source::TimeSource;
use crate::topology::CpuFreqTopology;
use crate::Cpumask;
use anyhow::anyhow;
use anyhow::Result;
use log::debug;
use log::trace;
use log::warn;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuLoad {
    pub prev_idle_us: u64,
    pub prev_wall_us: u64,
    pub prev_iowait_us: u64,
    pub avg_load_maxfreq: u64,
    pub window_size: u64,
    pub cur_freq: u64,
}

impl CpuLoad {
    /// Fold the counters in `now` into the weighted average, assuming the
    /// elapsed interval ran at `freq`. Returns false if the sample was
    /// discarded. The previous counters advance either way.
    pub fn update_average_load(&mut self, now: CpuTimes, freq: u64, policy_max: u64) -> bool {
        let wall_time = now.wall_us.saturating_sub(self.prev_wall_us);
        self.prev_wall_us = now.wall_us;

        let mut idle_time = now.idle_us.saturating_sub(self.prev_idle_us);
        self.prev_idle_us = now.idle_us;

        let iowait_time = now.iowait_us.saturating_sub(self.prev_iowait_us);
        self.prev_iowait_us = now.iowait_us;

        if idle_time >= iowait_time {
            idle_time -= iowait_time;
        }

        if wall_time == 0 || wall_time < idle_time {
            return false;
        }

        let cur_load = 100 * (wall_time - idle_time) / wall_time;

        // Scale to what the load would be at the domain's top frequency.
        let load_at_max_freq = match policy_max {
            0 => 0,
            max => cur_load * freq / max,
        };

        // A zero average doubles as "no sample in this window yet", so an
        // idle sample restarts the window.
        if self.avg_load_maxfreq == 0 {
            self.avg_load_maxfreq = load_at_max_freq;
            self.window_size = wall_time;
        } else {
            let weighted = self.avg_load_maxfreq as u128 * self.window_size as u128
                + load_at_max_freq as u128 * wall_time as u128;
            let total = self.window_size as u128 + wall_time as u128;
            self.avg_load_maxfreq = (weighted / total) as u64;
            self.window_size += wall_time;
        }

        true
    }
}

/// Per-CPU values fixed at initialization.
#[derive(Debug)]
struct CpuLoadDesc {
    policy_max: u64,
    related_cpus: Cpumask,
}

pub struct CpuLoadTracker {
    time_source: Arc<dyn TimeSource>,
    descs: Vec<CpuLoadDesc>,
    loads: Vec<Mutex<CpuLoad>>,
}

impl CpuLoadTracker {
    /// Create a record for every possible CPU in `top`, offline ones
    /// included. Records are never reallocated afterwards.
    pub fn new(top: &CpuFreqTopology, time_source: Arc<dyn TimeSource>) -> Result<Self> {
        let mut descs = Vec::with_capacity(top.nr_cpu_ids());
        let mut loads = Vec::with_capacity(top.nr_cpu_ids());

        for cpu in 0..top.nr_cpu_ids() {
            let dom = top
                .cpu_domain(cpu)
                .ok_or_else(|| anyhow!("CPU {} has no frequency domain", cpu))?;
            descs.push(CpuLoadDesc {
                policy_max: dom.max_freq(),
                related_cpus: dom.span().clone(),
            });
            loads.push(Mutex::new(CpuLoad {
                cur_freq: dom.cur_freq(),
                ..Default::default()
            }));
        }

        Ok(Self {
            time_source,
            descs,
            loads,
        })
    }

    pub fn nr_cpu_ids(&self) -> usize {
        self.loads.len()
    }

    /// Maximum frequency of `cpu`'s domain.
    pub fn policy_max(&self, cpu: usize) -> Option<u64> {
        self.descs.get(cpu).map(|d| d.policy_max)
    }

    /// CPUs sharing `cpu`'s frequency domain, `cpu` included.
    pub fn related_cpus(&self, cpu: usize) -> Option<&Cpumask> {
        self.descs.get(cpu).map(|d| &d.related_cpus)
    }

    /// Lock `cpu`'s record.
    pub fn lock_cpu(&self, cpu: usize) -> Result<CpuLoadGuard<'_>> {
        let load = self
            .loads
            .get(cpu)
            .ok_or_else(|| anyhow!("Invalid CPU {} passed, max {}", cpu, self.loads.len()))?;

        Ok(CpuLoadGuard {
            tracker: self,
            cpu,
            load: lock(load),
        })
    }

    /// Copy of `cpu`'s record, taken under its lock.
    pub fn snapshot(&self, cpu: usize) -> Option<CpuLoad> {
        self.loads.get(cpu).map(|l| lock(l).clone())
    }

    /// Sum the normalized load of every CPU in `online` and restart their
    /// windows. CPUs are visited one at a time, so the total is a composite
    /// of slightly different instants rather than a single snapshot.
    pub fn read_and_reset(&self, online: &Cpumask) -> u64 {
        let mut total_load = 0;

        for cpu in online.iter() {
            let mut pcpu = match self.lock_cpu(cpu) {
                Ok(pcpu) => pcpu,
                Err(e) => {
                    warn!("Skipping online CPU {}: {}", cpu, e);
                    continue;
                }
            };
            let freq = pcpu.cur_freq;
            pcpu.update(freq);
            total_load += pcpu.take();
        }

        total_load
    }
}

/// A locked per-CPU record.
pub struct CpuLoadGuard<'a> {
    tracker: &'a CpuLoadTracker,
    cpu: usize,
    load: MutexGuard<'a, CpuLoad>,
}

impl CpuLoadGuard<'_> {
    /// Sample the time source and fold the elapsed interval, which ran at
    /// `freq`, into the weighted average.
    pub fn update(&mut self, freq: u64) -> bool {
        let now = match self.tracker.time_source.cpu_times(self.cpu) {
            Ok(now) => now,
            // Offline CPUs may have no counters at all.
            Err(e) => {
                debug!("No times for CPU {}: {}", self.cpu, e);
                return false;
            }
        };

        let policy_max = self.tracker.descs[self.cpu].policy_max;
        let applied = self.load.update_average_load(now, freq, policy_max);
        if !applied {
            trace!("CPU {} discarded degenerate sample {:?}", self.cpu, now);
        }
        applied
    }

    /// Return the accumulated average and empty the window.
    pub fn take(&mut self) -> u64 {
        let load = self.load.avg_load_maxfreq;
        self.load.avg_load_maxfreq = 0;
        self.load.window_size = 0;
        load
    }

    /// Drop the accumulated average, keeping the previous counters.
    pub fn reset_average(&mut self) {
        self.load.avg_load_maxfreq = 0;
    }

    pub fn set_cur_freq(&mut self, freq: u64) {
        self.load.cur_freq = freq;
    }
}

impl Deref for CpuLoadGuard<'_> {
    type Target = CpuLoad;

    fn deref(&self) -> &CpuLoad {
        &self.load
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_source::testing::FakeTimeSource;

    fn times(idle: u64, iowait: u64, wall: u64) -> CpuTimes {
        CpuTimes {
            idle_us: idle,
            iowait_us: iowait,
            wall_us: wall,
        }
    }

    fn tracker(nr_cpus: usize) -> (Arc<FakeTimeSource>, CpuLoadTracker) {
        let cpus: Vec<usize> = (0..nr_cpus).collect();
        let top = CpuFreqTopology::from_domains(nr_cpus, &[(cpus.clone(), 2000, 1000)], &cpus)
            .unwrap();
        let ts = Arc::new(FakeTimeSource::new(nr_cpus));
        let tracker = CpuLoadTracker::new(&top, ts.clone()).unwrap();
        (ts, tracker)
    }

    #[test]
    fn first_sample_at_half_frequency() {
        let mut load = CpuLoad::default();
        assert!(load.update_average_load(times(50, 0, 100), 1000, 2000));
        assert_eq!(load.avg_load_maxfreq, 25);
        assert_eq!(load.window_size, 100);
    }

    #[test]
    fn previous_counters_follow_the_source() {
        let mut load = CpuLoad::default();
        let samples = [times(10, 2, 100), times(10, 2, 100), times(70, 5, 400)];
        for now in samples {
            load.update_average_load(now, 1000, 1000);
            assert_eq!(load.prev_idle_us, now.idle_us);
            assert_eq!(load.prev_iowait_us, now.iowait_us);
            assert_eq!(load.prev_wall_us, now.wall_us);
        }
    }

    #[test]
    fn weighted_average_of_two_samples() {
        let mut load = CpuLoad::default();
        // 80% busy over 100us, then 20% busy over 300us, both at max.
        load.update_average_load(times(20, 0, 100), 1000, 1000);
        load.update_average_load(times(260, 0, 400), 1000, 1000);
        assert_eq!(load.avg_load_maxfreq, (80 * 100 + 20 * 300) / 400);
        assert_eq!(load.window_size, 400);
    }

    #[test]
    fn iowait_is_not_idle() {
        let mut load = CpuLoad::default();
        // 60us idle of which 40us were iowait -> only 20us truly idle.
        load.update_average_load(times(60, 40, 100), 1000, 1000);
        assert_eq!(load.avg_load_maxfreq, 80);
    }

    #[test]
    fn iowait_larger_than_idle_leaves_idle_alone() {
        let mut load = CpuLoad::default();
        load.update_average_load(times(30, 50, 100), 1000, 1000);
        assert_eq!(load.avg_load_maxfreq, 70);
    }

    #[test]
    fn degenerate_samples_are_discarded() {
        let mut load = CpuLoad::default();
        load.update_average_load(times(50, 0, 100), 1000, 1000);
        let before = (load.avg_load_maxfreq, load.window_size);

        // No wall time elapsed.
        assert!(!load.update_average_load(times(50, 0, 100), 1000, 1000));
        assert_eq!((load.avg_load_maxfreq, load.window_size), before);

        // More idle than wall time.
        assert!(!load.update_average_load(times(300, 0, 200), 1000, 1000));
        assert_eq!((load.avg_load_maxfreq, load.window_size), before);
        assert_eq!(load.prev_idle_us, 300);
    }

    #[test]
    fn counter_going_backwards_is_zero_delta() {
        let mut load = CpuLoad::default();
        load.update_average_load(times(50, 0, 1000), 1000, 1000);
        assert!(!load.update_average_load(times(10, 0, 500), 1000, 1000));
        assert_eq!(load.prev_wall_us, 500);
    }

    #[test]
    fn idle_sample_restarts_window() {
        let mut load = CpuLoad::default();
        load.update_average_load(times(100, 0, 100), 1000, 1000);
        assert_eq!(load.avg_load_maxfreq, 0);
        load.update_average_load(times(100, 0, 200), 1000, 1000);
        assert_eq!(load.avg_load_maxfreq, 100);
        assert_eq!(load.window_size, 100);
    }

    #[test]
    fn unknown_policy_max_reads_zero() {
        let mut load = CpuLoad::default();
        assert!(load.update_average_load(times(0, 0, 100), 1000, 0));
        assert_eq!(load.avg_load_maxfreq, 0);
    }

    #[test]
    fn aggregate_drains_online_cpus() {
        let (ts, tracker) = tracker(4);
        ts.advance(0, 50, 0, 100);
        ts.advance(1, 0, 0, 100);
        ts.advance(2, 100, 0, 100);
        ts.advance(3, 0, 0, 100);

        let mut online = Cpumask::new(4);
        for cpu in 0..3 {
            online.set_cpu(cpu).unwrap();
        }

        // Running at 1000 of 2000: 25 + 50 + 0.
        assert_eq!(tracker.read_and_reset(&online), 75);
        for cpu in 0..3 {
            let load = tracker.snapshot(cpu).unwrap();
            assert_eq!(load.avg_load_maxfreq, 0);
            assert_eq!(load.window_size, 0);
        }
        // The offline CPU was never sampled.
        assert_eq!(tracker.snapshot(3).unwrap().prev_wall_us, 0);

        assert_eq!(tracker.read_and_reset(&online), 0);
    }

    #[test]
    fn guard_update_uses_domain_max() {
        let (ts, tracker) = tracker(2);
        ts.advance(1, 0, 0, 1000);
        let mut pcpu = tracker.lock_cpu(1).unwrap();
        assert!(pcpu.update(2000));
        assert_eq!(pcpu.avg_load_maxfreq, 100);
        pcpu.reset_average();
        assert_eq!(pcpu.avg_load_maxfreq, 0);
        assert_eq!(pcpu.window_size, 1000);
        drop(pcpu);

        assert!(tracker.lock_cpu(2).is_err());
        assert_eq!(tracker.related_cpus(0).unwrap().weight(), 2);
        assert_eq!(tracker.policy_max(1), Some(2000));
    }
}
