// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Result;

/// Cumulative per-CPU time counters, in microseconds since boot.
///
/// `idle_us` includes time spent waiting for I/O. `iowait_us` is that subset
/// on its own, so the load tracker can tell "nothing to run" apart from
/// "blocked on a device".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle_us: u64,
    pub iowait_us: u64,
    pub wall_us: u64,
}

/// Source of raw per-CPU accounting counters.
///
/// Every counter must be monotonically non-decreasing for a given CPU. A
/// counter that goes backwards is read as a zero delta by the load tracker.
pub trait TimeSource: Send + Sync {
    fn cpu_times(&self, cpu: usize) -> Result<CpuTimes>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::misc::lock;
    use anyhow::anyhow;
    use std::sync::Mutex;

    /// Hand-driven counters for unit tests.
    pub struct FakeTimeSource {
        times: Mutex<Vec<CpuTimes>>,
    }

    impl FakeTimeSource {
        pub fn new(nr_cpus: usize) -> Self {
            Self {
                times: Mutex::new(vec![CpuTimes::default(); nr_cpus]),
            }
        }

        /// Advance `cpu` by the given deltas.
        pub fn advance(&self, cpu: usize, idle: u64, iowait: u64, wall: u64) {
            let mut times = lock(&self.times);
            let t = &mut times[cpu];
            t.idle_us += idle;
            t.iowait_us += iowait;
            t.wall_us += wall;
        }

        pub fn set(&self, cpu: usize, times: CpuTimes) {
            lock(&self.times)[cpu] = times;
        }
    }

    impl TimeSource for FakeTimeSource {
        fn cpu_times(&self, cpu: usize) -> Result<CpuTimes> {
            lock(&self.times)
                .get(cpu)
                .copied()
                .ok_or_else(|| anyhow!("no counters for CPU {}", cpu))
        }
    }
}
