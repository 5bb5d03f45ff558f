// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use ::fb_procfs as procfs;
use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use scx_rqstats::CpuTimes;
use scx_rqstats::TimeSource;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::PoisonError;

/// Per-CPU counters from /proc/stat.
///
/// /proc/stat is read once per `refresh()` and every `cpu_times()` call in
/// between is served from that snapshot, so one aggregation pass sees a
/// single read of the file.
pub struct ProcStatTimeSource {
    reader: procfs::ProcReader,
    snapshot: Mutex<Snapshot>,
}

#[derive(Default)]
struct Snapshot {
    cpus: BTreeMap<u32, CpuTimes>,
    running: u32,
}

fn cpu_times(stat: &procfs::CpuStat) -> Result<CpuTimes> {
    match stat {
        procfs::CpuStat {
            user_usec: Some(user),
            nice_usec: Some(nice),
            system_usec: Some(system),
            idle_usec: Some(idle),
            iowait_usec: Some(iowait),
            irq_usec: Some(irq),
            softirq_usec: Some(softirq),
            stolen_usec: Some(stolen),
            ..
        } => Ok(CpuTimes {
            idle_us: idle + iowait,
            iowait_us: *iowait,
            wall_us: user + nice + system + idle + iowait + irq + softirq + stolen,
        }),
        _ => Err(anyhow!("Missing stats in cpustat")),
    }
}

impl ProcStatTimeSource {
    pub fn new() -> Result<Self> {
        let ts = Self {
            reader: procfs::ProcReader::new(),
            snapshot: Mutex::new(Snapshot::default()),
        };
        ts.refresh()?;
        Ok(ts)
    }

    /// Re-read /proc/stat.
    pub fn refresh(&self) -> Result<()> {
        let stat = self.reader.read_stat().context("Failed to read procfs")?;
        let cpus_map = stat
            .cpus_map
            .ok_or_else(|| anyhow!("Expected cpus_map to exist"))?;

        let mut cpus = BTreeMap::new();
        for (cpu, cs) in cpus_map.iter() {
            cpus.insert(*cpu, cpu_times(cs)?);
        }

        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        snapshot.cpus = cpus;
        snapshot.running = stat.running_processes.unwrap_or(0);
        Ok(())
    }

    /// Runnable tasks at the last refresh.
    pub fn nr_running(&self) -> u32 {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running
    }
}

impl TimeSource for ProcStatTimeSource {
    fn cpu_times(&self, cpu: usize) -> Result<CpuTimes> {
        // Offline CPUs are missing from /proc/stat.
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cpus
            .get(&(cpu as u32))
            .copied()
            .ok_or_else(|| anyhow!("No /proc/stat entry for CPU {}", cpu))
    }
}
