// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::load::CpuLoadTracker;
use crate::misc::read_from_file;
use crate::topology::CpuFreqTopology;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HotplugState {
    Online,
    Offline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HotplugEvent {
    pub cpu: usize,
    pub state: HotplugState,
}

/// Tracks which CPUs are online and clears stale load when one comes back.
///
/// Only the accumulated average is dropped on online. The previous counters
/// are kept, so the first sample after a long offline period covers the whole
/// gap.
pub struct HotplugReactor {
    tracker: Arc<CpuLoadTracker>,
    online: RwLock<Cpumask>,
}

impl HotplugReactor {
    pub fn new(top: &CpuFreqTopology, tracker: Arc<CpuLoadTracker>) -> Self {
        Self {
            tracker,
            online: RwLock::new(top.online().clone()),
        }
    }

    /// Copy of the current online set.
    pub fn online_cpus(&self) -> Cpumask {
        self.online
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn on_cpu_online(&self, cpu: usize) -> Result<()> {
        {
            let mut pcpu = self.tracker.lock_cpu(cpu)?;
            pcpu.reset_average();
        }
        self.online
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_cpu(cpu)?;
        debug!("CPU {} online", cpu);
        Ok(())
    }

    /// Nothing is done to the load record of a CPU going offline. It simply
    /// stops being aggregated.
    pub fn on_cpu_offline(&self, cpu: usize) -> Result<()> {
        self.online
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear_cpu(cpu)?;
        debug!("CPU {} offline", cpu);
        Ok(())
    }

    pub fn on_hotplug(&self, event: &HotplugEvent) -> Result<()> {
        match event.state {
            HotplugState::Online => self.on_cpu_online(event.cpu),
            HotplugState::Offline => self.on_cpu_offline(event.cpu),
        }
    }
}

/// Platform hot-plug operations. `cpu_up`/`cpu_down` may block for tens of
/// milliseconds.
pub trait CpuHotplug: Send + Sync {
    fn is_online(&self, cpu: usize) -> bool;
    fn cpu_up(&self, cpu: usize) -> Result<()>;
    fn cpu_down(&self, cpu: usize) -> Result<()>;
}

/// Hot-plug through `/sys/devices/system/cpu/cpuN/online`.
pub struct SysfsCpuHotplug {
    cpu_root: PathBuf,
}

impl SysfsCpuHotplug {
    pub fn new() -> Self {
        Self::with_root(Path::new("/"))
    }

    pub fn with_root(root: &Path) -> Self {
        Self {
            cpu_root: root.join("sys/devices/system/cpu"),
        }
    }

    fn online_path(&self, cpu: usize) -> PathBuf {
        self.cpu_root.join(format!("cpu{cpu}")).join("online")
    }

    fn write_online(&self, cpu: usize, val: u32) -> Result<()> {
        let path = self.online_path(cpu);
        if !path.exists() {
            bail!("CPU {} cannot be hot-plugged ({:?} missing)", cpu, path);
        }
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        write!(file, "{val}").with_context(|| format!("Failed to write {} to {:?}", val, path))?;
        Ok(())
    }
}

impl Default for SysfsCpuHotplug {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuHotplug for SysfsCpuHotplug {
    fn is_online(&self, cpu: usize) -> bool {
        // CPUs without an online knob (usually the boot CPU) are always up.
        let path = self.online_path(cpu);
        if !path.exists() {
            return self.cpu_root.join(format!("cpu{cpu}")).exists();
        }
        read_from_file::<u32>(&path).map(|v| v != 0).unwrap_or(false)
    }

    fn cpu_up(&self, cpu: usize) -> Result<()> {
        self.write_online(cpu, 1)
    }

    fn cpu_down(&self, cpu: usize) -> Result<()> {
        self.write_online(cpu, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_source::testing::FakeTimeSource;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (Arc<FakeTimeSource>, Arc<CpuLoadTracker>, HotplugReactor) {
        let top =
            CpuFreqTopology::from_domains(2, &[(vec![0, 1], 1000, 1000)], &[0]).unwrap();
        let ts = Arc::new(FakeTimeSource::new(2));
        let tracker = Arc::new(CpuLoadTracker::new(&top, ts.clone()).unwrap());
        let reactor = HotplugReactor::new(&top, tracker.clone());
        (ts, tracker, reactor)
    }

    #[test]
    fn online_clears_average_but_not_counters() {
        let (ts, tracker, reactor) = setup();
        ts.advance(1, 0, 0, 100);
        tracker.lock_cpu(1).unwrap().update(1000);
        assert_eq!(tracker.snapshot(1).unwrap().avg_load_maxfreq, 100);

        reactor.on_cpu_online(1).unwrap();
        let load = tracker.snapshot(1).unwrap();
        assert_eq!(load.avg_load_maxfreq, 0);
        assert_eq!(load.prev_wall_us, 100);
        assert!(reactor.online_cpus().test_cpu(1));
    }

    #[test]
    fn offline_only_updates_mask() {
        let (ts, tracker, reactor) = setup();
        ts.advance(0, 0, 0, 100);
        tracker.lock_cpu(0).unwrap().update(1000);

        reactor
            .on_hotplug(&HotplugEvent {
                cpu: 0,
                state: HotplugState::Offline,
            })
            .unwrap();
        assert!(reactor.online_cpus().is_empty());
        assert_eq!(tracker.snapshot(0).unwrap().avg_load_maxfreq, 100);
        assert!(reactor.on_cpu_online(5).is_err());
    }

    #[test]
    fn sysfs_hotplug_writes_online_knob() {
        let tmp = TempDir::new().unwrap();
        let cpu1 = tmp.path().join("sys/devices/system/cpu/cpu1");
        fs::create_dir_all(&cpu1).unwrap();
        fs::create_dir_all(tmp.path().join("sys/devices/system/cpu/cpu0")).unwrap();
        fs::write(cpu1.join("online"), "0\n").unwrap();

        let hp = SysfsCpuHotplug::with_root(tmp.path());
        assert!(hp.is_online(0));
        assert!(!hp.is_online(1));
        assert!(!hp.is_online(7));

        hp.cpu_up(1).unwrap();
        assert!(hp.is_online(1));
        hp.cpu_down(1).unwrap();
        assert!(!hp.is_online(1));
        assert!(hp.cpu_up(0).is_err());
    }
}
