// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Dual-core boost
//!
//! While boost is locked the secondary CPU is kept online. If the controller
//! had to bring the CPU up itself it remembers that (`forced`) and takes the
//! CPU back down when boost is released. A CPU that was already online is
//! left alone on release.
//!
//! In deferred mode the online request runs on a worker thread and
//! `enable_boost()` returns right away. `disable_boost()` waits for that
//! worker before deciding whether the CPU has to go down again.

use crate::hotplug::CpuHotplug;
use crate::misc::lock;
use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

#[derive(Debug, Default)]
struct BoostState {
    locked: bool,
    pending: Option<JoinHandle<()>>,
}

pub struct DualBoostController {
    hotplug: Arc<dyn CpuHotplug>,
    secondary_cpu: usize,
    deferred: bool,
    state: Mutex<BoostState>,
    forced: Arc<AtomicBool>,
}

/// Bring `cpu` online if needed. Returns whether it had to be brought up.
fn bring_up(hotplug: &dyn CpuHotplug, cpu: usize) -> Result<bool> {
    if hotplug.is_online(cpu) {
        return Ok(false);
    }
    hotplug
        .cpu_up(cpu)
        .with_context(|| format!("Failed to bring up boost CPU {}", cpu))?;
    info!("Boost brought CPU {} online", cpu);
    Ok(true)
}

impl DualBoostController {
    pub fn new(hotplug: Arc<dyn CpuHotplug>, secondary_cpu: usize, deferred: bool) -> Self {
        Self {
            hotplug,
            secondary_cpu,
            deferred,
            state: Mutex::new(BoostState::default()),
            forced: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn secondary_cpu(&self) -> usize {
        self.secondary_cpu
    }

    pub fn is_locked(&self) -> bool {
        lock(&self.state).locked
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    /// Lock boost on. Nothing happens if it is already locked. In synchronous
    /// mode a failed online request is returned and boost stays unlocked.
    pub fn enable_boost(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.locked {
            return Ok(());
        }

        if self.deferred {
            let hotplug = self.hotplug.clone();
            let forced = self.forced.clone();
            let cpu = self.secondary_cpu;
            let worker = thread::Builder::new()
                .name("dual-boost".into())
                .spawn(move || match bring_up(hotplug.as_ref(), cpu) {
                    Ok(true) => forced.store(true, Ordering::Release),
                    Ok(false) => {}
                    Err(e) => warn!("{:#}", e),
                })
                .context("Failed to spawn dual-boost worker")?;
            state.pending = Some(worker);
        } else if bring_up(self.hotplug.as_ref(), self.secondary_cpu)? {
            self.forced.store(true, Ordering::Release);
        }

        state.locked = true;
        Ok(())
    }

    /// Release boost. Nothing happens if it is not locked. A CPU the
    /// controller brought up is taken down. Failing to do so is logged and
    /// leaves `forced` set.
    pub fn disable_boost(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.locked {
            return Ok(());
        }

        if let Some(worker) = state.pending.take() {
            if worker.join().is_err() {
                warn!("Dual-boost worker panicked");
            }
        }

        if self.forced.load(Ordering::Acquire) {
            match self.hotplug.cpu_down(self.secondary_cpu) {
                Ok(()) => {
                    self.forced.store(false, Ordering::Release);
                    info!("Boost took CPU {} offline", self.secondary_cpu);
                }
                Err(e) => warn!(
                    "Failed to take boost CPU {} offline: {:#}",
                    self.secondary_cpu, e
                ),
            }
        }

        state.locked = false;
        Ok(())
    }
}

impl Drop for DualBoostController {
    fn drop(&mut self) {
        let worker = lock(&self.state).pending.take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}
