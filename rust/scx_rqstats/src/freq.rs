// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::load::CpuLoadTracker;
use crate::misc::lock;
use crate::topology::CpuFreqTopology;
use anyhow::anyhow;
use anyhow::Result;
use log::debug;
use std::sync::Arc;
use std::sync::Mutex;

/// A completed frequency transition, reported by one CPU of a domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreqTransition {
    pub cpu: usize,
    pub old_freq: u64,
    pub new_freq: u64,
}

/// Applies post-change frequency transitions to the load tracker.
///
/// The interval that just ended ran at the old frequency, so each member of
/// the domain is flushed at `old_freq` before `new_freq` becomes its current
/// frequency. Both steps happen under the member's own lock. Transitions of
/// one domain are serialized so that two back-to-back events cannot
/// interleave their flushes.
pub struct FreqChangeReactor {
    tracker: Arc<CpuLoadTracker>,
    domain_locks: Vec<Mutex<()>>,
    cpu_domain: Vec<usize>,
}

impl FreqChangeReactor {
    pub fn new(top: &CpuFreqTopology, tracker: Arc<CpuLoadTracker>) -> Result<Self> {
        let mut cpu_domain = Vec::with_capacity(top.nr_cpu_ids());
        for cpu in 0..top.nr_cpu_ids() {
            let dom = top
                .cpu_domain(cpu)
                .ok_or_else(|| anyhow!("CPU {} has no frequency domain", cpu))?;
            cpu_domain.push(dom.id());
        }

        Ok(Self {
            tracker,
            domain_locks: top.domains().iter().map(|_| Mutex::new(())).collect(),
            cpu_domain,
        })
    }

    /// Handle a transition. Must only be called once the change completed.
    pub fn on_frequency_change(&self, freqs: &FreqTransition) -> Result<()> {
        let dom = *self
            .cpu_domain
            .get(freqs.cpu)
            .ok_or_else(|| anyhow!("Frequency transition for unknown CPU {}", freqs.cpu))?;
        let related = self
            .tracker
            .related_cpus(freqs.cpu)
            .ok_or_else(|| anyhow!("Frequency transition for unknown CPU {}", freqs.cpu))?;

        let _dom_guard = lock(&self.domain_locks[dom]);
        for cpu in related.iter() {
            let mut pcpu = self.tracker.lock_cpu(cpu)?;
            pcpu.update(freqs.old_freq);
            pcpu.set_cur_freq(freqs.new_freq);
        }

        debug!(
            "Domain {} (CPU {}) moved from {} to {}",
            dom, freqs.cpu, freqs.old_freq, freqs.new_freq
        );
        Ok(())
    }
}
