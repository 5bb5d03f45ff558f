// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::attrs::format_tenths;
use crate::attrs::RqStatsAttr;
use crate::config::RqStatsConfig;
use crate::dual_boost::DualBoostController;
use crate::freq::FreqChangeReactor;
use crate::freq::FreqTransition;
use crate::hotplug::CpuHotplug;
use crate::hotplug::HotplugEvent;
use crate::hotplug::HotplugReactor;
use crate::hotplug::SysfsCpuHotplug;
use crate::load::CpuLoadTracker;
use crate::misc::parse_attr_u32;
use crate::rq::RunQueueSampler;
use crate::time_source::TimeSource;
use crate::topology::CpuFreqTopology;
use crate::Cpumask;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use log::info;
use std::sync::Arc;

/// Run-queue average reported while dual boost is locked, i.e. "100.0".
pub const BOOSTED_RUN_QUEUE_AVG: u32 = 1000;

/// The telemetry engine: per-CPU load tracking, its event reactors, the
/// run-queue sampler and the optional dual-boost controller, wired together
/// from a single topology.
pub struct RqStats {
    tracker: Arc<CpuLoadTracker>,
    freq: FreqChangeReactor,
    hotplug: HotplugReactor,
    rq: RunQueueSampler,
    dual_boost: Option<DualBoostController>,
}

impl RqStats {
    /// Build the engine. Fails without side effects if the topology or the
    /// configuration is unusable. `hotplug` is only used for dual boost and
    /// defaults to sysfs.
    pub fn new(
        top: &CpuFreqTopology,
        time_source: Arc<dyn TimeSource>,
        config: &RqStatsConfig,
        hotplug: Option<Arc<dyn CpuHotplug>>,
    ) -> Result<Self> {
        if top.nr_cpu_ids() == 0 {
            bail!("No possible CPUs");
        }

        let db = &config.dual_boost;
        let dual_boost = if db.enabled {
            if db.secondary_cpu >= top.nr_cpu_ids() {
                bail!(
                    "Dual-boost CPU {} out of range, max {}",
                    db.secondary_cpu,
                    top.nr_cpu_ids()
                );
            }
            let hotplug = hotplug
                .unwrap_or_else(|| Arc::new(SysfsCpuHotplug::new()) as Arc<dyn CpuHotplug>);
            Some(DualBoostController::new(
                hotplug,
                db.secondary_cpu,
                db.deferred,
            ))
        } else {
            None
        };

        let tracker = Arc::new(CpuLoadTracker::new(top, time_source)?);
        let freq = FreqChangeReactor::new(top, tracker.clone())?;
        let hotplug = HotplugReactor::new(top, tracker.clone());
        let rq = RunQueueSampler::new(config.rq_poll_ms, config.def_timer_ms);

        info!(
            "rq-stats: {} CPUs in {} frequency domains, {} online, poll={}ms def_timer={}ms{}",
            top.nr_cpu_ids(),
            top.domains().len(),
            top.online().weight(),
            config.rq_poll_ms,
            config.def_timer_ms,
            match &dual_boost {
                Some(db) => format!(" dual_boost=cpu{}", db.secondary_cpu()),
                None => String::new(),
            }
        );

        Ok(Self {
            tracker,
            freq,
            hotplug,
            rq,
            dual_boost,
        })
    }

    pub fn tracker(&self) -> &CpuLoadTracker {
        &self.tracker
    }

    pub fn run_queue(&self) -> &RunQueueSampler {
        &self.rq
    }

    pub fn dual_boost(&self) -> Option<&DualBoostController> {
        self.dual_boost.as_ref()
    }

    pub fn online_cpus(&self) -> Cpumask {
        self.hotplug.online_cpus()
    }

    /// Sum of the frequency-normalized load of every online CPU since the
    /// previous call. Each CPU's window restarts.
    pub fn report_load_at_max_freq(&self) -> u64 {
        self.tracker.read_and_reset(&self.hotplug.online_cpus())
    }

    pub fn on_frequency_change(&self, freqs: &FreqTransition) -> Result<()> {
        self.freq.on_frequency_change(freqs)
    }

    pub fn on_hotplug(&self, event: &HotplugEvent) -> Result<()> {
        self.hotplug.on_hotplug(event)
    }

    fn boost(&self) -> Result<&DualBoostController> {
        self.dual_boost
            .as_ref()
            .ok_or_else(|| anyhow!("Dual boost is not enabled"))
    }

    pub fn enable_boost(&self) -> Result<()> {
        self.boost()?.enable_boost()
    }

    pub fn disable_boost(&self) -> Result<()> {
        self.boost()?.disable_boost()
    }

    pub fn is_boost_locked(&self) -> bool {
        self.dual_boost
            .as_ref()
            .map(|db| db.is_locked())
            .unwrap_or(false)
    }

    /// Render `attr` as a single line. Reading `cpu_normalized_load` or
    /// `run_queue_avg` drains them.
    pub fn show(&self, attr: RqStatsAttr) -> String {
        match attr {
            RqStatsAttr::CpuNormalizedLoad => format!("{}\n", self.report_load_at_max_freq()),
            RqStatsAttr::DefTimerMs => format!("{}\n", self.rq.deferred_timer_elapsed_ms()),
            RqStatsAttr::RunQueueAvg => {
                let mut val = self.rq.read_and_reset_run_queue_average();
                if self.is_boost_locked() {
                    val = BOOSTED_RUN_QUEUE_AVG;
                }
                format_tenths(val)
            }
            RqStatsAttr::RunQueuePollMs => format!("{}\n", self.rq.poll_interval_ms()),
        }
    }

    /// Write `buf` to `attr`. Malformed numbers are stored as 0. Read-only
    /// attributes are rejected.
    pub fn store(&self, attr: RqStatsAttr, buf: &str) -> Result<()> {
        if !attr.is_writable() {
            bail!("{} is read-only", attr);
        }

        let val = parse_attr_u32(buf);
        match attr {
            RqStatsAttr::DefTimerMs => self.rq.set_deferred_timer_ms(val),
            RqStatsAttr::RunQueuePollMs => self.rq.set_poll_interval_ms(val),
            RqStatsAttr::CpuNormalizedLoad | RqStatsAttr::RunQueueAvg => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DualBoostConfig;
    use crate::time_source::testing::FakeTimeSource;
    use std::time::Instant;

    fn top() -> CpuFreqTopology {
        CpuFreqTopology::from_domains(2, &[(vec![0, 1], 2000, 1000)], &[0, 1]).unwrap()
    }

    #[test]
    fn bad_secondary_cpu_is_fatal() {
        let config = RqStatsConfig {
            dual_boost: DualBoostConfig {
                enabled: true,
                secondary_cpu: 4,
                deferred: false,
            },
            ..Default::default()
        };
        let ts = Arc::new(FakeTimeSource::new(2));
        assert!(RqStats::new(&top(), ts, &config, None).is_err());
    }

    #[test]
    fn boost_requires_controller() {
        let ts = Arc::new(FakeTimeSource::new(2));
        let rqs = RqStats::new(&top(), ts, &RqStatsConfig::default(), None).unwrap();
        assert!(rqs.dual_boost().is_none());
        assert!(rqs.enable_boost().is_err());
        assert!(!rqs.is_boost_locked());
    }

    #[test]
    fn normalized_load_attr() {
        let ts = Arc::new(FakeTimeSource::new(2));
        let rqs = RqStats::new(&top(), ts.clone(), &RqStatsConfig::default(), None).unwrap();

        ts.advance(0, 50, 0, 100);
        ts.advance(1, 100, 0, 100);
        assert_eq!(rqs.show(RqStatsAttr::CpuNormalizedLoad), "25\n");
        assert_eq!(rqs.show(RqStatsAttr::CpuNormalizedLoad), "0\n");
    }

    #[test]
    fn run_queue_attrs() {
        let ts = Arc::new(FakeTimeSource::new(2));
        let rqs = RqStats::new(&top(), ts, &RqStatsConfig::default(), None).unwrap();

        rqs.store(RqStatsAttr::RunQueuePollMs, "20\n").unwrap();
        assert_eq!(rqs.show(RqStatsAttr::RunQueuePollMs), "20\n");
        rqs.store(RqStatsAttr::RunQueuePollMs, "garbage").unwrap();
        assert_eq!(rqs.show(RqStatsAttr::RunQueuePollMs), "0\n");

        let now = Instant::now();
        rqs.run_queue().tick_at(3, now + std::time::Duration::from_secs(1));
        assert_eq!(rqs.show(RqStatsAttr::RunQueueAvg), "3.0\n");
        assert_eq!(rqs.show(RqStatsAttr::RunQueueAvg), "0.0\n");

        assert!(rqs.store(RqStatsAttr::RunQueueAvg, "5").is_err());
        assert!(rqs.store(RqStatsAttr::CpuNormalizedLoad, "5").is_err());
    }
}
