// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod proc_stat;
mod watcher;

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::debug;
use log::info;
use log::warn;
use metrics::counter;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use proc_stat::ProcStatTimeSource;
use scx_rqstats::CpuFreqTopology;
use scx_rqstats::CpuHotplug;
use scx_rqstats::LogRecorderBuilder;
use scx_rqstats::RqStats;
use scx_rqstats::RqStatsAttr;
use scx_rqstats::RqStatsConfig;
use scx_rqstats::SysfsCpuHotplug;
use scx_rqstats::TimeSource;
use watcher::EventWatcher;

/// scx_rqstatd: per-CPU load and run-queue statistics daemon
///
/// Tracks, for every online CPU, how busy it has been scaled to what that load
/// would be at the maximum frequency of its cpufreq policy, and keeps a
/// time-weighted average of the number of runnable tasks.
///
/// Frequency transitions and CPU hot-plug are picked up by polling sysfs. The
/// summed normalized load and the run-queue average are reported every
/// interval through the log or, with --enable-prometheus, on port 9000.
///
/// Optionally a secondary CPU can be kept online for the lifetime of the
/// daemon (dual boost). While boost is held the run-queue average reads 100.0.
#[derive(Debug, Parser)]
struct Opts {
    /// Reporting interval in seconds.
    #[clap(short = 'i', long, default_value = "1.0")]
    interval: f64,

    /// How often /proc/stat and cpufreq are sampled, in milliseconds.
    #[clap(short = 't', long, default_value = "10")]
    tick_ms: u64,

    /// Run-queue poll interval in milliseconds. Overrides the config file.
    #[clap(short = 'p', long)]
    poll_ms: Option<u32>,

    /// Deferred timer interval in milliseconds. Overrides the config file.
    #[clap(short = 'd', long)]
    def_timer_ms: Option<u32>,

    /// JSON configuration file. Fields left out take their defaults.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Keep the secondary CPU online while the daemon runs.
    #[clap(short = 'b', long, action = clap::ArgAction::SetTrue)]
    dual_boost: bool,

    /// Secondary CPU for dual boost.
    #[clap(long)]
    boost_cpu: Option<usize>,

    /// Bring the secondary CPU up from a worker thread.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    boost_deferred: bool,

    /// Root of the sysfs tree to read topology and events from.
    #[clap(long, default_value = "/")]
    sysfs_root: PathBuf,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

impl Opts {
    fn rq_stats_config(&self) -> Result<RqStatsConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => RqStatsConfig::default(),
        };

        if let Some(ms) = self.poll_ms {
            config.rq_poll_ms = ms;
        }
        if let Some(ms) = self.def_timer_ms {
            config.def_timer_ms = ms;
        }
        if self.dual_boost {
            config.dual_boost.enabled = true;
        }
        if let Some(cpu) = self.boost_cpu {
            config.dual_boost.secondary_cpu = cpu;
        }
        if self.boost_deferred {
            config.dual_boost.deferred = true;
        }
        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<RqStatsConfig> {
    let buf = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    serde_json::from_str(&buf).with_context(|| format!("Failed to parse config {:?}", path))
}

struct RqStatsd {
    rqs: Arc<RqStats>,
    time_source: Arc<ProcStatTimeSource>,
    watcher: EventWatcher,
    tick_interval: Duration,
    report_interval: Duration,
}

impl RqStatsd {
    fn init(opts: &Opts) -> Result<Self> {
        if !opts.interval.is_finite() || opts.interval <= 0.0 {
            bail!("Invalid reporting interval {}", opts.interval);
        }

        let config = opts.rq_stats_config()?;
        let top = CpuFreqTopology::from_sysfs(&opts.sysfs_root)?;
        let time_source = Arc::new(ProcStatTimeSource::new()?);
        let hotplug = Arc::new(SysfsCpuHotplug::with_root(&opts.sysfs_root));

        let rqs = Arc::new(RqStats::new(
            &top,
            time_source.clone() as Arc<dyn TimeSource>,
            &config,
            Some(hotplug as Arc<dyn CpuHotplug>),
        )?);

        for dom in top.domains() {
            debug!(
                "Domain {}: CPUs {} max {} kHz cur {} kHz",
                dom.id(),
                dom.span(),
                dom.max_freq(),
                dom.cur_freq()
            );
            for cpu in dom.span().iter() {
                gauge!("cpu_freq_khz", "cpu" => cpu.to_string()).set(dom.cur_freq() as f64);
            }
        }

        if config.dual_boost.enabled {
            rqs.enable_boost()?;
            info!("Dual boost locked on CPU {}", config.dual_boost.secondary_cpu);
        }

        Ok(Self {
            rqs,
            time_source,
            watcher: EventWatcher::new(&opts.sysfs_root, &top),
            tick_interval: Duration::from_millis(opts.tick_ms.max(1)),
            report_interval: Duration::from_secs_f64(opts.interval),
        })
    }

    fn tick(&mut self) -> Result<()> {
        self.time_source.refresh()?;

        for event in self.watcher.poll_online()? {
            if let Err(e) = self.rqs.on_hotplug(&event) {
                warn!("Failed to apply {:?}: {:#}", event, e);
                continue;
            }
            counter!("hotplug_events_total").increment(1);
        }

        for freqs in self.watcher.poll_frequencies() {
            if let Err(e) = self.rqs.on_frequency_change(&freqs) {
                warn!("Failed to apply {:?}: {:#}", freqs, e);
                continue;
            }
            if let Some(related) = self.rqs.tracker().related_cpus(freqs.cpu) {
                for cpu in related.iter() {
                    gauge!("cpu_freq_khz", "cpu" => cpu.to_string()).set(freqs.new_freq as f64);
                }
            }
            counter!("freq_transitions_total").increment(1);
        }

        self.rqs.run_queue().tick(self.time_source.nr_running());
        Ok(())
    }

    fn report(&self) {
        let load = self.rqs.report_load_at_max_freq();
        let rq_avg = self.rqs.show(RqStatsAttr::RunQueueAvg);
        let rq_avg = rq_avg.trim();

        gauge!("cpu_normalized_load").set(load as f64);
        gauge!("run_queue_avg").set(rq_avg.parse::<f64>().unwrap_or(0.0));
        info!(
            "load={} rq_avg={} online={}",
            load,
            rq_avg,
            self.rqs.online_cpus().weight()
        );
    }

    fn run_loop(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let now = Instant::now();
        let mut next_tick_at = now + self.tick_interval;
        let mut next_report_at = now + self.report_interval;

        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();

            if now >= next_tick_at {
                self.tick()?;
                next_tick_at += self.tick_interval;
                if next_tick_at < now {
                    next_tick_at = now + self.tick_interval;
                }
            }

            if now >= next_report_at {
                self.report();
                next_report_at += self.report_interval;
                if next_report_at < now {
                    next_report_at = now + self.report_interval;
                }
            }

            thread::sleep(
                next_report_at
                    .min(next_tick_at)
                    .saturating_duration_since(Instant::now()),
            );
        }
        Ok(())
    }

    fn release_boost(&self) -> Result<()> {
        if self.rqs.is_boost_locked() {
            self.rqs.disable_boost()?;
            info!("Dual boost released");
        }
        Ok(())
    }

    /// Run until shutdown. Boost taken in `init()` is released however the
    /// loop ends.
    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let res = spawn_def_timer_monitor(self.rqs.clone(), shutdown.clone())
            .and_then(|_| self.run_loop(&shutdown));
        let released = self.release_boost();
        res.and(released)
    }
}

/// Publish the deferred timer readout every time it is recomputed.
fn spawn_def_timer_monitor(rqs: Arc<RqStats>, shutdown: Arc<AtomicBool>) -> Result<()> {
    thread::Builder::new()
        .name("def-timer".into())
        .spawn(move || {
            let rq = rqs.run_queue();
            let mut seen = rq.deferred_timer_generation();
            while !shutdown.load(Ordering::Relaxed) {
                let gen = rq.wait_deferred_timer_change(seen, Duration::from_secs(1));
                if gen != seen {
                    seen = gen;
                    gauge!("def_timer_ms").set(rq.deferred_timer_elapsed_ms() as f64);
                }
            }
        })
        .context("Failed to spawn deferred timer monitor")?;
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    } else {
        LogRecorderBuilder::new()
            .with_reporting_interval(Duration::from_secs(3))
            .install()
            .context("Failed to install log recorder")?;
    }

    let mut rqstatd = RqStatsd::init(&opts)?;
    rqstatd.run(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tempfile::TempDir;

    #[test]
    fn cli_overrides_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "rq_poll_ms": 30, "def_timer_ms": 80, "dual_boost": {{ "secondary_cpu": 3 }} }}"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let opts = Opts::parse_from(["scx_rqstatd", "-c", &path, "-p", "5", "-b"]);
        let config = opts.rq_stats_config().unwrap();
        assert_eq!(config.rq_poll_ms, 5);
        assert_eq!(config.def_timer_ms, 80);
        assert!(config.dual_boost.enabled);
        assert_eq!(config.dual_boost.secondary_cpu, 3);
    }

    #[test]
    fn non_finite_interval_rejected() {
        for interval in ["NaN", "inf", "0", "-1"] {
            let opts = Opts::parse_from(["scx_rqstatd", &format!("--interval={}", interval)]);
            assert!(RqStatsd::init(&opts).is_err());
        }
    }

    #[test]
    fn boost_released_when_loop_fails() {
        let tmp = TempDir::new().unwrap();
        let cpu_root = tmp.path().join("sys/devices/system/cpu");
        fs::create_dir_all(cpu_root.join("cpu0")).unwrap();
        fs::create_dir_all(cpu_root.join("cpu1")).unwrap();
        fs::write(cpu_root.join("possible"), "0-1\n").unwrap();
        fs::write(cpu_root.join("online"), "0\n").unwrap();
        fs::write(cpu_root.join("cpu1/online"), "0\n").unwrap();

        let root = tmp.path().to_string_lossy().into_owned();
        let opts = Opts::parse_from([
            "scx_rqstatd",
            "--sysfs-root",
            &root,
            "-b",
            "--boost-cpu",
            "1",
        ]);
        let mut rqstatd = RqStatsd::init(&opts).unwrap();
        assert!(rqstatd.rqs.is_boost_locked());
        assert_eq!(fs::read_to_string(cpu_root.join("cpu1/online")).unwrap().trim(), "1");

        // The first tick fails to read the online mask.
        fs::remove_file(cpu_root.join("online")).unwrap();
        assert!(rqstatd.run(Arc::new(AtomicBool::new(false))).is_err());

        assert!(!rqstatd.rqs.is_boost_locked());
        assert_eq!(fs::read_to_string(cpu_root.join("cpu1/online")).unwrap().trim(), "0");
    }

    #[test]
    fn defaults_without_config() {
        let opts = Opts::parse_from(["scx_rqstatd"]);
        assert_eq!(opts.rq_stats_config().unwrap(), RqStatsConfig::default());
    }
}
