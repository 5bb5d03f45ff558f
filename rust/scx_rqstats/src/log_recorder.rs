// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use log::info;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics::Key;
use metrics::KeyName;
use metrics::Metadata;
use metrics::Recorder;
use metrics::SharedString;
use metrics::Unit;
use metrics_util::registry::AtomicStorage;
use metrics_util::registry::Registry;

/// Builds a `LogRecorder` and installs it as the global metrics recorder.
///
/// ```no_run
/// # use scx_rqstats::LogRecorderBuilder;
/// # use std::time::Duration;
/// LogRecorderBuilder::new()
///     .with_reporting_interval(Duration::from_secs(3))
///     .install()
///     .unwrap();
/// ```
pub struct LogRecorderBuilder {
    reporting_interval: Duration,
}

impl LogRecorderBuilder {
    pub fn new() -> LogRecorderBuilder {
        Self {
            reporting_interval: Duration::from_secs(3),
        }
    }

    pub fn with_reporting_interval(mut self, interval: Duration) -> Self {
        self.reporting_interval = interval;
        self
    }

    pub fn install(self) -> Result<()> {
        let recorder = LogRecorder::new();
        recorder.start(self.reporting_interval)?;
        metrics::set_global_recorder(recorder)?;
        Ok(())
    }
}

impl Default for LogRecorderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A metrics recorder that periodically logs every counter and gauge.
/// Counters are shown with their rate over the last period. Histograms are
/// not recorded.
pub(crate) struct LogRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl Recorder for LogRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

impl LogRecorder {
    pub(crate) fn new() -> Self {
        Self {
            registry: Arc::new(Registry::<Key, AtomicStorage>::atomic()),
        }
    }

    fn start(&self, reporting_interval: Duration) -> Result<()> {
        let registry = self.registry.clone();

        thread::Builder::new()
            .name("metrics-log".into())
            .spawn(move || {
                let mut prev_counters = BTreeMap::new();
                let mut prev_instant = Instant::now();

                loop {
                    thread::sleep(reporting_interval);
                    let period_secs = prev_instant.elapsed().as_secs_f64();
                    prev_instant = Instant::now();

                    for line in report(&registry, &mut prev_counters, period_secs) {
                        info!("{}", line);
                    }
                }
            })
            .context("Failed to spawn metrics logger")?;
        Ok(())
    }
}

/// `name` or `name{label=value,...}`.
fn key_display(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}{{{}}}", key.name(), labels.join(","))
    }
}

/// Render the current registry content. `prev_counters` carries counter
/// values between calls to compute rates.
fn report(
    registry: &Registry<Key, AtomicStorage>,
    prev_counters: &mut BTreeMap<String, u64>,
    period_secs: f64,
) -> Vec<String> {
    let mut lines = vec![];

    let counters: BTreeMap<String, u64> = registry
        .get_counter_handles()
        .iter()
        .map(|(key, c)| (key_display(key), c.load(Relaxed)))
        .collect();
    if !counters.is_empty() {
        lines.push("Counters:".to_string());
    }
    for (name, value) in counters {
        let prev = prev_counters.insert(name.clone(), value).unwrap_or(0);
        let rate = match period_secs {
            p if p > 0.0 => value.saturating_sub(prev) as f64 / p,
            _ => 0.0,
        };
        lines.push(format!("  {}: {} [{:.1}/s]", name, value, rate));
    }

    // Gauge values are stored as f64 bits.
    let gauges: BTreeMap<String, f64> = registry
        .get_gauge_handles()
        .iter()
        .map(|(key, g)| (key_display(key), f64::from_bits(g.load(Relaxed))))
        .collect();
    if !gauges.is_empty() {
        lines.push("Gauges:".to_string());
    }
    for (name, value) in gauges {
        lines.push(format!("  {}: {:.2}", name, value));
    }

    if !lines.is_empty() {
        lines.push("---".to_string());
    }
    lines
}
