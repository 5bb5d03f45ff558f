// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Per-CPU load and run-queue statistics
//!
//! This crate tracks, for every CPU, how busy it has been since the last
//! reader asked, scaled to what that load would be at the CPU's maximum
//! frequency. It also keeps a system-wide average of the run-queue depth.
//! Both are drained by their readers, so every read covers the time since
//! the previous one.
//!
//! The pieces are:
//!
//! - `CpuFreqTopology`: frequency domains and their maximum frequencies,
//!   discovered from cpufreq sysfs or assembled by hand.
//! - `CpuLoadTracker`: the per-CPU records and the aggregating reader.
//! - `FreqChangeReactor` / `HotplugReactor`: keep the records right across
//!   frequency transitions and CPUs coming and going.
//! - `RunQueueSampler`: the run-queue average and the deferred timer.
//! - `DualBoostController`: optionally pins a secondary CPU online.
//! - `RqStats`: all of the above wired together, plus the text attributes
//!   of the classic `rq-stats` interface.
//!
//! Raw per-CPU counters come from a `TimeSource` supplied by the embedder.
//! Frequency and hot-plug events are delivered by calling the engine.

mod attrs;
pub use attrs::format_tenths;
pub use attrs::RqStatsAttr;

mod config;
pub use config::DualBoostConfig;
pub use config::RqStatsConfig;

pub mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;

mod dual_boost;
pub use dual_boost::DualBoostController;

mod freq;
pub use freq::FreqChangeReactor;
pub use freq::FreqTransition;

mod hotplug;
pub use hotplug::CpuHotplug;
pub use hotplug::HotplugEvent;
pub use hotplug::HotplugReactor;
pub use hotplug::HotplugState;
pub use hotplug::SysfsCpuHotplug;

mod load;
pub use load::CpuLoad;
pub use load::CpuLoadGuard;
pub use load::CpuLoadTracker;

mod log_recorder;
pub use log_recorder::LogRecorderBuilder;

mod misc;
pub use misc::parse_attr_u32;
pub use misc::read_from_file;

pub mod rq;
pub use rq::RunQueueSampler;

mod rq_stats;
pub use rq_stats::RqStats;
pub use rq_stats::BOOSTED_RUN_QUEUE_AVG;

mod time_source;
pub use time_source::CpuTimes;
pub use time_source::TimeSource;

mod topology;
pub use topology::CpuFreqTopology;
pub use topology::FreqDomain;
