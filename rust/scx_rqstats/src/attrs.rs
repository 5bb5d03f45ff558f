// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Named text attributes exposed by the engine, in the layout of the
//! `rq-stats` sysfs group: every value is rendered as one line and writes
//! take a leading unsigned decimal.

use anyhow::bail;
use anyhow::Result;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RqStatsAttr {
    CpuNormalizedLoad,
    DefTimerMs,
    RunQueueAvg,
    RunQueuePollMs,
}

impl RqStatsAttr {
    pub const ALL: [RqStatsAttr; 4] = [
        RqStatsAttr::CpuNormalizedLoad,
        RqStatsAttr::DefTimerMs,
        RqStatsAttr::RunQueueAvg,
        RqStatsAttr::RunQueuePollMs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RqStatsAttr::CpuNormalizedLoad => "cpu_normalized_load",
            RqStatsAttr::DefTimerMs => "def_timer_ms",
            RqStatsAttr::RunQueueAvg => "run_queue_avg",
            RqStatsAttr::RunQueuePollMs => "run_queue_poll_ms",
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, RqStatsAttr::DefTimerMs | RqStatsAttr::RunQueuePollMs)
    }
}

impl fmt::Display for RqStatsAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RqStatsAttr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match RqStatsAttr::ALL.iter().find(|a| a.name() == s) {
            Some(attr) => Ok(*attr),
            None => bail!("Unknown attribute {:?}", s),
        }
    }
}

/// Render a run-queue average kept in tenths, e.g. 37 as "3.7\n".
pub fn format_tenths(val: u32) -> String {
    format!("{}.{}\n", val / 10, val % 10)
}
