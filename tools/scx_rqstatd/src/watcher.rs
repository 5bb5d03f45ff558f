// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Context;
use anyhow::Result;
use log::debug;
use scx_rqstats::read_from_file;
use scx_rqstats::CpuFreqTopology;
use scx_rqstats::Cpumask;
use scx_rqstats::FreqTransition;
use scx_rqstats::HotplugEvent;
use scx_rqstats::HotplugState;
use std::path::Path;
use std::path::PathBuf;

struct PolicyState {
    cpu: usize,
    cur_freq_path: PathBuf,
    last_freq: u64,
}

/// Turns changes observed in sysfs into post-change frequency transitions
/// and hot-plug events.
///
/// Userspace never sees individual transitions, only the frequency current at
/// poll time, so back-to-back changes inside one poll period collapse into a
/// single transition from the last observed frequency.
pub struct EventWatcher {
    nr_cpu_ids: usize,
    online_path: PathBuf,
    last_online: Cpumask,
    policies: Vec<PolicyState>,
}

impl EventWatcher {
    pub fn new(root: &Path, top: &CpuFreqTopology) -> Self {
        let policies = top
            .domains()
            .iter()
            .filter_map(|dom| {
                let policy = dom.policy_path()?;
                Some(PolicyState {
                    cpu: dom.span().iter().next()?,
                    cur_freq_path: policy.join("scaling_cur_freq"),
                    last_freq: dom.cur_freq(),
                })
            })
            .collect();

        Self {
            nr_cpu_ids: top.nr_cpu_ids(),
            online_path: root.join("sys/devices/system/cpu/online"),
            last_online: top.online().clone(),
            policies,
        }
    }

    pub fn poll_frequencies(&mut self) -> Vec<FreqTransition> {
        let mut transitions = vec![];

        for policy in self.policies.iter_mut() {
            let freq = match read_from_file::<u64>(&policy.cur_freq_path) {
                Ok(freq) => freq,
                Err(e) => {
                    debug!("CPU {}: {:#}", policy.cpu, e);
                    continue;
                }
            };
            if freq != policy.last_freq {
                transitions.push(FreqTransition {
                    cpu: policy.cpu,
                    old_freq: policy.last_freq,
                    new_freq: freq,
                });
                policy.last_freq = freq;
            }
        }

        transitions
    }

    pub fn poll_online(&mut self) -> Result<Vec<HotplugEvent>> {
        let online = std::fs::read_to_string(&self.online_path)
            .with_context(|| format!("Failed to read {:?}", self.online_path))?;
        let online = Cpumask::from_cpulist(online.trim(), self.nr_cpu_ids)?;

        let mut events = vec![];
        for cpu in 0..self.nr_cpu_ids {
            let state = match (self.last_online.test_cpu(cpu), online.test_cpu(cpu)) {
                (false, true) => HotplugState::Online,
                (true, false) => HotplugState::Offline,
                _ => continue,
            };
            events.push(HotplugEvent { cpu, state });
        }

        self.last_online = online;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_sysfs() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let cpu = tmp.path().join("sys/devices/system/cpu");
        fs::create_dir_all(&cpu).unwrap();
        fs::write(cpu.join("possible"), "0-3\n").unwrap();
        fs::write(cpu.join("online"), "0-3\n").unwrap();
        for (policy, related) in [("policy0", "0-1"), ("policy2", "2-3")] {
            let dir = cpu.join("cpufreq").join(policy);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("related_cpus"), format!("{related}\n")).unwrap();
            fs::write(dir.join("cpuinfo_max_freq"), "2000000\n").unwrap();
            fs::write(dir.join("scaling_cur_freq"), "1000000\n").unwrap();
        }
        tmp
    }

    #[test]
    fn reports_frequency_changes_once() {
        let tmp = fake_sysfs();
        let top = CpuFreqTopology::from_sysfs(tmp.path()).unwrap();
        let mut watcher = EventWatcher::new(tmp.path(), &top);
        assert!(watcher.poll_frequencies().is_empty());

        fs::write(
            tmp.path()
                .join("sys/devices/system/cpu/cpufreq/policy2/scaling_cur_freq"),
            "1500000\n",
        )
        .unwrap();
        assert_eq!(
            watcher.poll_frequencies(),
            vec![FreqTransition {
                cpu: 2,
                old_freq: 1000000,
                new_freq: 1500000,
            }]
        );
        assert!(watcher.poll_frequencies().is_empty());
    }

    #[test]
    fn reports_hotplug_transitions() {
        let tmp = fake_sysfs();
        let top = CpuFreqTopology::from_sysfs(tmp.path()).unwrap();
        let mut watcher = EventWatcher::new(tmp.path(), &top);
        let online = tmp.path().join("sys/devices/system/cpu/online");

        fs::write(&online, "0-2\n").unwrap();
        assert_eq!(
            watcher.poll_online().unwrap(),
            vec![HotplugEvent {
                cpu: 3,
                state: HotplugState::Offline,
            }]
        );

        fs::write(&online, "0-3\n").unwrap();
        assert_eq!(
            watcher.poll_online().unwrap(),
            vec![HotplugEvent {
                cpu: 3,
                state: HotplugState::Online,
            }]
        );
        assert!(watcher.poll_online().unwrap().is_empty());
    }
}
