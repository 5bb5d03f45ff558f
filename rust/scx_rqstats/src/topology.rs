// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Frequency domain topology
//!
//! The load tracker needs, for every possible CPU, the set of CPUs that share
//! its clock (its frequency domain) and the highest frequency that domain can
//! reach. This module discovers both from cpufreq's sysfs policies:
//!
//! ```text
//! /sys/devices/system/cpu/possible
//! /sys/devices/system/cpu/online
//! /sys/devices/system/cpu/cpufreq/policy*/related_cpus
//! /sys/devices/system/cpu/cpufreq/policy*/cpuinfo_max_freq
//! /sys/devices/system/cpu/cpufreq/policy*/scaling_cur_freq
//! ```
//!
//! CPUs not covered by any policy (no CONFIG_CPU_FREQ, or a driver that never
//! registered) each get a singleton domain with a maximum frequency of 0,
//! which makes their normalized load read as 0.
//!
//! A topology can also be assembled directly with `from_domains()`, which is
//! what tests and simulations use.
//!
//! The result is read-only. The domain layout and maximum frequencies are
//! fixed for the lifetime of the engine built on top of it.

use crate::misc::read_from_file;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use sscanf::sscanf;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct FreqDomain {
    id: usize,
    span: Cpumask,
    max_freq: u64,
    cur_freq: u64,
    policy_path: Option<PathBuf>,
}

impl FreqDomain {
    /// Get the ID of this domain
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get a Cpumask of all CPUs clocked together with this domain
    pub fn span(&self) -> &Cpumask {
        &self.span
    }

    /// Get the highest frequency the domain can run at
    pub fn max_freq(&self) -> u64 {
        self.max_freq
    }

    /// Get the frequency the domain was running at when discovered
    pub fn cur_freq(&self) -> u64 {
        self.cur_freq
    }

    /// Get the cpufreq policy directory backing this domain, if any
    pub fn policy_path(&self) -> Option<&Path> {
        self.policy_path.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct CpuFreqTopology {
    nr_cpu_ids: usize,
    online: Cpumask,
    domains: Vec<FreqDomain>,
    cpu_domain: Vec<usize>,
}

impl CpuFreqTopology {
    /// Discover the host's frequency domains.
    pub fn new() -> Result<CpuFreqTopology> {
        Self::from_sysfs(Path::new("/"))
    }

    /// Discover frequency domains from a sysfs tree mounted under `root`.
    pub fn from_sysfs(root: &Path) -> Result<CpuFreqTopology> {
        let cpu_root = root.join("sys/devices/system/cpu");

        let possible = std::fs::read_to_string(cpu_root.join("possible"))
            .with_context(|| format!("Failed to read possible CPUs under {:?}", cpu_root))?;
        let nr_cpu_ids = match crate::cpumask::read_cpulist(&possible)?.into_iter().max() {
            Some(max) => max + 1,
            None => bail!("No possible CPUs found under {:?}", cpu_root),
        };

        let online = std::fs::read_to_string(cpu_root.join("online"))
            .with_context(|| format!("Failed to read online CPUs under {:?}", cpu_root))?;
        let online = Cpumask::from_cpulist(&online, nr_cpu_ids)?;

        let mut domains = vec![];
        let pattern = cpu_root.join("cpufreq/policy[0-9]*");
        let mut policy_paths: Vec<(usize, PathBuf)> = vec![];
        for path in glob(&pattern.to_string_lossy())?.filter_map(Result::ok) {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            let policy_id = match name.as_deref().map(|n| sscanf!(n, "policy{usize}")) {
                Some(Ok(id)) => id,
                _ => bail!("Failed to parse cpufreq policy {:?}", path),
            };
            policy_paths.push((policy_id, path));
        }
        policy_paths.sort();

        for (_, path) in policy_paths {
            let related = std::fs::read_to_string(path.join("related_cpus"))
                .with_context(|| format!("Failed to read related_cpus in {:?}", path))?;
            let span = Cpumask::from_cpulist(&related, nr_cpu_ids)?;
            if span.is_empty() {
                debug!("Skipping cpufreq policy {:?} with no CPUs", path);
                continue;
            }
            let max_freq: u64 = read_from_file(&path.join("cpuinfo_max_freq"))?;
            let cur_freq: u64 = read_from_file(&path.join("scaling_cur_freq"))
                .or_else(|_| read_from_file(&path.join("cpuinfo_cur_freq")))
                .unwrap_or(max_freq);

            domains.push(FreqDomain {
                id: domains.len(),
                span,
                max_freq,
                cur_freq,
                policy_path: Some(path),
            });
        }

        Self::assemble(nr_cpu_ids, online, domains)
    }

    /// Build a topology from explicit `(cpus, max_freq, cur_freq)` domains.
    /// CPUs that appear in no domain get a singleton domain with a maximum
    /// frequency of 0.
    pub fn from_domains(
        nr_cpu_ids: usize,
        domains: &[(Vec<usize>, u64, u64)],
        online: &[usize],
    ) -> Result<CpuFreqTopology> {
        if nr_cpu_ids == 0 {
            bail!("A topology needs at least one CPU");
        }

        let mut online_mask = Cpumask::new(nr_cpu_ids);
        for cpu in online {
            online_mask.set_cpu(*cpu)?;
        }

        let mut doms = vec![];
        for (cpus, max_freq, cur_freq) in domains.iter() {
            let mut span = Cpumask::new(nr_cpu_ids);
            for cpu in cpus.iter() {
                span.set_cpu(*cpu)?;
            }
            doms.push(FreqDomain {
                id: doms.len(),
                span,
                max_freq: *max_freq,
                cur_freq: *cur_freq,
                policy_path: None,
            });
        }

        Self::assemble(nr_cpu_ids, online_mask, doms)
    }

    fn assemble(
        nr_cpu_ids: usize,
        online: Cpumask,
        mut domains: Vec<FreqDomain>,
    ) -> Result<CpuFreqTopology> {
        let mut cpu_domain = vec![usize::MAX; nr_cpu_ids];
        for dom in domains.iter() {
            for cpu in dom.span.iter() {
                if cpu_domain[cpu] != usize::MAX {
                    bail!(
                        "CPU {} is in both frequency domain {} and {}",
                        cpu,
                        cpu_domain[cpu],
                        dom.id
                    );
                }
                cpu_domain[cpu] = dom.id;
            }
        }

        for cpu in 0..nr_cpu_ids {
            if cpu_domain[cpu] != usize::MAX {
                continue;
            }
            let mut span = Cpumask::new(nr_cpu_ids);
            span.set_cpu(cpu)?;
            debug!("CPU {} has no cpufreq policy, using a singleton domain", cpu);
            cpu_domain[cpu] = domains.len();
            domains.push(FreqDomain {
                id: domains.len(),
                span,
                max_freq: 0,
                cur_freq: 0,
                policy_path: None,
            });
        }

        Ok(CpuFreqTopology {
            nr_cpu_ids,
            online,
            domains,
            cpu_domain,
        })
    }

    /// Get the number of possible CPU IDs
    pub fn nr_cpu_ids(&self) -> usize {
        self.nr_cpu_ids
    }

    /// Get a Cpumask of the CPUs online at discovery time
    pub fn online(&self) -> &Cpumask {
        &self.online
    }

    /// Get all frequency domains
    pub fn domains(&self) -> &[FreqDomain] {
        &self.domains
    }

    /// Get the frequency domain a CPU belongs to
    pub fn cpu_domain(&self, cpu: usize) -> Option<&FreqDomain> {
        self.cpu_domain.get(cpu).map(|&id| &self.domains[id])
    }
}
