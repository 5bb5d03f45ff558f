// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Fixed-width CPU masks
//!
//! A Cpumask is a BitVec of u64's sized to the number of possible CPU IDs it
//! was created for. Frequency domains (`related_cpus`) and the engine's online
//! set are both expressed as Cpumasks.
//!
//! Masks are created empty or from a sysfs style cpulist, and print as hex:
//!
//!```
//!     use scx_rqstats::Cpumask;
//!     let empty = Cpumask::new(8);
//!     let from_list = Cpumask::from_cpulist("4-7", 8).unwrap();
//!     assert_eq!(format!("{from_list}"), "f0");
//!     assert!(empty.is_empty());
//!```

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.mask.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask able to hold `nr_cpu_ids` CPUs.
    pub fn new(nr_cpu_ids: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpu_ids],
        }
    }

    /// Build a Cpumask from a cpulist such as "0-3,6".
    pub fn from_cpulist(cpulist: &str, nr_cpu_ids: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpu_ids);
        for cpu in read_cpulist(cpulist)? {
            mask.set_cpu(cpu)?;
        }

        Ok(mask)
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set. CPUs beyond the width of the
    /// mask are never set.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The number of CPU IDs the mask can hold.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Iterate over the IDs of the CPUs set in the mask.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }
}

/// Parse a sysfs cpulist ("0-3,5,7-8") into a list of CPU IDs.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.mask.len() {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }

        None
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut masks: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(self.len().div_ceil(32).max(1));

        // Print the highest 32bit. Trim digits beyond the mask width.
        let width = match self.len().div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        let top = masks.pop().unwrap_or(0);
        write!(f, "{:0width$x}", top, width = width)?;

        // The rest in descending order.
        for submask in masks.iter().rev() {
            write!(f, ",{submask:08x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpulist_ranges() {
        assert_eq!(read_cpulist("0-2,6-8").unwrap(), vec![0, 1, 2, 6, 7, 8]);
        assert_eq!(read_cpulist("3\n").unwrap(), vec![3]);
        assert!(read_cpulist("").unwrap().is_empty());
        assert!(read_cpulist("a-b").is_err());
    }

    #[test]
    fn cpulist_mask() {
        let mask = Cpumask::from_cpulist("0-3", 8).unwrap();
        assert_eq!(mask.weight(), 4);
        assert_eq!(mask.len(), 8);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn out_of_range_cpu_rejected() {
        assert!(Cpumask::from_cpulist("0-8", 8).is_err());
        let mut mask = Cpumask::new(4);
        assert!(mask.set_cpu(4).is_err());
        assert!(mask.clear_cpu(4).is_err());
        assert!(!mask.test_cpu(100));
    }

    #[test]
    fn set_and_clear() {
        let mut mask = Cpumask::new(4);
        mask.set_cpu(0).unwrap();
        mask.set_cpu(2).unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 2]);

        mask.clear_cpu(2).unwrap();
        assert_eq!(mask.weight(), 1);
        mask.clear_cpu(0).unwrap();
        assert!(mask.is_empty());
    }

    #[test]
    fn display_is_hex() {
        let mask = Cpumask::from_cpulist("0,4-5", 8).unwrap();
        assert_eq!(format!("{mask}"), "31");
    }
}
