//! Set index ⇄ (group, member) registry.
//!
//! Every processor the system may ever have gets a set index in
//! `0..max_cpus`. Active processors use the index the kernel assigned to
//! them. Members not seen yet get placeholders from the top of the range so
//! no index is ever renumbered; when such a member is hot-added under a
//! different index, the two assignments are swapped.

use crate::cpuset::{AtomicCpuSet, CPUSET_MAX_CPUS, CpuId, CpuSet};
use crate::{MpConfig, MpError};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_nt::{GroupInfo, GroupRelationship, MAXIMUM_PROC_PER_GROUP, NtKernel, ProcessorNumber};
use log::debug;

const NO_INDEX: u32 = u32::MAX;

struct GroupSlot {
    max_members: u32,
    active: AtomicU32,
    /// Set index per member, [`NO_INDEX`] when unassigned.
    members: Vec<AtomicU32>,
}

pub struct Topology {
    max_cpus: u32,
    groups: Vec<GroupSlot>,
    /// Packed [`ProcessorNumber`] per set index.
    numbers: Vec<AtomicU32>,
    online: AtomicCpuSet,
    online_count: AtomicU32,
}

fn inconsistent(what: &'static str) -> MpError {
    MpError::TopologyInconsistent(what)
}

impl Topology {
    /// Queries the kernel until the active processor count holds still while
    /// the tables are built. Each pass consumes one of `attempts`.
    ///
    /// # Errors
    /// [`MpError::TooManyCpus`], [`MpError::TopologyInconsistent`] or
    /// [`MpError::TopologyUnstable`].
    pub fn discover(kernel: &dyn NtKernel, config: &MpConfig, attempts: &mut u32) -> Result<Self, MpError> {
        let cap = config.max_cpus.min(CPUSET_MAX_CPUS);
        let groups_supported = kernel.entry_points().processor_groups();
        let max_cpus = kernel.maximum_processor_count();
        let max_groups = if groups_supported {
            kernel.maximum_group_count()
        } else {
            1
        };
        if max_cpus == 0 || max_cpus > cap {
            return Err(MpError::TooManyCpus(max_cpus));
        }
        if max_groups == 0 || u32::from(max_groups) > max_cpus {
            return Err(inconsistent("group count"));
        }

        while *attempts > 0 {
            *attempts -= 1;
            let active_before = kernel.active_processor_count();
            let relationship = if groups_supported {
                kernel.group_relationship()?
            } else {
                legacy_relationship(kernel, max_cpus)?
            };
            if relationship.groups.len() != usize::from(max_groups) {
                return Err(inconsistent("group relationship size"));
            }
            let topology = Self::build(kernel, max_cpus, &relationship, groups_supported)?;
            let active_after = kernel.active_processor_count();
            if active_before == active_after && topology.online_count() == active_after {
                return Ok(topology);
            }
            debug!(
                "active processor count moved during discovery ({active_before}, {}, {active_after}), retrying",
                topology.online_count()
            );
        }
        Err(MpError::TopologyUnstable)
    }

    fn build(
        kernel: &dyn NtKernel,
        max_cpus: u32,
        relationship: &GroupRelationship,
        groups_supported: bool,
    ) -> Result<Self, MpError> {
        #[allow(clippy::cast_possible_truncation)]
        let index_of = |g: usize, m: u32| {
            if groups_supported {
                kernel.processor_index_from_number(ProcessorNumber::of(g as u16, m as u8))
            } else {
                Some(m)
            }
        };

        let mut groups = Vec::new();
        groups
            .try_reserve_exact(relationship.groups.len())
            .map_err(|_| MpError::NoMemory)?;
        let mut sum_max = 0u32;
        for info in &relationship.groups {
            let max = u32::from(info.maximum_processor_count);
            let active = u32::from(info.active_processor_count);
            if max > MAXIMUM_PROC_PER_GROUP {
                return Err(inconsistent("group member count"));
            }
            if active > max {
                return Err(inconsistent("more active than maximum members"));
            }
            if info.active_processor_mask.count_ones() != active
                || (max < 64 && info.active_processor_mask >> max != 0)
            {
                return Err(inconsistent("active mask"));
            }
            sum_max += max;
            groups.push(GroupSlot {
                max_members: max,
                active: AtomicU32::new(0),
                members: (0..max).map(|_| AtomicU32::new(NO_INDEX)).collect(),
            });
        }
        if sum_max < max_cpus {
            return Err(inconsistent("group maxima below processor count"));
        }

        let topology = Self {
            max_cpus,
            groups,
            numbers: (0..max_cpus).map(|_| AtomicU32::new(ProcessorNumber::NIL_BITS)).collect(),
            online: AtomicCpuSet::new(),
            online_count: AtomicU32::new(0),
        };
        let mut used = CpuSet::new();

        // Active members: the kernel's index, which must be unique.
        for (g, info) in relationship.groups.iter().enumerate() {
            for m in active_members(info) {
                let index = index_of(g, m).ok_or(inconsistent("active processor without index"))?;
                if index >= max_cpus {
                    return Err(inconsistent("processor index out of range"));
                }
                if used.contains(CpuId(index)) {
                    return Err(inconsistent("duplicate processor index"));
                }
                used.add(CpuId(index));
                topology.assign(g, m, index);
                topology.online.add(CpuId(index));
                topology.groups[g].active.fetch_add(1, Ordering::Relaxed);
                topology.online_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Inactive members the kernel already numbered keep that number.
        for (g, slot) in topology.groups.iter().enumerate() {
            for m in 0..slot.max_members {
                if slot.members[m as usize].load(Ordering::Relaxed) != NO_INDEX {
                    continue;
                }
                if let Some(index) = index_of(g, m).filter(|&i| i < max_cpus && !used.contains(CpuId(i))) {
                    used.add(CpuId(index));
                    topology.assign(g, m, index);
                }
            }
        }

        // Everything else: placeholders from the top, while they last.
        let mut next_free = max_cpus;
        'groups: for (g, slot) in topology.groups.iter().enumerate() {
            for m in 0..slot.max_members {
                if slot.members[m as usize].load(Ordering::Relaxed) != NO_INDEX {
                    continue;
                }
                loop {
                    if next_free == 0 {
                        break 'groups;
                    }
                    next_free -= 1;
                    if !used.contains(CpuId(next_free)) {
                        break;
                    }
                }
                used.add(CpuId(next_free));
                topology.assign(g, m, next_free);
            }
        }

        Ok(topology)
    }

    fn assign(&self, group: usize, member: u32, index: u32) {
        #[allow(clippy::cast_possible_truncation)]
        let number = ProcessorNumber::of(group as u16, member as u8);
        self.groups[group].members[member as usize].store(index, Ordering::Release);
        self.numbers[index as usize].store(number.into_bits(), Ordering::Release);
    }

    /// Size of the set-index space.
    #[inline]
    pub const fn max_cpus(&self) -> u32 {
        self.max_cpus
    }

    #[inline]
    pub fn max_groups(&self) -> u16 {
        #[allow(clippy::cast_possible_truncation)]
        let n = self.groups.len() as u16;
        n
    }

    /// `(maximum, active)` members of `group`.
    pub fn group_counts(&self, group: u16) -> Option<(u32, u32)> {
        self.groups
            .get(usize::from(group))
            .map(|g| (g.max_members, g.active.load(Ordering::Acquire)))
    }

    pub fn index_from_group_member(&self, group: u16, member: u32) -> Option<u32> {
        self.groups
            .get(usize::from(group))?
            .members
            .get(member as usize)
            .map(|i| i.load(Ordering::Acquire))
            .filter(|&i| i != NO_INDEX)
    }

    pub fn number_from_index(&self, index: u32) -> Option<ProcessorNumber> {
        ProcessorNumber::from_packed(self.numbers.get(index as usize)?.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_online(&self, index: u32) -> bool {
        self.online.contains(CpuId(index))
    }

    #[inline]
    pub fn online_set(&self) -> CpuSet {
        self.online.snapshot()
    }

    #[inline]
    pub fn online_count(&self) -> u32 {
        self.online_count.load(Ordering::Acquire)
    }

    /// Checks a processor announced by the `StartAdd` notification.
    ///
    /// # Errors
    /// Names the violated condition.
    pub fn validate_add(&self, index: u32, number: ProcessorNumber) -> Result<(), &'static str> {
        if index >= self.max_cpus {
            return Err("processor index out of range");
        }
        let group = self
            .groups
            .get(usize::from(number.group()))
            .ok_or("group out of range")?;
        if u32::from(number.number()) >= group.max_members {
            return Err("member out of range");
        }
        if self.is_online(index) {
            return Err("processor index already online");
        }
        Ok(())
    }

    /// Brings a validated processor online, swapping its placeholder with
    /// whatever member held the kernel's index. Returns `false` when it was
    /// online already.
    pub fn complete_add(&self, index: u32, number: ProcessorNumber) -> bool {
        if self.validate_add(index, number).is_err() {
            return false;
        }
        let group = usize::from(number.group());
        let member = u32::from(number.number());
        let placeholder = self.groups[group].members[member as usize].load(Ordering::Acquire);
        if placeholder != index {
            match self.number_from_index(index) {
                Some(other) => {
                    self.groups[usize::from(other.group())].members[usize::from(other.number())]
                        .store(placeholder, Ordering::Release);
                    if placeholder != NO_INDEX {
                        self.numbers[placeholder as usize].store(other.into_bits(), Ordering::Release);
                    }
                }
                None if placeholder != NO_INDEX => {
                    self.numbers[placeholder as usize].store(ProcessorNumber::NIL_BITS, Ordering::Release);
                }
                None => {}
            }
            self.assign(group, member, index);
        }
        self.online.add(CpuId(index));
        self.groups[group].active.fetch_add(1, Ordering::AcqRel);
        self.online_count.fetch_add(1, Ordering::AcqRel);
        true
    }
}

fn active_members(info: &GroupInfo) -> impl Iterator<Item = u32> + '_ {
    (0..u32::from(info.maximum_processor_count)).filter(|m| info.active_processor_mask & (1 << m) != 0)
}

/// Single group described by `KeQueryActiveProcessors`.
fn legacy_relationship(kernel: &dyn NtKernel, max_cpus: u32) -> Result<GroupRelationship, MpError> {
    let max = u8::try_from(max_cpus)
        .ok()
        .filter(|&m| u32::from(m) <= MAXIMUM_PROC_PER_GROUP)
        .ok_or(inconsistent("more than one group's worth of processors"))?;
    let mask = kernel.active_processors();
    #[allow(clippy::cast_possible_truncation)]
    let active = mask.count_ones() as u8;
    let mut groups = Vec::new();
    groups.push(GroupInfo {
        maximum_processor_count: max,
        active_processor_count: active,
        active_processor_mask: mask,
    });
    Ok(GroupRelationship {
        maximum_group_count: 1,
        active_group_count: 1,
        groups,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use kernel_nt_sim::{SimConfig, SimKernel};

    fn discover(layout: &[(u8, u8)]) -> Topology {
        let k = SimKernel::new(SimConfig::groups(layout));
        let mut attempts = 4;
        Topology::discover(&*k, &MpConfig::new(), &mut attempts).unwrap()
    }

    #[test]
    fn placeholders_fill_from_the_top() {
        // Active: (0,0)=0 (1,0)=1; inactive (0,1) (1,1) (1,2) take 4, 3, 2.
        let t = discover(&[(2, 1), (3, 1)]);
        assert_eq!(t.max_cpus(), 5);
        assert_eq!(t.index_from_group_member(0, 0), Some(0));
        assert_eq!(t.index_from_group_member(1, 0), Some(1));
        assert_eq!(t.index_from_group_member(0, 1), Some(4));
        assert_eq!(t.index_from_group_member(1, 1), Some(3));
        assert_eq!(t.index_from_group_member(1, 2), Some(2));
        assert_eq!(t.online_count(), 2);
    }

    #[test]
    fn hot_add_swaps_placeholder_with_real_index() {
        let t = discover(&[(2, 1), (3, 1)]);
        // The kernel hands (1,2) index 2, which is already its placeholder.
        assert!(t.complete_add(2, ProcessorNumber::of(1, 2)));
        assert_eq!(t.index_from_group_member(1, 2), Some(2));

        // (0,1) comes next and gets 3, held by (1,1)'s placeholder.
        assert!(t.complete_add(3, ProcessorNumber::of(0, 1)));
        assert_eq!(t.index_from_group_member(0, 1), Some(3));
        assert_eq!(t.index_from_group_member(1, 1), Some(4));
        assert_eq!(t.number_from_index(4), Some(ProcessorNumber::of(1, 1)));
        assert_eq!(t.group_counts(0), Some((2, 2)));
        assert_eq!(t.online_count(), 4);

        assert!(!t.complete_add(3, ProcessorNumber::of(0, 1)), "already online");
        assert_eq!(t.validate_add(5, ProcessorNumber::of(1, 1)), Err("processor index out of range"));
        assert_eq!(t.validate_add(4, ProcessorNumber::of(1, 3)), Err("member out of range"));
    }
}
