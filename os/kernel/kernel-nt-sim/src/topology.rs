//! Present/active processors and NT-style index assignment.

use kernel_nt::{GroupInfo, GroupRelationship, ProcessorNumber};

pub struct SimGroup {
    pub maximum: u8,
    pub active_mask: u64,
    /// Processor index per member, once assigned.
    pub index_of: Vec<Option<u32>>,
}

pub struct SimTopology {
    pub groups: Vec<SimGroup>,
    /// Processor number per index, once assigned.
    pub numbers: Vec<Option<ProcessorNumber>>,
    next_index: u32,
}

impl SimTopology {
    /// Initially active members get indices in group order.
    pub fn new(layout: &[(u8, u8)]) -> Self {
        let total: u32 = layout.iter().map(|&(max, _)| u32::from(max)).sum();
        let mut topo = Self {
            groups: layout
                .iter()
                .map(|&(maximum, _)| SimGroup {
                    maximum,
                    active_mask: 0,
                    index_of: vec![None; usize::from(maximum)],
                })
                .collect(),
            numbers: vec![None; total as usize],
            next_index: 0,
        };
        for (group, &(_, active)) in layout.iter().enumerate() {
            for member in 0..active {
                #[allow(clippy::cast_possible_truncation)]
                topo.assign(group as u16, member);
                topo.groups[group].active_mask |= 1 << member;
            }
        }
        topo
    }

    pub fn total(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let n = self.numbers.len() as u32;
        n
    }

    /// Gives `(group, member)` the next free index, or returns the one it has.
    pub fn assign(&mut self, group: u16, member: u8) -> Option<u32> {
        let slot = self
            .groups
            .get_mut(usize::from(group))?
            .index_of
            .get_mut(usize::from(member))?;
        if let Some(index) = *slot {
            return Some(index);
        }
        let index = self.next_index;
        *slot = Some(index);
        self.numbers[index as usize] = Some(ProcessorNumber::of(group, member));
        self.next_index += 1;
        Some(index)
    }

    pub fn unassign(&mut self, group: u16, member: u8) {
        if let Some(index) = self.groups[usize::from(group)].index_of[usize::from(member)].take() {
            self.numbers[index as usize] = None;
            if index + 1 == self.next_index {
                self.next_index -= 1;
            }
        }
    }

    pub fn index_of(&self, number: ProcessorNumber) -> Option<u32> {
        self.groups
            .get(usize::from(number.group()))?
            .index_of
            .get(usize::from(number.number()))
            .copied()
            .flatten()
    }

    pub fn is_active(&self, index: u32) -> bool {
        self.numbers
            .get(index as usize)
            .copied()
            .flatten()
            .is_some_and(|n| self.groups[usize::from(n.group())].active_mask & (1 << n.number()) != 0)
    }

    pub fn active_indices(&self) -> Vec<u32> {
        (0..self.total()).filter(|&i| self.is_active(i)).collect()
    }

    pub fn active_count(&self) -> u32 {
        self.groups.iter().map(|g| g.active_mask.count_ones()).sum()
    }

    pub fn relationship(&self) -> GroupRelationship {
        #[allow(clippy::cast_possible_truncation)]
        let count = self.groups.len() as u16;
        GroupRelationship {
            maximum_group_count: count,
            active_group_count: count,
            groups: self
                .groups
                .iter()
                .map(|g| GroupInfo {
                    maximum_processor_count: g.maximum,
                    #[allow(clippy::cast_possible_truncation)]
                    active_processor_count: g.active_mask.count_ones() as u8,
                    active_processor_mask: g.active_mask,
                })
                .collect(),
        }
    }
}
