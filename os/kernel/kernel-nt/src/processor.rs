use alloc::vec::Vec;
use bitfield_struct::bitfield;

/// Maximum number of logical processors in one processor group.
pub const MAXIMUM_PROC_PER_GROUP: u32 = 64;

/// Group-relative processor number (`PROCESSOR_NUMBER`).
///
/// Packed into 32 bits so it can live in an `AtomicU32`:
///
/// ```text
/// | 31‒16 | 15‒8     | 7‒0    |
/// | group | reserved | number |
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
pub struct ProcessorNumber {
    /// Member number within the group.
    pub number: u8,
    #[bits(8)]
    __: u8,
    /// Processor group.
    pub group: u16,
}

impl ProcessorNumber {
    /// Raw value that never encodes a real processor; used for empty slots.
    pub const NIL_BITS: u32 = u32::MAX;

    #[inline]
    #[must_use]
    pub const fn of(group: u16, number: u8) -> Self {
        Self::new().with_group(group).with_number(number)
    }

    /// Decodes a packed value, mapping [`NIL_BITS`](Self::NIL_BITS) to `None`.
    #[inline]
    #[must_use]
    pub const fn from_packed(bits: u32) -> Option<Self> {
        if bits == Self::NIL_BITS {
            None
        } else {
            Some(Self::from_bits(bits))
        }
    }
}

/// One `PROCESSOR_GROUP_INFO` record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct GroupInfo {
    pub maximum_processor_count: u8,
    pub active_processor_count: u8,
    /// `KAFFINITY` of the active members.
    pub active_processor_mask: u64,
}

/// `GROUP_RELATIONSHIP` as returned for `RelationGroup`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupRelationship {
    pub maximum_group_count: u16,
    pub active_group_count: u16,
    /// One entry per group, `maximum_group_count` long.
    pub groups: Vec<GroupInfo>,
}

/// Processor set indexed by processor index (`KAFFINITY_EX`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AffinityEx {
    bitmap: Vec<u64>,
}

impl AffinityEx {
    /// `KeInitializeAffinityEx`.
    #[must_use]
    pub const fn new() -> Self {
        Self { bitmap: Vec::new() }
    }

    /// `KeAddProcessorAffinityEx`.
    pub fn add_processor(&mut self, index: u32) {
        let word = (index / 64) as usize;
        if self.bitmap.len() <= word {
            self.bitmap.resize(word + 1, 0);
        }
        self.bitmap[word] |= 1 << (index % 64);
    }

    #[must_use]
    pub fn contains(&self, index: u32) -> bool {
        self.bitmap
            .get((index / 64) as usize)
            .is_some_and(|w| w & (1 << (index % 64)) != 0)
    }

    /// Processor indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bitmap.iter().enumerate().flat_map(|(w, &bits)| {
            (0..64u32).filter(move |b| bits & (1 << b) != 0).map(move |b| {
                #[allow(clippy::cast_possible_truncation)]
                let base = (w as u32) * 64;
                base + b
            })
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn processor_number_packs_group_high() {
        let n = ProcessorNumber::of(3, 17);
        assert_eq!(n.into_bits(), (3 << 16) | 17);
        assert_eq!(ProcessorNumber::from_packed(n.into_bits()), Some(n));
        assert_eq!(ProcessorNumber::from_packed(ProcessorNumber::NIL_BITS), None);
    }

    #[test]
    fn affinity_spans_words() {
        let mut a = AffinityEx::new();
        a.add_processor(1);
        a.add_processor(130);
        assert!(a.contains(1));
        assert!(a.contains(130));
        assert!(!a.contains(64));
        assert_eq!(a.iter().collect::<Vec<_>>(), [1, 130]);
    }
}
