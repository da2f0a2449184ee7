use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Largest processor count a [`CpuSet`] can hold.
pub const CPUSET_MAX_CPUS: u32 = 1024;

const WORDS: usize = (CPUSET_MAX_CPUS / 64) as usize;

/// Processor identifier.
///
/// Ids are the dense set indices `0..max_cpus`, so an id doubles as an index
/// into per-CPU tables. The group-relative location is available from
/// [`Mp::processor_number_from_id`](crate::Mp::processor_number_from_id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Never a valid processor.
    pub const NIL: Self = Self(u32::MAX);

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// A set of processors by id.
#[derive(Clone, PartialEq, Eq)]
pub struct CpuSet {
    words: [u64; WORDS],
}

impl CpuSet {
    #[must_use]
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Adds `cpu`; ids beyond the capacity are ignored.
    #[inline]
    pub fn add(&mut self, cpu: CpuId) {
        if cpu.0 < CPUSET_MAX_CPUS {
            self.words[(cpu.0 / 64) as usize] |= 1 << (cpu.0 % 64);
        }
    }

    #[inline]
    pub fn remove(&mut self, cpu: CpuId) {
        if cpu.0 < CPUSET_MAX_CPUS {
            self.words[(cpu.0 / 64) as usize] &= !(1 << (cpu.0 % 64));
        }
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, cpu: CpuId) -> bool {
        cpu.0 < CPUSET_MAX_CPUS && self.words[(cpu.0 / 64) as usize] & (1 << (cpu.0 % 64)) != 0
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Lowest id in the set.
    #[must_use]
    pub fn first(&self) -> Option<CpuId> {
        self.iter().next()
    }

    /// Ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &bits)| {
            (0..64u32)
                .filter(move |b| bits & (1 << b) != 0)
                .map(move |b| {
                    #[allow(clippy::cast_possible_truncation)]
                    let base = w as u32 * 64;
                    CpuId(base + b)
                })
        })
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|c| c.0)).finish()
    }
}

impl FromIterator<CpuId> for CpuSet {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut set = Self::new();
        iter.into_iter().for_each(|c| set.add(c));
        set
    }
}

/// [`CpuSet`] that can be updated through a shared reference.
pub(crate) struct AtomicCpuSet {
    words: [AtomicU64; WORDS],
}

impl AtomicCpuSet {
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; WORDS],
        }
    }

    pub fn add(&self, cpu: CpuId) {
        if cpu.0 < CPUSET_MAX_CPUS {
            self.words[(cpu.0 / 64) as usize].fetch_or(1 << (cpu.0 % 64), Ordering::AcqRel);
        }
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        cpu.0 < CPUSET_MAX_CPUS
            && self.words[(cpu.0 / 64) as usize].load(Ordering::Acquire) & (1 << (cpu.0 % 64)) != 0
    }

    pub fn snapshot(&self) -> CpuSet {
        let mut set = CpuSet::new();
        for (dst, src) in set.words.iter_mut().zip(&self.words) {
            *dst = src.load(Ordering::Acquire);
        }
        set
    }
}
