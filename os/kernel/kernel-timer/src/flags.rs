use bitfield_struct::bitfield;
use kernel_mp::CpuId;

/// Timer creation flags.
///
/// ```text
/// | 31‒18    | 17       | 16           | 15‒0 |
/// | reserved | high_res | cpu_specific | cpu  |
/// ```
///
/// `cpu_specific` with `cpu == 0xffff` requests an omni timer.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TimerFlags {
    /// Target processor id, meaningful with `cpu_specific`.
    #[bits(16)]
    pub cpu: u16,
    pub cpu_specific: bool,
    /// Use a high-resolution kernel timer.
    pub high_res: bool,
    #[bits(14)]
    __: u16,
}

impl TimerFlags {
    /// `cpu` value that selects every processor.
    pub const CPU_ALL: u16 = 0xffff;
    const VALID_MASK: u32 = 0x3_ffff;

    /// Fires on whichever processor the kernel picks.
    #[must_use]
    pub const fn any_cpu() -> Self {
        Self::new()
    }

    /// Fires on processor `cpu` only.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_lossless)]
    pub const fn specific(cpu: CpuId) -> Self {
        let cpu = if cpu.0 < Self::CPU_ALL as u32 {
            cpu.0 as u16
        } else {
            // Never a valid id; creation rejects it.
            Self::CPU_ALL - 1
        };
        Self::new().with_cpu_specific(true).with_cpu(cpu)
    }

    /// Omni timer: fires on every online processor each period.
    #[must_use]
    pub const fn all_cpus() -> Self {
        Self::new().with_cpu_specific(true).with_cpu(Self::CPU_ALL)
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.into_bits() & !Self::VALID_MASK == 0 && (self.cpu_specific() || self.cpu() == 0)
    }

    #[must_use]
    pub const fn is_omni(self) -> bool {
        self.cpu_specific() && self.cpu() == Self::CPU_ALL
    }

    /// The single processor requested, if any.
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn target(self) -> Option<CpuId> {
        if self.cpu_specific() && !self.is_omni() {
            Some(CpuId(self.cpu() as u32))
        } else {
            None
        }
    }
}
