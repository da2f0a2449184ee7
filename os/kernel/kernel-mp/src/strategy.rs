use kernel_nt::EntryPoints;

/// How work reaches other processors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// `KeIpiGenericCall`: every active processor runs a trampoline at
    /// `IPI_LEVEL`, which filters on the executing processor.
    BroadcastIpi,
    /// One DPC per target processor, queued with `KeInsertQueueDpc`.
    TargetedDpc,
}

impl DispatchStrategy {
    #[must_use]
    pub const fn select(entry_points: EntryPoints) -> Self {
        if entry_points.ipi_generic_call() {
            Self::BroadcastIpi
        } else {
            Self::TargetedDpc
        }
    }
}

/// How a single processor is interrupted, cheapest first.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PokeStrategy {
    /// `HalRequestIpi(0, PKAFFINITY_EX)`.
    HalIpiW7Plus,
    /// `HalRequestIpi(KAFFINITY)`; only while every id fits a `KAFFINITY`.
    HalIpiPreW7,
    /// `KeIpiGenericCall` with an empty body.
    BroadcastIpi,
    /// A high-importance DPC, on kernels where queuing one remotely sends an IPI.
    HighImportanceDpc,
    Unsupported,
}

impl PokeStrategy {
    #[must_use]
    pub const fn select(entry_points: EntryPoints, max_cpus: u32) -> Self {
        if entry_points.hal_request_ipi_w7_plus() && entry_points.processor_groups() {
            Self::HalIpiW7Plus
        } else if entry_points.hal_request_ipi_pre_w7() && max_cpus <= 64 {
            Self::HalIpiPreW7
        } else if entry_points.ipi_generic_call() {
            Self::BroadcastIpi
        } else if entry_points.high_importance_dpc_ipi() {
            Self::HighImportanceDpc
        } else {
            Self::Unsupported
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn modern_kernels_broadcast_and_use_the_hal() {
        let ep = EntryPoints::modern();
        assert_eq!(DispatchStrategy::select(ep), DispatchStrategy::BroadcastIpi);
        assert_eq!(PokeStrategy::select(ep, 256), PokeStrategy::HalIpiW7Plus);
    }

    #[test]
    fn pre_w7_hal_needs_small_ids() {
        let ep = EntryPoints::legacy().with_hal_request_ipi_pre_w7(true);
        assert_eq!(PokeStrategy::select(ep, 64), PokeStrategy::HalIpiPreW7);
        assert_eq!(PokeStrategy::select(ep, 65), PokeStrategy::Unsupported);
        let ep = ep.with_ipi_generic_call(true);
        assert_eq!(PokeStrategy::select(ep, 65), PokeStrategy::BroadcastIpi);
    }

    #[test]
    fn w7_hal_without_groups_is_not_used() {
        let ep = EntryPoints::legacy()
            .with_hal_request_ipi_w7_plus(true)
            .with_high_importance_dpc_ipi(true);
        assert_eq!(DispatchStrategy::select(ep), DispatchStrategy::TargetedDpc);
        assert_eq!(PokeStrategy::select(ep, 4), PokeStrategy::HighImportanceDpc);
        assert_eq!(PokeStrategy::select(EntryPoints::legacy(), 4), PokeStrategy::Unsupported);
    }
}
