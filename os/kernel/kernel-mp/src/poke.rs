use crate::{CpuId, Mp, MpError, PokeStrategy};
use kernel_nt::AffinityEx;

impl Mp {
    /// Interrupts processor `id` so it notices queued work sooner. Nothing
    /// runs on the target beyond the interrupt itself.
    ///
    /// # Errors
    /// [`MpError::CpuNotFound`], [`MpError::CpuOffline`], or
    /// [`MpError::NotSupported`] when the kernel offers no way to do it.
    pub fn poke_cpu(&self, id: CpuId) -> Result<(), MpError> {
        self.check_online(id)?;
        match self.poke {
            PokeStrategy::HalIpiW7Plus => {
                let mut targets = AffinityEx::new();
                targets.add_processor(id.index());
                self.kernel.hal_request_ipi_w7_plus(&targets)?;
            }
            PokeStrategy::HalIpiPreW7 => {
                let mask = 1u64.checked_shl(id.index()).ok_or(MpError::CpuNotFound)?;
                self.kernel.hal_request_ipi_pre_w7(mask)?;
            }
            PokeStrategy::BroadcastIpi => self.kernel.ipi_generic_call(&|| {})?,
            PokeStrategy::HighImportanceDpc => {
                let dpc = self
                    .poke_dpcs
                    .get(id.index() as usize)
                    .ok_or(MpError::InternalError)?;
                let number = self.processor_number_from_id(id).ok_or(MpError::CpuOffline)?;
                if dpc.target() != Some(number) {
                    // A queued DPC must not be retargeted.
                    self.kernel.remove_queue_dpc(dpc);
                    self.kernel.set_target_processor_dpc(dpc, number)?;
                }
                // Still queued from an earlier poke is as good as queued now.
                self.kernel.insert_queue_dpc(dpc);
            }
            PokeStrategy::Unsupported => return Err(MpError::NotSupported),
        }
        Ok(())
    }
}
