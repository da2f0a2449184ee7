//! Processor online notifications.

use crate::CpuId;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_nt::NtKernel;
use kernel_sync::KSpinLock;

/// What happened to a processor.
///
/// NT cannot hot-remove processors, so coming online is the only event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MpEvent {
    Online,
}

pub type MpNotifier = Arc<dyn Fn(MpEvent, CpuId) + Send + Sync>;

/// Handle for [`Mp::notification_deregister`](crate::Mp::notification_deregister).
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct NotificationRegistration(u64);

struct Registered {
    id: u64,
    notifier: MpNotifier,
}

pub(crate) struct Notifications {
    list: KSpinLock<(u64, Vec<Registered>)>,
}

impl Notifications {
    pub fn new(kernel: Arc<dyn NtKernel>) -> Self {
        Self {
            list: KSpinLock::new(kernel, (0, Vec::new())),
        }
    }

    pub fn register(&self, notifier: MpNotifier) -> NotificationRegistration {
        self.list.with_lock(|(next, list)| {
            *next += 1;
            list.push(Registered { id: *next, notifier });
            NotificationRegistration(*next)
        })
    }

    pub fn deregister(&self, registration: &NotificationRegistration) -> bool {
        self.list.with_lock(|(_, list)| {
            let before = list.len();
            list.retain(|r| r.id != registration.0);
            list.len() != before
        })
    }

    /// Runs every notifier outside the lock.
    pub fn fire(&self, event: MpEvent, cpu: CpuId) {
        let notifiers: Vec<MpNotifier> = self
            .list
            .with_lock(|(_, list)| list.iter().map(|r| Arc::clone(&r.notifier)).collect());
        for notifier in notifiers {
            notifier(event, cpu);
        }
    }
}
