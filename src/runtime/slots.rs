use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

/// 单个执行的串行化槽位
///
/// tokio 的 Mutex 按到达顺序唤醒等待者，排队的触发器因此按到达顺序应用
#[derive(Default)]
pub struct ExecutionSlot {
    gate: AsyncMutex<()>,
    cancelled: AtomicBool,
}

impl ExecutionSlot {
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.gate.try_lock().ok()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SlotEntry {
    slot: Arc<ExecutionSlot>,
    leases: usize,
}

/// 所有执行的槽位表
///
/// 槽位只在被借出期间存在，最后一个 [`SlotLease`] 结束时从表中移除
#[derive(Default)]
pub struct ExecutionSlots {
    slots: Mutex<HashMap<String, SlotEntry>>,
}

impl ExecutionSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// 借出槽位；同一执行的并发租约共享同一个槽位
    pub fn lease(&self, execution_id: &str) -> SlotLease<'_> {
        let slot = {
            let mut slots = self.slots.lock();
            let entry = slots.entry(execution_id.to_string()).or_default();
            entry.leases += 1;
            Arc::clone(&entry.slot)
        };
        SlotLease {
            slots: self,
            execution_id: execution_id.to_string(),
            slot,
        }
    }

    fn release(&self, execution_id: &str) {
        let mut slots = self.slots.lock();
        let idle = match slots.get_mut(execution_id) {
            Some(entry) => {
                entry.leases = entry.leases.saturating_sub(1);
                entry.leases == 0
            }
            None => false,
        };
        if idle {
            slots.remove(execution_id);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// 对某个执行槽位的临时持有
pub struct SlotLease<'a> {
    slots: &'a ExecutionSlots,
    execution_id: String,
    slot: Arc<ExecutionSlot>,
}

impl SlotLease<'_> {
    pub fn handle(&self) -> Arc<ExecutionSlot> {
        Arc::clone(&self.slot)
    }
}

impl Deref for SlotLease<'_> {
    type Target = ExecutionSlot;

    fn deref(&self) -> &ExecutionSlot {
        &self.slot
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        self.slots.release(&self.execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_lock_reports_busy_slot() {
        let slots = ExecutionSlots::new();
        let holder = slots.lease("e1");
        let guard = holder.lock().await;
        assert!(slots.lease("e1").try_lock().is_none());
        drop(guard);
        assert!(slots.lease("e1").try_lock().is_some());
        assert_eq!(slots.len(), 1);
    }

    #[tokio::test]
    async fn test_lease_releases_idle_slot() {
        let slots = ExecutionSlots::new();
        {
            let lease = slots.lease("e1");
            let _guard = lease.lock().await;
            assert_eq!(slots.len(), 1);
        }
        assert!(slots.is_empty());

        let first = slots.lease("e2");
        let second = slots.lease("e2");
        assert!(Arc::ptr_eq(&first.handle(), &second.handle()));
        first.cancel();
        drop(first);
        // 仍有租约时保留槽位和取消标记
        assert_eq!(slots.len(), 1);
        assert!(slots.lease("e2").is_cancelled());
        drop(second);
        assert!(slots.is_empty());
    }

    #[test]
    fn test_cancel_flag() {
        let slot = ExecutionSlot::default();
        assert!(!slot.is_cancelled());
        slot.cancel();
        assert!(slot.is_cancelled());
        slot.reset();
        assert!(!slot.is_cancelled());
    }
}
