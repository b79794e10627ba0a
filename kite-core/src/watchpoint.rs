//! ウォッチポイント管理
//!
//! デバッグレジスタの4つのスロットに論理的なウォッチポイントを割り当てます。
//! スロットへの書き込みは [`Target`] に任せ、ここでは対応関係だけを持ちます。

use crate::Result;
use kite_target::{Target, WatchKind, WATCHPOINT_SLOTS};

/// ウォッチポイントID
pub type WatchpointId = usize;

/// ウォッチポイント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchpoint {
    pub id: WatchpointId,
    pub address: u64,
    /// 監視するバイト数（1/2/4/8）
    pub len: usize,
    pub kind: WatchKind,
    /// 使っているデバッグレジスタ（DR0〜DR3）
    pub slot: usize,
}

/// ウォッチポイントテーブル
pub struct WatchpointTable {
    slots: [Option<Watchpoint>; WATCHPOINT_SLOTS],
    next_id: WatchpointId,
}

impl WatchpointTable {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            next_id: 1,
        }
    }

    /// 空いているスロットにウォッチポイントを設定する
    pub fn add<T: Target + ?Sized>(
        &mut self,
        address: u64,
        len: usize,
        kind: WatchKind,
        target: &mut T,
    ) -> Result<WatchpointId> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| {
                anyhow::anyhow!("All {} debug registers are in use", WATCHPOINT_SLOTS)
            })?;

        target.set_watchpoint(slot, address, len, kind)?;

        let id = self.next_id;
        self.next_id += 1;
        self.slots[slot] = Some(Watchpoint {
            id,
            address,
            len,
            kind,
            slot,
        });
        tracing::debug!(id, slot, address = format_args!("0x{:x}", address), len, %kind, "watchpoint set");
        Ok(id)
    }

    /// ウォッチポイントを削除する（見つからなければfalse）
    pub fn remove<T: Target + ?Sized>(&mut self, id: WatchpointId, target: &mut T) -> Result<bool> {
        let Some(slot) = self
            .slots
            .iter()
            .position(|wp| wp.as_ref().is_some_and(|wp| wp.id == id))
        else {
            return Ok(false);
        };
        target.clear_watchpoint(slot)?;
        self.slots[slot] = None;
        Ok(true)
    }

    /// スロットを使っているウォッチポイント
    pub fn by_slot(&self, slot: usize) -> Option<&Watchpoint> {
        self.slots.get(slot)?.as_ref()
    }

    /// 設定中のウォッチポイント（スロット順）
    pub fn all(&self) -> Vec<Watchpoint> {
        self.slots.iter().flatten().cloned().collect()
    }

    /// すべてのスロットを解除する（デタッチ前）
    pub fn clear_all<T: Target + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        for slot in 0..WATCHPOINT_SLOTS {
            if self.slots[slot].take().is_some() {
                target.clear_watchpoint(slot)?;
            }
        }
        Ok(())
    }

    /// ターゲットが終了したときに状態を捨てる
    pub fn forget_all(&mut self) {
        self.slots = Default::default();
    }
}

impl Default for WatchpointTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTarget, STACK_TOP};

    const SLOT_DATA: u64 = STACK_TOP - 0x40;

    #[test]
    fn test_slots_are_allocated_and_reused() {
        let mut target = MockTarget::program();
        let mut table = WatchpointTable::new();

        let ids: Vec<WatchpointId> = (0..WATCHPOINT_SLOTS as u64)
            .map(|i| {
                table
                    .add(SLOT_DATA + i * 8, 8, WatchKind::Write, &mut target)
                    .unwrap()
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(table.add(SLOT_DATA + 0x20, 8, WatchKind::Write, &mut target).is_err());

        assert!(table.remove(2, &mut target).unwrap());
        assert!(!table.remove(2, &mut target).unwrap());
        assert_eq!(target.watch_slot(1), None);

        let id = table.add(SLOT_DATA + 0x20, 4, WatchKind::ReadWrite, &mut target).unwrap();
        assert_eq!(id, 5);
        assert_eq!(table.by_slot(1).map(|wp| wp.id), Some(5));
        assert_eq!(target.watch_slot(1), Some((SLOT_DATA + 0x20, 4, WatchKind::ReadWrite)));
    }

    #[test]
    fn test_rejected_request_keeps_slot_free() {
        let mut target = MockTarget::program();
        let mut table = WatchpointTable::new();
        // 長さに揃っていないアドレス
        assert!(table.add(SLOT_DATA + 2, 4, WatchKind::Write, &mut target).is_err());
        assert!(table.all().is_empty());
        assert_eq!(target.watch_slot(0), None);
    }

    #[test]
    fn test_clear_all_releases_debug_registers() {
        let mut target = MockTarget::program();
        let mut table = WatchpointTable::new();
        table.add(SLOT_DATA, 8, WatchKind::Write, &mut target).unwrap();
        table.add(SLOT_DATA + 8, 8, WatchKind::Write, &mut target).unwrap();

        table.clear_all(&mut target).unwrap();
        assert!(table.all().is_empty());
        assert_eq!(target.watch_slot(0), None);
        assert_eq!(target.watch_slot(1), None);
    }
}
