//! ハードウェアウォッチポイント（デバッグレジスタ）
//!
//! DR0〜DR3にアドレスを置き、DR7で有効化・条件・長さを指定します。
//! 停止後はDR6の下位4ビットでどのスロットが反応したかを判別します。

use crate::Result;

/// 使えるスロット数（DR0〜DR3）
pub const WATCHPOINT_SLOTS: usize = 4;

/// DR7の予約ビット（常に1）
pub const DR7_BASE: u64 = 1 << 10;

/// DR6のヒットビット
const DR6_HIT_MASK: u64 = 0b1111;

/// 監視するアクセスの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// 書き込みのみ
    Write,
    /// 読み書き
    ReadWrite,
}

impl WatchKind {
    /// アクセスがこの条件に当てはまるか
    pub fn matches(&self, is_write: bool) -> bool {
        match self {
            WatchKind::Write => is_write,
            WatchKind::ReadWrite => true,
        }
    }
}

impl std::fmt::Display for WatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchKind::Write => f.pad("write"),
            WatchKind::ReadWrite => f.pad("read/write"),
        }
    }
}

/// スロットを有効化するDR7のビット列を作る
///
/// 長さは1/2/4/8バイトで、アドレスは長さに揃っている必要があります。
pub fn dr7_bits(slot: usize, address: u64, len: usize, kind: WatchKind) -> Result<u64> {
    if slot >= WATCHPOINT_SLOTS {
        return Err(anyhow::anyhow!("No such debug register slot {}", slot));
    }
    let len_bits: u64 = match len {
        1 => 0b00,
        2 => 0b01,
        4 => 0b11,
        8 => 0b10,
        _ => {
            return Err(anyhow::anyhow!(
                "Watchpoint length must be 1, 2, 4 or 8 bytes (got {})",
                len
            ))
        }
    };
    if address % len as u64 != 0 {
        return Err(anyhow::anyhow!(
            "Watchpoint address 0x{:x} is not aligned to {} bytes",
            address,
            len
        ));
    }
    let rw_bits: u64 = match kind {
        WatchKind::Write => 0b01,
        WatchKind::ReadWrite => 0b11,
    };

    let enable = 1 << (slot * 2);
    let condition = (rw_bits | (len_bits << 2)) << (16 + slot * 4);
    Ok(enable | condition)
}

/// スロットに関係するDR7のビット
pub fn dr7_slot_mask(slot: usize) -> u64 {
    (0b11 << (slot * 2)) | (0b1111 << (16 + slot * 4))
}

/// DR6から反応したスロットを取り出す（番号の小さいものを優先）
pub fn dr6_hit_slot(dr6: u64) -> Option<usize> {
    let hits = dr6 & DR6_HIT_MASK;
    (hits != 0).then(|| hits.trailing_zeros() as usize)
}

/// ヒットビットを消したDR6の値
pub fn dr6_cleared(dr6: u64) -> u64 {
    dr6 & !DR6_HIT_MASK
}
