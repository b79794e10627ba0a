//! トラップ（ソフトウェアブレークポイント）機能

use crate::{Result, Target};

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// トラップを設置するアドレス
///
/// 同じアドレスに複数の論理ブレークポイントがあっても、
/// 物理的なトラップは1つだけです。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapSite {
    address: u64,
    original_byte: u8,
    armed: bool,
}

impl TrapSite {
    /// トラップを作成する（未設置）
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: 0,
            armed: false,
        }
    }

    /// INT3がメモリに書き込まれているかどうか
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// トラップを設置する
    ///
    /// 指定されたアドレスの命令を0xCC（INT3）で置き換えます。
    /// 設置済みなら何もしません。
    pub fn arm<T: Target + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        if self.armed {
            return Ok(());
        }

        let original = target.read_memory(self.address, 1)?;
        self.original_byte = *original
            .first()
            .ok_or_else(|| anyhow::anyhow!("Empty read at 0x{:x}", self.address))?;

        target.write_memory(self.address, &[INT3_OPCODE])?;

        self.armed = true;
        Ok(())
    }

    /// トラップを外す
    ///
    /// INT3命令を元のバイトで置き換えます。外れていれば何もしません。
    pub fn disarm<T: Target + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        if !self.armed {
            return Ok(());
        }

        target.write_memory(self.address, &[self.original_byte])?;

        self.armed = false;
        Ok(())
    }

    /// メモリから読んだバイト列のうち、このトラップが覆っている位置を元のバイトに戻す
    pub fn unpatch(&self, base: u64, bytes: &mut [u8]) {
        if !self.armed || self.address < base {
            return;
        }
        let offset = (self.address - base) as usize;
        if let Some(byte) = bytes.get_mut(offset) {
            *byte = self.original_byte;
        }
    }

    /// ターゲットのメモリが失われたときに状態だけを外す
    pub fn forget(&mut self) {
        self.armed = false;
    }
}
