//! デバッグ対象の抽象化
//!
//! セッションは [`Target`] を通してのみプロセスのメモリ・レジスタ・実行を操作します。
//! 実プロセスは [`PtraceTarget`]、テストではメモリ上の模擬ターゲットを使います。

use crate::watchpoint::{self, WatchKind, DR7_BASE};
use crate::{CpuState, Memory, MemoryMapping, Process, Registers, Result, TargetEvent};
use kite_symbols::ElfImage;
use nix::sys::signal::Signal;
use std::path::Path;

/// デバッグ対象
pub trait Target {
    /// プロセスID
    fn pid(&self) -> i32;

    /// メモリを読み取る
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// メモリに書き込む
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// 8バイトを読み取る（リトルエンディアン）
    fn read_word(&self, addr: u64) -> Result<u64> {
        let bytes = self.read_memory(addr, 8)?;
        let array: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Short read at 0x{:x}", addr))?;
        Ok(u64::from_le_bytes(array))
    }

    /// レジスタのスナップショット
    fn cpu_state(&self) -> Result<CpuState>;

    /// プログラムカウンタを設定する
    fn set_pc(&mut self, pc: u64) -> Result<()>;

    /// 実行を再開する（完了は `wait_event` で観測）
    fn resume(&mut self, signal: Option<Signal>) -> Result<()>;

    /// 1命令だけ実行する（完了は `wait_event` で観測）
    fn step(&mut self, signal: Option<Signal>) -> Result<()>;

    /// 次のデバッグイベントまでブロックする
    fn wait_event(&mut self) -> Result<TargetEvent>;

    /// 現在のメモリマッピング
    fn mappings(&self) -> Result<Vec<MemoryMapping>>;

    /// プログラムのエントリポイント（ロード後の絶対アドレス）
    fn entry_point(&self) -> Result<u64>;

    /// マッピング元ファイルのELFイメージを読み込む
    fn load_image(&self, path: &Path) -> Result<ElfImage> {
        ElfImage::load(path)
    }

    /// ハードウェアウォッチポイントを設定する（スロットは0〜3）
    fn set_watchpoint(&mut self, slot: usize, address: u64, len: usize, kind: WatchKind) -> Result<()>;

    /// ハードウェアウォッチポイントを解除する
    fn clear_watchpoint(&mut self, slot: usize) -> Result<()>;

    /// 直前の停止がウォッチポイントによるものなら、そのスロットを返す
    ///
    /// 読み出した時点でヒットの記録は消えます。
    fn take_watchpoint_hit(&mut self) -> Result<Option<usize>>;

    /// プロセスを終了させる
    fn kill(&mut self) -> Result<()>;

    /// プロセスから切り離す
    fn detach(&mut self) -> Result<()>;

    /// デバッガが起動したプロセスかどうか
    fn is_spawned(&self) -> bool;
}

/// ターゲットを生成するもの
///
/// ptraceはトレーサーのスレッドに紐づくため、生成はイベントループのスレッド上で行います。
pub trait Launcher {
    type Target: Target;

    /// 実行可能ファイルを起動し、execve直後で停止させる
    fn launch(&mut self, program: &Path, args: &[String]) -> Result<Self::Target>;

    /// 既存のプロセスにアタッチする
    fn attach(&mut self, pid: i32) -> Result<Self::Target>;
}

/// ptraceで制御する実プロセス
pub struct PtraceTarget {
    process: Process,
    memory: Memory,
    registers: Registers,
    /// 最後に書き込んだDR7
    dr7: u64,
}

impl PtraceTarget {
    /// プロセスからターゲットを作成する
    pub fn new(process: Process) -> Self {
        let pid = process.pid();
        Self {
            process,
            memory: Memory::new(pid),
            registers: Registers::new(pid),
            dr7: DR7_BASE,
        }
    }

    fn write_dr7(&mut self, dr7: u64) -> Result<()> {
        self.registers.set_debug_register(7, dr7)?;
        self.dr7 = dr7;
        Ok(())
    }
}

impl Target for PtraceTarget {
    fn pid(&self) -> i32 {
        self.process.pid()
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.memory.read(addr as usize, len)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.memory.write(addr as usize, data)
    }

    fn read_word(&self, addr: u64) -> Result<u64> {
        self.memory.read_u64(addr as usize)
    }

    fn cpu_state(&self) -> Result<CpuState> {
        self.registers.snapshot()
    }

    fn set_pc(&mut self, pc: u64) -> Result<()> {
        self.registers.set_pc(pc)
    }

    fn resume(&mut self, signal: Option<Signal>) -> Result<()> {
        self.process.continue_execution(signal)
    }

    fn step(&mut self, signal: Option<Signal>) -> Result<()> {
        self.process.step(signal)
    }

    fn wait_event(&mut self) -> Result<TargetEvent> {
        self.process.wait_event()
    }

    fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        self.memory.get_mappings()
    }

    fn entry_point(&self) -> Result<u64> {
        self.memory.entry_point()
    }

    fn set_watchpoint(&mut self, slot: usize, address: u64, len: usize, kind: WatchKind) -> Result<()> {
        let bits = watchpoint::dr7_bits(slot, address, len, kind)?;
        self.registers.set_debug_register(slot, address)?;
        self.write_dr7((self.dr7 & !watchpoint::dr7_slot_mask(slot)) | bits)
    }

    fn clear_watchpoint(&mut self, slot: usize) -> Result<()> {
        self.write_dr7(self.dr7 & !watchpoint::dr7_slot_mask(slot))
    }

    fn take_watchpoint_hit(&mut self) -> Result<Option<usize>> {
        // どのスロットも使っていなければDR6を読む必要はない
        if self.dr7 == DR7_BASE {
            return Ok(None);
        }
        let dr6 = self.registers.debug_register(6)?;
        let hit = watchpoint::dr6_hit_slot(dr6);
        if hit.is_some() {
            // CPUもカーネルもヒットビットを消さない
            self.registers
                .set_debug_register(6, watchpoint::dr6_cleared(dr6))?;
        }
        Ok(hit)
    }

    fn kill(&mut self) -> Result<()> {
        self.process.kill()
    }

    fn detach(&mut self) -> Result<()> {
        self.process.detach()
    }

    fn is_spawned(&self) -> bool {
        self.process.is_spawned()
    }
}

/// ptraceでプロセスを起動・アタッチする
#[derive(Debug, Default, Clone, Copy)]
pub struct PtraceLauncher;

impl Launcher for PtraceLauncher {
    type Target = PtraceTarget;

    fn launch(&mut self, program: &Path, args: &[String]) -> Result<PtraceTarget> {
        Process::spawn(program, args).map(PtraceTarget::new)
    }

    fn attach(&mut self, pid: i32) -> Result<PtraceTarget> {
        Process::attach(pid).map(PtraceTarget::new)
    }
}
