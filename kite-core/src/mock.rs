//! テスト用の模擬ターゲット
//!
//! 直線的なx86-64コードをメモリ上で実行します。
//! 命令長はcapstoneで求め、`jmp rel8/rel32`、`call rel32`、`ret`、`int3`、`hlt`（終了）だけを解釈します。
//! メモリアクセスは実行せず、テストが登録した命令だけがウォッチポイントに反応します。

use anyhow::anyhow;
use capstone::prelude::*;
use kite_symbols::{ElfImage, Symbol};
use kite_target::watchpoint::dr7_bits;
use kite_target::{
    CpuState, Launcher, MemoryMapping, Signal, Target, TargetEvent, WatchKind, INT3_OPCODE,
    WATCHPOINT_SLOTS,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

/// 模擬プログラムのパス
pub const APP: &str = "/mock/app";
/// 模擬動的ローダのパス
pub const LOADER: &str = "/mock/ld.so";
/// 後からロードされる模擬ライブラリのパス
pub const LIBFOO: &str = "/mock/libfoo.so";

pub const APP_BASE: u64 = 0x400000;
pub const LOADER_BASE: u64 = 0x402000;
pub const LIBFOO_BASE: u64 = 0x404000;
pub const ENTRY: u64 = APP_BASE + 0x20;
pub const ENTRY_SYMBOL: u64 = APP_BASE + 0x100;
pub const STACK_TOP: u64 = 0x800000;

/// 暴走防止の命令数上限
const MAX_RUN: usize = 100_000;

/// デタッチ時点のメモリ（領域の先頭アドレスと内容）
pub type MemorySnapshot = Arc<Mutex<Vec<(u64, Vec<u8>)>>>;

/// ウォッチポイントのスロット（アドレス、長さ、種類）
type WatchSlot = Option<(u64, usize, WatchKind)>;

struct Region {
    start: u64,
    data: Vec<u8>,
    /// マップし直したときの内容
    image: Vec<u8>,
    executable: bool,
    path: Option<String>,
    visible: bool,
}

impl Region {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

enum Exec {
    Next,
    Stop(TargetEvent),
}

pub struct MockTarget {
    regions: Vec<Region>,
    cpu: CpuState,
    entry: u64,
    images: HashMap<String, ElfImage>,
    /// 実行するたびにライブラリをマップ・アンマップするローダの関数
    loader_hook: Option<(u64, String)>,
    /// ローダの関数のトラップで先にマップを切り替えた
    flipped_early: bool,
    watches: [WatchSlot; WATCHPOINT_SLOTS],
    /// 命令アドレス -> （アクセスするアドレス、書き込みか）
    accesses: HashMap<u64, (u64, bool)>,
    watch_hit: Option<usize>,
    /// 再開のたびに1回分の合図を待つ
    gate: Option<Receiver<()>>,
    detach_snapshot: Option<MemorySnapshot>,
    events: VecDeque<TargetEvent>,
    exit_code: i32,
    alive: bool,
    severed: bool,
    spawned: bool,
    pub delivered: Vec<Signal>,
    cs: Capstone,
}

impl MockTarget {
    /// 空のターゲット（スタックのみ）
    pub fn empty(entry: u64) -> Self {
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .build()
            .expect("capstone");
        let mut target = Self {
            regions: Vec::new(),
            cpu: CpuState {
                rip: APP_BASE,
                rsp: STACK_TOP - 0x10,
                rbp: 0,
                ..CpuState::default()
            },
            entry,
            images: HashMap::new(),
            loader_hook: None,
            flipped_early: false,
            watches: [None; WATCHPOINT_SLOTS],
            accesses: HashMap::new(),
            watch_hit: None,
            gate: None,
            detach_snapshot: None,
            events: VecDeque::new(),
            exit_code: 0,
            alive: true,
            severed: false,
            spawned: true,
            delivered: Vec::new(),
            cs,
        };
        target.add_region(None, STACK_TOP - 0x1000, vec![0; 0x1000], false);
        if let Some(stack) = target.regions.last_mut() {
            stack.path = Some("[stack]".to_string());
        }
        target
    }

    /// 標準の模擬プログラム
    ///
    /// ```text
    /// 0x400000  nop...            ; execve直後の位置
    /// 0x400020  xor eax, eax      ; エントリポイント
    /// 0x400022  mov eax, 1
    /// 0x400027  nop...
    /// 0x400030  jmp 0x400100
    /// 0x400100  push rbp          ; EntrySymbol
    /// 0x400101  mov rbp, rsp
    /// 0x400104  nop...
    /// 0x400110  hlt               ; 終了
    /// ```
    pub fn program() -> Self {
        let mut code = vec![0x90; 0x1000];
        code[0x20..0x22].copy_from_slice(&[0x31, 0xc0]);
        code[0x22..0x27].copy_from_slice(&[0xb8, 0x01, 0x00, 0x00, 0x00]);
        code[0x30..0x35].copy_from_slice(&jmp_rel32(APP_BASE + 0x30, ENTRY_SYMBOL));
        code[0x100] = 0x55;
        code[0x101..0x104].copy_from_slice(&[0x48, 0x89, 0xe5]);
        code[0x110] = 0xf4;

        let mut target = Self::empty(ENTRY);
        target.add_region(Some(APP), APP_BASE, code, true);
        target.add_image(
            APP,
            vec![
                Symbol::new("_start".to_string(), 0x20, 0x20),
                Symbol::new("EntrySymbol".to_string(), 0x100, 0x10),
            ],
        );
        target
    }

    /// 実行中にライブラリをロードする模擬プログラム
    ///
    /// エントリから模擬ローダの `_dl_debug_state` へジャンプし、
    /// そこに到達した時点で libfoo.so がマップされます。
    pub fn program_with_loader() -> Self {
        let mut target = Self::program();
        target.patch(ENTRY, &jmp_rel32(ENTRY, LOADER_BASE));

        let mut loader = vec![0x90; 0x1000];
        loader[..5].copy_from_slice(&jmp_rel32(LOADER_BASE, LIBFOO_BASE + 0x10));
        target.add_loader(loader);

        let mut lib = vec![0x90; 0x1000];
        lib[0x14] = 0xf4;
        target.add_libfoo(lib);
        target
    }

    /// libfoo.so をロード・アンロード・再ロードする模擬プログラム
    ///
    /// ```text
    /// 0x400020  call _dl_debug_state   ; libfoo.so がロードされる
    /// 0x400025  call foo
    /// 0x40002a  call _dl_debug_state   ; アンロード
    /// 0x40002f  call _dl_debug_state   ; 再ロード
    /// 0x400034  call foo
    /// 0x400039  hlt
    /// ```
    pub fn program_with_reload() -> Self {
        let mut target = Self::program();
        let foo = LIBFOO_BASE + 0x10;
        let calls = [LOADER_BASE, foo, LOADER_BASE, LOADER_BASE, foo];
        let mut at = ENTRY;
        for callee in calls {
            target.patch(at, &call_rel32(at, callee));
            at += 5;
        }
        target.patch(at, &[0xf4]);

        let mut loader = vec![0x90; 0x1000];
        loader[0] = 0xc3;
        target.add_loader(loader);

        let mut lib = vec![0x90; 0x1000];
        lib[0x10] = 0xc3;
        target.add_libfoo(lib);
        target
    }

    /// 起動直後（エントリに着く前）に終了する模擬プログラム
    pub fn exits_early() -> Self {
        let mut target = Self::program();
        target.patch(APP_BASE, &[0xf4]);
        target
    }

    fn add_loader(&mut self, code: Vec<u8>) {
        self.add_region(Some(LOADER), LOADER_BASE, code, true);
        self.add_image(LOADER, vec![Symbol::new("_dl_debug_state".to_string(), 0, 5)]);
        self.loader_hook = Some((LOADER_BASE, LIBFOO.to_string()));
    }

    fn add_libfoo(&mut self, code: Vec<u8>) {
        self.add_region(Some(LIBFOO), LIBFOO_BASE, code, true);
        self.add_image(LIBFOO, vec![Symbol::new("foo".to_string(), 0x10, 0x8)]);
        self.hide(LIBFOO);
    }

    pub fn add_region(&mut self, path: Option<&str>, start: u64, data: Vec<u8>, executable: bool) {
        self.regions.push(Region {
            start,
            image: data.clone(),
            data,
            executable,
            path: path.map(str::to_string),
            visible: true,
        });
    }

    pub fn add_image(&mut self, path: &str, symbols: Vec<Symbol>) {
        self.images
            .insert(path.to_string(), ElfImage::from_parts(symbols, 0));
    }

    pub fn hide(&mut self, path: &str) {
        for region in self.regions.iter_mut().filter(|r| r.path.as_deref() == Some(path)) {
            region.visible = false;
        }
    }

    /// テスト用にメモリを直接書き換える（マップし直した後の内容も変わる）
    pub fn patch(&mut self, addr: u64, bytes: &[u8]) {
        let region = self
            .regions
            .iter_mut()
            .find(|r| addr >= r.start && addr + bytes.len() as u64 <= r.end())
            .expect("patch inside a region");
        let offset = (addr - region.start) as usize;
        region.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        region.image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// 命令がメモリにアクセスすることにする（ウォッチポイント用）
    pub fn record_access(&mut self, insn: u64, address: u64, is_write: bool) {
        self.accesses.insert(insn, (address, is_write));
    }

    /// デバッグレジスタのスロットの設定
    pub fn watch_slot(&self, slot: usize) -> Option<(u64, usize, WatchKind)> {
        self.watches[slot]
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn set_cpu(&mut self, cpu: CpuState) {
        self.cpu = cpu;
    }

    pub fn set_spawned(&mut self, spawned: bool) {
        self.spawned = spawned;
    }

    /// 以降のptrace操作をすべて失敗させる
    pub fn sever(&mut self) {
        self.severed = true;
    }

    pub fn raw_byte(&self, addr: u64) -> u8 {
        self.read_memory(addr, 1).expect("mapped")[0]
    }

    fn region(&self, addr: u64) -> Option<&Region> {
        self.regions
            .iter()
            .find(|r| r.visible && addr >= r.start && addr < r.end())
    }

    fn check_alive(&self) -> anyhow::Result<()> {
        if self.severed {
            return Err(anyhow!("ESRCH: No such process"));
        }
        if !self.alive {
            return Err(anyhow!("process has exited"));
        }
        Ok(())
    }

    /// ライブラリのマップ・アンマップを切り替える
    ///
    /// マップし直したライブラリは元の内容に戻る（以前のトラップは残らない）。
    fn toggle_library(&mut self, path: &str) {
        for region in self
            .regions
            .iter_mut()
            .filter(|r| r.path.as_deref() == Some(path))
        {
            region.visible = !region.visible;
            if region.visible {
                region.data = region.image.clone();
            }
        }
    }

    /// ローダの関数に来たらマップを切り替える
    ///
    /// デバッガのトラップで止まる時点で切り替わっている必要があるので、
    /// トラップがあればそこで切り替え、トラップを外して実行し直すときは切り替えない。
    fn run_loader_hook(&mut self, rip: u64) {
        let Some((at, path)) = self.loader_hook.clone() else {
            return;
        };
        if rip != at {
            return;
        }
        let trapped = self.region(rip).map(|r| r.data[(rip - r.start) as usize]) == Some(INT3_OPCODE);
        if trapped {
            self.toggle_library(&path);
            self.flipped_early = true;
        } else if self.flipped_early {
            self.flipped_early = false;
        } else {
            self.toggle_library(&path);
        }
    }

    /// 命令のメモリアクセスがウォッチポイントに当たるか
    fn check_access(&mut self, insn: u64) -> bool {
        let Some(&(address, is_write)) = self.accesses.get(&insn) else {
            return false;
        };
        let hit = self.watches.iter().position(|slot| {
            slot.is_some_and(|(start, len, kind)| {
                address >= start && address < start + len as u64 && kind.matches(is_write)
            })
        });
        self.watch_hit = hit;
        hit.is_some()
    }

    fn push(&mut self, value: u64) -> Exec {
        let rsp = self.cpu.rsp.wrapping_sub(8);
        if self.write_memory(rsp, &value.to_le_bytes()).is_err() {
            return Exec::Stop(TargetEvent::Signaled(Signal::SIGSEGV));
        }
        self.cpu.rsp = rsp;
        Exec::Next
    }

    fn exec_one(&mut self) -> Exec {
        let rip = self.cpu.rip;
        self.run_loader_hook(rip);

        let exec = self.decode_and_run(rip);
        if matches!(exec, Exec::Next) && self.check_access(rip) {
            // データブレークポイントは命令の完了後に報告される
            return Exec::Stop(TargetEvent::Trapped);
        }
        exec
    }

    fn decode_and_run(&mut self, rip: u64) -> Exec {
        let Some(region) = self.region(rip) else {
            return Exec::Stop(TargetEvent::Signaled(Signal::SIGSEGV));
        };
        if !region.executable {
            return Exec::Stop(TargetEvent::Signaled(Signal::SIGSEGV));
        }
        let offset = (rip - region.start) as usize;
        let window: Vec<u8> = region.data[offset..(offset + 15).min(region.data.len())].to_vec();

        match window[0] {
            0xcc => {
                self.cpu.rip = rip + 1;
                Exec::Stop(TargetEvent::Trapped)
            }
            0xf4 => {
                self.alive = false;
                Exec::Stop(TargetEvent::Exited(self.exit_code))
            }
            0xeb if window.len() >= 2 => {
                self.cpu.rip = (rip + 2).wrapping_add(window[1] as i8 as i64 as u64);
                Exec::Next
            }
            0xe9 if window.len() >= 5 => {
                let rel = i32::from_le_bytes([window[1], window[2], window[3], window[4]]);
                self.cpu.rip = (rip + 5).wrapping_add(rel as i64 as u64);
                Exec::Next
            }
            0xe8 if window.len() >= 5 => {
                let rel = i32::from_le_bytes([window[1], window[2], window[3], window[4]]);
                if let Exec::Stop(event) = self.push(rip + 5) {
                    return Exec::Stop(event);
                }
                self.cpu.rip = (rip + 5).wrapping_add(rel as i64 as u64);
                Exec::Next
            }
            0xc3 => match self.read_word(self.cpu.rsp) {
                Ok(ret) => {
                    self.cpu.rsp += 8;
                    self.cpu.rip = ret;
                    Exec::Next
                }
                Err(_) => Exec::Stop(TargetEvent::Signaled(Signal::SIGSEGV)),
            },
            _ => match self.cs.disasm_count(&window, rip, 1) {
                Ok(insns) if insns.len() == 1 => {
                    let len = insns.iter().next().map(|i| i.bytes().len()).unwrap_or(1);
                    self.cpu.rip = rip + len as u64;
                    Exec::Next
                }
                _ => Exec::Stop(TargetEvent::Signaled(Signal::SIGILL)),
            },
        }
    }
}

/// `jmp rel32` のバイト列
pub fn jmp_rel32(from: u64, to: u64) -> [u8; 5] {
    rel32(0xe9, from, to)
}

/// `call rel32` のバイト列
pub fn call_rel32(from: u64, to: u64) -> [u8; 5] {
    rel32(0xe8, from, to)
}

fn rel32(opcode: u8, from: u64, to: u64) -> [u8; 5] {
    let rel = (to as i64 - (from as i64 + 5)) as i32;
    let b = rel.to_le_bytes();
    [opcode, b[0], b[1], b[2], b[3]]
}

impl Target for MockTarget {
    fn pid(&self) -> i32 {
        4242
    }

    fn read_memory(&self, addr: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        if self.severed {
            return Err(anyhow!("ESRCH: No such process"));
        }
        let region = self
            .region(addr)
            .ok_or_else(|| anyhow!("EIO: unmapped address 0x{:x}", addr))?;
        let offset = (addr - region.start) as usize;
        if offset + len > region.data.len() {
            return Err(anyhow!("EIO: read crosses end of mapping at 0x{:x}", addr));
        }
        Ok(region.data[offset..offset + len].to_vec())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> anyhow::Result<()> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.visible && addr >= r.start && addr < r.end())
            .ok_or_else(|| anyhow!("EIO: unmapped address 0x{:x}", addr))?;
        let offset = (addr - region.start) as usize;
        if offset + data.len() > region.data.len() {
            return Err(anyhow!("EIO: write crosses end of mapping at 0x{:x}", addr));
        }
        region.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn cpu_state(&self) -> anyhow::Result<CpuState> {
        self.check_alive()?;
        Ok(self.cpu)
    }

    fn set_pc(&mut self, pc: u64) -> anyhow::Result<()> {
        self.check_alive()?;
        self.cpu.rip = pc;
        Ok(())
    }

    fn resume(&mut self, signal: Option<Signal>) -> anyhow::Result<()> {
        self.check_alive()?;
        if let Some(gate) = &self.gate {
            gate.recv().map_err(|_| anyhow!("gate closed"))?;
        }
        self.delivered.extend(signal);
        for _ in 0..MAX_RUN {
            if let Exec::Stop(event) = self.exec_one() {
                self.events.push_back(event);
                return Ok(());
            }
        }
        self.alive = false;
        self.events.push_back(TargetEvent::Killed(Signal::SIGKILL));
        Ok(())
    }

    fn step(&mut self, signal: Option<Signal>) -> anyhow::Result<()> {
        self.check_alive()?;
        self.delivered.extend(signal);
        let event = match self.exec_one() {
            Exec::Next => TargetEvent::Trapped,
            Exec::Stop(event) => event,
        };
        self.events.push_back(event);
        Ok(())
    }

    fn wait_event(&mut self) -> anyhow::Result<TargetEvent> {
        if self.severed {
            return Err(anyhow!("ECHILD: No child processes"));
        }
        self.events
            .pop_front()
            .ok_or_else(|| anyhow!("ECHILD: No child processes"))
    }

    fn mappings(&self) -> anyhow::Result<Vec<MemoryMapping>> {
        Ok(self
            .regions
            .iter()
            .filter(|r| r.visible)
            .map(|r| MemoryMapping {
                start: r.start,
                end: r.end(),
                readable: true,
                writable: !r.executable,
                executable: r.executable,
                offset: 0,
                pathname: r.path.clone(),
            })
            .collect())
    }

    fn entry_point(&self) -> anyhow::Result<u64> {
        Ok(self.entry)
    }

    fn set_watchpoint(
        &mut self,
        slot: usize,
        address: u64,
        len: usize,
        kind: WatchKind,
    ) -> anyhow::Result<()> {
        self.check_alive()?;
        dr7_bits(slot, address, len, kind)?;
        self.watches[slot] = Some((address, len, kind));
        Ok(())
    }

    fn clear_watchpoint(&mut self, slot: usize) -> anyhow::Result<()> {
        self.check_alive()?;
        if slot >= WATCHPOINT_SLOTS {
            return Err(anyhow!("No such debug register slot {}", slot));
        }
        self.watches[slot] = None;
        Ok(())
    }

    fn take_watchpoint_hit(&mut self) -> anyhow::Result<Option<usize>> {
        self.check_alive()?;
        Ok(self.watch_hit.take())
    }

    fn load_image(&self, path: &Path) -> anyhow::Result<ElfImage> {
        path.to_str()
            .and_then(|p| self.images.get(p))
            .cloned()
            .ok_or_else(|| anyhow!("no image for {}", path.display()))
    }

    fn kill(&mut self) -> anyhow::Result<()> {
        self.alive = false;
        Ok(())
    }

    fn detach(&mut self) -> anyhow::Result<()> {
        if let Some(snapshot) = &self.detach_snapshot {
            let regions = self
                .regions
                .iter()
                .filter(|r| r.visible)
                .map(|r| (r.start, r.data.clone()))
                .collect();
            *snapshot.lock().expect("snapshot lock") = regions;
        }
        self.alive = false;
        Ok(())
    }

    fn is_spawned(&self) -> bool {
        self.spawned
    }
}

/// 模擬ターゲットを生成するランチャー
pub struct MockLauncher {
    build: fn() -> MockTarget,
    gate: Option<Receiver<()>>,
    detach_snapshot: Option<MemorySnapshot>,
}

impl MockLauncher {
    pub fn new(build: fn() -> MockTarget) -> Self {
        Self {
            build,
            gate: None,
            detach_snapshot: None,
        }
    }

    /// 生成したターゲットは `resume` のたびに合図を1つ待つ
    pub fn with_gate(mut self, gate: Receiver<()>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// デタッチしたときのメモリを記録する
    pub fn with_detach_snapshot(mut self, snapshot: MemorySnapshot) -> Self {
        self.detach_snapshot = Some(snapshot);
        self
    }

    fn build(&mut self) -> MockTarget {
        let mut target = (self.build)();
        target.gate = self.gate.take();
        target.detach_snapshot = self.detach_snapshot.clone();
        target
    }
}

impl Launcher for MockLauncher {
    type Target = MockTarget;

    fn launch(&mut self, program: &Path, _args: &[String]) -> anyhow::Result<MockTarget> {
        if program.to_str() != Some(APP) {
            return Err(anyhow!("No such executable: {}", program.display()));
        }
        Ok(self.build())
    }

    fn attach(&mut self, _pid: i32) -> anyhow::Result<MockTarget> {
        let mut target = self.build();
        target.set_spawned(false);
        target.set_cpu(CpuState {
            rip: ENTRY + 2,
            rsp: STACK_TOP - 0x10,
            ..CpuState::default()
        });
        Ok(target)
    }
}
