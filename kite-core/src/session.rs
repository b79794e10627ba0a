//! デバッグセッション
//!
//! 1つのデバッグ対象との結び付きを表します。ターゲットのメモリ・レジスタを
//! 書き換えるのはこの型だけで、ブレークポイントテーブルやスタック巻き戻しには
//! ここから借用を渡します。

use crate::breakpoint::{Breakpoint, BreakpointId, BreakpointSpec, BreakpointTable, TrapOwner};
use crate::calls::{self, FunctionCall};
use crate::config::SessionConfig;
use crate::disasm::{Disassembler, Instruction};
use crate::modules::{ModuleInfo, ModuleMap};
use crate::unwind::{StackFrame, StackMemory, Unwinder};
use crate::watchpoint::{Watchpoint, WatchpointId, WatchpointTable};
use crate::{DebugError, Result};
use kite_target::{CpuState, Launcher, MemoryMapping, Signal, Target, TargetEvent, WatchKind};
use std::fmt;
use std::path::Path;

/// セッションの実行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Stopped,
    Exited,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunState::NotStarted => "not started",
            RunState::Running => "running",
            RunState::Stopped => "stopped",
            RunState::Exited => "exited",
        };
        f.write_str(text)
    }
}

/// 最後に停止・終了した理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 起動してエントリポイントで停止
    Entry,
    /// アタッチして停止
    Attached,
    /// ユーザーのブレークポイント
    Breakpoint(BreakpointId),
    /// ステップ実行の完了
    Step,
    /// ウォッチポイントの範囲にアクセスした（アクセスした命令の直後で停止）
    Watchpoint(WatchpointId),
    /// `continue_until_access` で指定したアドレスにアクセスした
    MemoryAccess(u64),
    /// シグナルを受けて停止（次の再開時に配送される）
    Signal(Signal),
    /// 終了コード
    Exited(i32),
    /// シグナルで終了
    Killed(Signal),
    /// デバッグ接続が失われた
    LostConnection,
}

impl StopReason {
    /// ターゲットがもう存在しない停止理由かどうか
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StopReason::Exited(_) | StopReason::Killed(_) | StopReason::LostConnection
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Entry => write!(f, "stopped at entry point"),
            StopReason::Attached => write!(f, "attached"),
            StopReason::Breakpoint(id) => write!(f, "breakpoint {}", id),
            StopReason::Step => write!(f, "step"),
            StopReason::Watchpoint(id) => write!(f, "watchpoint {}", id),
            StopReason::MemoryAccess(address) => write!(f, "memory access at 0x{:x}", address),
            StopReason::Signal(sig) => write!(f, "signal {}", sig),
            StopReason::Exited(code) => write!(f, "exited with code {}", code),
            StopReason::Killed(sig) => write!(f, "killed by {}", sig),
            StopReason::LostConnection => write!(f, "lost connection"),
        }
    }
}

/// セッションの状態のスナップショット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub pid: Option<i32>,
    pub state: RunState,
    pub last_stop: Option<StopReason>,
    /// プログラムのエントリポイント
    pub entry: Option<u64>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            pid: None,
            state: RunState::NotStarted,
            last_stop: None,
            entry: None,
        }
    }
}

/// 関数トレースで記録した命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub address: u64,
    /// `module!symbol+0xoff`
    pub symbol: Option<String>,
    /// オペランドの値を添えた命令
    pub text: String,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(symbol) => write!(f, "{} <{}>", self.text, symbol),
            None => f.write_str(&self.text),
        }
    }
}

/// デバッグセッション
pub struct Session<T: Target> {
    config: SessionConfig,
    target: Option<T>,
    pid: Option<i32>,
    state: RunState,
    last_stop: Option<StopReason>,
    entry: Option<u64>,
    breakpoints: BreakpointTable,
    watchpoints: WatchpointTable,
    /// 関数トレースの記録（取り出すまで溜まる）
    trace: Vec<TraceEntry>,
    modules: ModuleMap,
    disassembler: Disassembler,
    unwinder: Unwinder,
    /// 次の再開時に配送するシグナル
    pending_signal: Option<Signal>,
    /// モジュールロード通知のトラップ
    rendezvous: Option<u64>,
}

impl<T: Target> Session<T> {
    /// 新しいセッションを作成する（まだターゲットはない）
    pub fn new(config: SessionConfig) -> Result<Self> {
        Ok(Self {
            unwinder: Unwinder::new(config.max_stack_depth),
            config,
            target: None,
            pid: None,
            state: RunState::NotStarted,
            last_stop: None,
            entry: None,
            breakpoints: BreakpointTable::new(),
            watchpoints: WatchpointTable::new(),
            trace: Vec::new(),
            modules: ModuleMap::new(),
            disassembler: Disassembler::new()?,
            pending_signal: None,
            rendezvous: None,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn last_stop(&self) -> Option<StopReason> {
        self.last_stop
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            pid: self.pid,
            state: self.state,
            last_stop: self.last_stop,
            entry: self.entry,
        }
    }

    /// 実行可能ファイルを起動し、エントリポイントで停止させる
    pub fn start<L>(&mut self, launcher: &mut L, program: &Path, args: &[String]) -> Result<StopReason>
    where
        L: Launcher<Target = T>,
    {
        self.require_state(RunState::NotStarted, "start a target")?;

        let target = launcher
            .launch(program, args)
            .map_err(|e| launch_failure(program.display(), e))?;
        tracing::debug!(program = %program.display(), pid = target.pid(), "target launched");
        self.bind_target(target);

        match self.prepare_launched() {
            Ok(reason) => {
                self.last_stop = Some(reason);
                Ok(reason)
            }
            Err(e) => {
                // エントリに到達できなかったセッションは使えない
                // （先に終了していれば、その終了理由を残す）
                if self.target.is_some() {
                    self.drop_target(StopReason::LostConnection);
                }
                Err(launch_failure(program.display(), e))
            }
        }
    }

    /// 既存のプロセスにアタッチする
    pub fn attach<L>(&mut self, launcher: &mut L, pid: i32) -> Result<StopReason>
    where
        L: Launcher<Target = T>,
    {
        self.require_state(RunState::NotStarted, "attach")?;

        let target = launcher
            .attach(pid)
            .map_err(|e| launch_failure(format_args!("pid {}", pid), e))?;
        tracing::debug!(pid, "attached to target");
        self.bind_target(target);
        self.entry = self.target.as_ref().and_then(|t| t.entry_point().ok());

        if let Err(e) = self.on_module_event() {
            self.drop_target(StopReason::LostConnection);
            return Err(launch_failure(format_args!("pid {}", pid), e));
        }
        self.last_stop = Some(StopReason::Attached);
        Ok(StopReason::Attached)
    }

    fn bind_target(&mut self, target: T) {
        self.pid = Some(target.pid());
        self.target = Some(target);
        self.state = RunState::Stopped;
    }

    /// execve直後の停止からエントリポイントまで進める
    fn prepare_launched(&mut self) -> Result<StopReason> {
        let entry = self.target()?.entry_point()?;
        self.entry = Some(entry);

        self.on_module_event()?;

        let rip = self.target()?.cpu_state()?.rip;
        if !self.config.stop_at_entry || rip == entry {
            return Ok(StopReason::Entry);
        }

        let Self {
            target, breakpoints, ..
        } = self;
        if let Some(target) = target.as_mut() {
            breakpoints.claim(TrapOwner::Entry, entry, target)?;
        }

        let reason = self.run(true)?;
        if let Some(target) = self.target.as_mut() {
            self.breakpoints.release(TrapOwner::Entry, entry, target)?;
        }

        match reason {
            StopReason::Entry => {
                tracing::debug!(entry = format_args!("0x{:x}", entry), "reached entry point");
                Ok(StopReason::Entry)
            }
            other => Err(anyhow::anyhow!("target did not reach its entry point ({})", other).into()),
        }
    }

    /// ブレークポイントを追加する
    ///
    /// 起動前、またはシンボルを定義するモジュールがまだロードされていない場合は
    /// 登録だけ行い、後で解決できた時点でトラップを設置します。
    pub fn add_breakpoint(&mut self, spec: BreakpointSpec) -> Result<BreakpointId> {
        self.insert_breakpoint(spec, false)
    }

    /// 最初のヒットで削除される一時ブレークポイントを追加する
    pub fn add_temporary_breakpoint(&mut self, spec: BreakpointSpec) -> Result<BreakpointId> {
        self.insert_breakpoint(spec, true)
    }

    fn insert_breakpoint(&mut self, spec: BreakpointSpec, once: bool) -> Result<BreakpointId> {
        match self.state {
            RunState::NotStarted => {
                let id = self.breakpoints.register(spec, once);
                tracing::debug!(id, "breakpoint deferred until launch");
                return Ok(id);
            }
            RunState::Stopped => {}
            state => {
                return Err(DebugError::InvalidState {
                    operation: "add a breakpoint",
                    state,
                })
            }
        }

        let id = self.breakpoints.register(spec.clone(), once);
        if self.breakpoints.get(id).is_some_and(|bp| bp.installed) {
            return Ok(id);
        }

        let Some(address) = resolve_spec(&self.modules, &spec) else {
            tracing::debug!(id, %spec, "breakpoint pending until its module loads");
            return Ok(id);
        };

        let Self {
            target, breakpoints, ..
        } = self;
        let Some(target) = target.as_mut() else {
            return Ok(id);
        };
        if let Err(e) = breakpoints.install(id, address, target) {
            breakpoints.remove(id, target)?;
            return Err(e);
        }
        tracing::debug!(id, %spec, address = format_args!("0x{:x}", address), "breakpoint installed");
        Ok(id)
    }

    /// ブレークポイントを削除する（参照カウントを1つ減らす）
    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<()> {
        self.require_state(RunState::Stopped, "remove a breakpoint")?;
        let Self {
            target, breakpoints, ..
        } = self;
        if let Some(target) = target.as_mut() {
            if breakpoints.remove(id, target)? {
                tracing::debug!(id, "breakpoint removed");
            }
        }
        Ok(())
    }

    /// ブレークポイントを有効化・無効化する（見つからなければfalse）
    pub fn set_breakpoint_enabled(&mut self, id: BreakpointId, enabled: bool) -> Result<bool> {
        let operation = if enabled {
            "enable a breakpoint"
        } else {
            "disable a breakpoint"
        };
        self.require_state(RunState::Stopped, operation)?;

        let found = {
            let Self {
                target, breakpoints, ..
            } = self;
            match target.as_mut() {
                Some(target) => breakpoints.set_enabled(id, enabled, target)?,
                None => false,
            }
        };
        if found && enabled {
            self.bind_pending();
        }
        Ok(found)
    }

    /// 登録済みのブレークポイント
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.all().cloned().collect()
    }

    /// 1命令だけ実行する
    pub fn step_instruction(&mut self) -> Result<StopReason> {
        self.require_state(RunState::Stopped, "step")?;

        let result = match self.single_step() {
            Ok(TargetEvent::Trapped) => self.after_step(),
            Ok(other) => Ok(self.settle(other)),
            Err(e) => Err(e),
        };

        let reason = self.recover(result)?;
        self.last_stop = Some(reason);
        self.report_unresolved(reason)
    }

    /// 次のブレークポイント・シグナル・終了まで実行を継続する
    pub fn continue_execution(&mut self) -> Result<StopReason> {
        self.require_state(RunState::Stopped, "continue")?;

        self.state = RunState::Running;
        let result = self.run(false);
        let reason = self.recover(result)?;
        self.last_stop = Some(reason);
        self.report_unresolved(reason)
    }

    /// アドレスの `len` バイトが読み書きされるまで実行を継続する
    ///
    /// 一時的なウォッチポイントを使い、停止後に解除します。
    pub fn continue_until_access(&mut self, address: u64, len: usize) -> Result<StopReason> {
        self.require_state(RunState::Stopped, "continue until a memory access")?;
        let id = {
            let Self {
                target, watchpoints, ..
            } = self;
            let target = target.as_mut().ok_or(DebugError::LostConnection {
                reason: "no target".to_string(),
            })?;
            watchpoints.add(address, len, WatchKind::ReadWrite, target)?
        };

        let result = self.continue_execution();

        let Self {
            target, watchpoints, ..
        } = self;
        if let Some(target) = target.as_mut() {
            if let Err(e) = watchpoints.remove(id, target) {
                tracing::warn!("failed to clear temporary watchpoint: {}", e);
            }
        }

        match result {
            Ok(StopReason::Watchpoint(hit)) if hit == id => {
                let reason = StopReason::MemoryAccess(address);
                self.last_stop = Some(reason);
                Ok(reason)
            }
            other => other,
        }
    }

    /// ウォッチポイントを設定する（長さは1/2/4/8バイト）
    pub fn add_watchpoint(&mut self, address: u64, len: usize, kind: WatchKind) -> Result<WatchpointId> {
        self.require_state(RunState::Stopped, "set a watchpoint")?;
        let Self {
            target, watchpoints, ..
        } = self;
        let target = target.as_mut().ok_or(DebugError::LostConnection {
            reason: "no target".to_string(),
        })?;
        watchpoints.add(address, len, kind, target)
    }

    /// ウォッチポイントを削除する（見つからなければfalse）
    pub fn remove_watchpoint(&mut self, id: WatchpointId) -> Result<bool> {
        self.require_state(RunState::Stopped, "remove a watchpoint")?;
        let Self {
            target, watchpoints, ..
        } = self;
        match target.as_mut() {
            Some(target) => watchpoints.remove(id, target),
            None => Ok(false),
        }
    }

    /// 設定中のウォッチポイント
    pub fn watchpoints(&self) -> Vec<Watchpoint> {
        self.watchpoints.all()
    }

    /// 関数の全命令にトレース用のトラップを置く
    ///
    /// 以降の実行でトラップに来るたびに、オペランドの値を添えた命令を記録して実行を続けます。
    /// 置いたトラップの数を返します。
    pub fn trace_function(&mut self, spec: BreakpointSpec) -> Result<usize> {
        self.require_state(RunState::Stopped, "trace a function")?;

        let address = resolve_spec(&self.modules, &spec)
            .ok_or_else(|| DebugError::UnresolvedBreakpoint { specs: vec![spec.clone()] })?;
        let function = self
            .modules
            .function_at(address)
            .filter(|f| f.size > 0)
            .ok_or_else(|| anyhow::anyhow!("No sized function symbol at 0x{:x}", address))?;

        let end = function.start + function.size;
        let mut at = function.start;
        let mut count = 0;
        while at < end {
            let length = match self.decode_at(at) {
                Ok(insn) => insn.length,
                Err(DebugError::DecodeError { .. }) => {
                    tracing::debug!(address = format_args!("0x{:x}", at), "trace stops at undecodable bytes");
                    break;
                }
                Err(e) => return Err(e),
            };
            let Self {
                target, breakpoints, ..
            } = self;
            if let Some(target) = target.as_mut() {
                breakpoints.claim(TrapOwner::Trace, at, target)?;
            }
            count += 1;
            at += length as u64;
        }

        tracing::debug!(function = %function.name, count, "function traced");
        Ok(count)
    }

    /// トレース用のトラップをすべて外す（外した数を返す）
    pub fn stop_tracing(&mut self) -> Result<usize> {
        self.require_state(RunState::Stopped, "stop tracing")?;
        let Self {
            target, breakpoints, ..
        } = self;
        match target.as_mut() {
            Some(target) => breakpoints.release_owner(TrapOwner::Trace, target),
            None => Ok(0),
        }
    }

    /// 記録したトレースを取り出す
    pub fn take_trace(&mut self) -> Vec<TraceEntry> {
        std::mem::take(&mut self.trace)
    }

    /// 現在のコールスタック（内側から順）
    pub fn current_stack(&self) -> Result<Vec<StackFrame>> {
        self.require_state(RunState::Stopped, "unwind the stack")?;
        let target = self.target()?;
        let cpu = target.cpu_state()?;
        let view = StackView {
            target,
            mappings: target.mappings()?,
            modules: &self.modules,
        };
        Ok(self.unwinder.unwind(&cpu, &view))
    }

    /// アドレスの命令をデコードする（設置中のトラップは元の命令として見える）
    pub fn render_instruction_at(&self, address: u64) -> Result<Instruction> {
        self.require_state(RunState::Stopped, "decode an instruction")?;
        self.decode_at(address)
    }

    fn decode_at(&self, address: u64) -> Result<Instruction> {
        let target = self.target()?;
        let mappings = target.mappings()?;

        let Some(mapping) = mappings.iter().find(|m| m.contains(address)) else {
            return Err(DebugError::DecodeError {
                address,
                bytes: Vec::new(),
            });
        };

        let len = self
            .config
            .decode_window
            .min((mapping.end - address) as usize);
        let mut bytes = if mapping.readable {
            target.read_memory(address, len)?
        } else {
            Vec::new()
        };
        self.breakpoints.unpatch(address, &mut bytes);

        if !mapping.executable || bytes.is_empty() {
            return Err(DebugError::DecodeError { address, bytes });
        }
        self.disassembler.decode(&bytes, address)
    }

    /// 現在の命令を `0x{addr:x} {text}` の形式で返す
    pub fn current_instruction_string(&self) -> Result<String> {
        self.require_state(RunState::Stopped, "decode an instruction")?;
        let rip = self.target()?.cpu_state()?.rip;
        Ok(self.render_instruction_at(rip)?.to_string())
    }

    /// 現在の命令を、オペランドの値を添えて返す
    ///
    /// `0x401000 mov rax, qword ptr [rbp - 8] - rax=0x1 - mem[0x7fe8]=0x2a` のような形式です。
    pub fn current_instruction_annotated(&self) -> Result<String> {
        self.require_state(RunState::Stopped, "decode an instruction")?;
        let rip = self.target()?.cpu_state()?.rip;
        self.annotated_at(rip)
    }

    fn annotated_at(&self, address: u64) -> Result<String> {
        let insn = self.decode_at(address)?;
        let cpu = self.target()?.cpu_state()?;
        let notes = insn.annotate(&cpu, |addr, len| self.unpatched_read(addr, len).ok());
        Ok(format!("{}{}", insn, notes))
    }

    /// 関数の先頭で停止しているときに、呼び出しの引数を復元する
    ///
    /// 省略時は現在の命令のアドレスを使います。関数が分からなければNoneを返します。
    pub fn function_call_at(&self, address: Option<u64>) -> Result<Option<FunctionCall>> {
        self.require_state(RunState::Stopped, "decode a function call")?;
        let cpu = self.target()?.cpu_state()?;
        let address = address.unwrap_or(cpu.rip);
        let Some(function) = self.modules.function_at(address) else {
            return Ok(None);
        };
        Ok(Some(calls::decode_call(&function.name, &cpu, |addr, len| {
            self.unpatched_read(addr, len).ok()
        })))
    }

    /// メモリを読む（トラップは元のバイトに戻して返す）
    pub fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.require_state(RunState::Stopped, "read memory")?;
        kite_target::memory::check_read_len(address as usize, len)?;
        self.unpatched_read(address, len)
    }

    fn unpatched_read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut bytes = self.target()?.read_memory(address, len)?;
        self.breakpoints.unpatch(address, &mut bytes);
        Ok(bytes)
    }

    /// レジスタのスナップショット
    pub fn registers(&self) -> Result<CpuState> {
        self.require_state(RunState::Stopped, "read registers")?;
        Ok(self.target()?.cpu_state()?)
    }

    /// アドレスを `module!symbol+0xoff` の形式で表す
    pub fn symbolize(&self, address: u64) -> Option<String> {
        self.modules.symbolize(address)
    }

    /// ロード済みモジュールの一覧
    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.modules.modules()
    }

    /// ターゲットを終了させる
    pub fn kill(&mut self) -> Result<StopReason> {
        match self.state {
            RunState::Exited => {
                return Ok(self.last_stop.unwrap_or(StopReason::Killed(Signal::SIGKILL)))
            }
            RunState::NotStarted => {
                return Err(DebugError::InvalidState {
                    operation: "kill the target",
                    state: self.state,
                })
            }
            _ => {}
        }

        if let Some(target) = self.target.as_mut() {
            if let Err(e) = target.kill() {
                tracing::warn!("failed to kill target: {:#}", e);
            }
        }
        let reason = StopReason::Killed(Signal::SIGKILL);
        self.drop_target(reason);
        Ok(reason)
    }

    /// セッションを終える
    ///
    /// アタッチしたプロセスはトラップを外してからデタッチし、起動したプロセスは終了させます。
    pub fn shutdown(&mut self) {
        let Some(mut target) = self.target.take() else {
            return;
        };
        if target.is_spawned() {
            if let Err(e) = target.kill() {
                tracing::warn!("failed to kill target: {:#}", e);
            }
        } else {
            if let Err(e) = self.breakpoints.disarm_all(&mut target) {
                tracing::warn!("failed to remove traps before detaching: {}", e);
            }
            if let Err(e) = self.watchpoints.clear_all(&mut target) {
                tracing::warn!("failed to clear watchpoints before detaching: {}", e);
            }
            if let Err(e) = target.detach() {
                tracing::warn!("failed to detach: {:#}", e);
            }
        }
        self.breakpoints.forget_all();
        self.watchpoints.forget_all();
        self.state = RunState::Exited;
    }

    #[cfg(test)]
    pub(crate) fn target_mut(&mut self) -> Option<&mut T> {
        self.target.as_mut()
    }

    fn target(&self) -> Result<&T> {
        self.target.as_ref().ok_or(DebugError::InvalidState {
            operation: "access the target",
            state: self.state,
        })
    }

    fn require_state(&self, required: RunState, operation: &'static str) -> Result<()> {
        if self.state == required {
            Ok(())
        } else {
            Err(DebugError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// rip上のトラップを外して1命令実行し、トラップを戻す
    fn single_step(&mut self) -> Result<TargetEvent> {
        let signal = self.pending_signal.take();
        let Self {
            target, breakpoints, ..
        } = self;
        let Some(target) = target.as_mut() else {
            return Err(DebugError::LostConnection {
                reason: "no target".to_string(),
            });
        };

        let rip = target.cpu_state()?.rip;
        let on_trap = breakpoints.has_site(rip);
        if on_trap {
            breakpoints.disarm_at(rip, target)?;
        }

        target.step(signal)?;
        let event = target.wait_event()?;

        if on_trap && !event.is_terminal() {
            breakpoints.rearm_at(rip, target)?;
        }
        Ok(event)
    }

    /// ステップ先がローダのフックならモジュール一覧を更新する
    fn after_step(&mut self) -> Result<StopReason> {
        let rip = self.target()?.cpu_state()?.rip;
        if self.breakpoints.owners_at(rip).contains(&TrapOwner::ModuleLoad) {
            self.on_module_event()?;
        }
        if let Some(id) = self.watchpoint_hit()? {
            return Ok(StopReason::Watchpoint(id));
        }
        Ok(StopReason::Step)
    }

    /// 直前の停止がウォッチポイントによるものならそのID
    fn watchpoint_hit(&mut self) -> Result<Option<WatchpointId>> {
        let Some(target) = self.target.as_mut() else {
            return Ok(None);
        };
        let Some(slot) = target.take_watchpoint_hit()? else {
            return Ok(None);
        };
        let id = self.watchpoints.by_slot(slot).map(|wp| wp.id);
        if let Some(id) = id {
            tracing::debug!(id, slot, "watchpoint hit");
        }
        Ok(id)
    }

    /// ターゲットが終了していたら、一度も解決されなかったブレークポイントを報告する
    fn report_unresolved(&mut self, reason: StopReason) -> Result<StopReason> {
        if reason.is_terminal() {
            let specs = self.breakpoints.take_unreported();
            if !specs.is_empty() {
                return Err(DebugError::UnresolvedBreakpoint { specs });
            }
        }
        Ok(reason)
    }

    /// トレース用のトラップで止まった命令を記録する
    fn record_trace(&mut self, address: u64) {
        match self.annotated_at(address) {
            Ok(text) => {
                let entry = TraceEntry {
                    address,
                    symbol: self.modules.symbolize(address),
                    text,
                };
                tracing::debug!(%entry, "traced");
                self.trace.push(entry);
            }
            Err(e) => tracing::warn!(
                address = format_args!("0x{:x}", address),
                "cannot record traced instruction: {}",
                e
            ),
        }
    }

    /// 停止理由が得られるまで実行を続ける
    ///
    /// `before_entry` の間はエントリのトラップで止まり、ユーザーのブレークポイントは通過します。
    fn run(&mut self, before_entry: bool) -> Result<StopReason> {
        loop {
            let rip = self.target()?.cpu_state()?.rip;
            if self.breakpoints.has_site(rip) {
                match self.single_step()? {
                    TargetEvent::Trapped => {
                        if let Some(id) = self.watchpoint_hit()? {
                            self.state = RunState::Stopped;
                            return Ok(StopReason::Watchpoint(id));
                        }
                    }
                    other => return Ok(self.settle(other)),
                }
            }

            let signal = self.pending_signal.take();
            let event = {
                let target = self.target.as_mut().ok_or(DebugError::LostConnection {
                    reason: "no target".to_string(),
                })?;
                target.resume(signal)?;
                target.wait_event()?
            };

            if event != TargetEvent::Trapped {
                return Ok(self.settle(event));
            }
            if let Some(id) = self.watchpoint_hit()? {
                self.state = RunState::Stopped;
                return Ok(StopReason::Watchpoint(id));
            }

            let pc = self.target()?.cpu_state()?.rip;
            let address = pc.wrapping_sub(1);
            if !self.breakpoints.is_armed_at(address) {
                // 自前のトラップではないINT3
                self.state = RunState::Stopped;
                return Ok(StopReason::Signal(Signal::SIGTRAP));
            }

            {
                let Self {
                    target, breakpoints, ..
                } = self;
                if let Some(target) = target.as_mut() {
                    target.set_pc(address)?;
                    breakpoints.disarm_at(address, target)?;
                }
            }

            let owners = self.breakpoints.owners_at(address);
            if owners.contains(&TrapOwner::ModuleLoad) {
                self.on_module_event()?;
            }
            if before_entry && owners.contains(&TrapOwner::Entry) {
                self.state = RunState::Stopped;
                return Ok(StopReason::Entry);
            }
            if owners.contains(&TrapOwner::Trace) {
                self.record_trace(address);
            }
            if let Some(id) = self.breakpoints.user_hit(address) {
                if before_entry {
                    tracing::debug!(id, "breakpoint hit before entry point, continuing");
                    continue;
                }
                if self.breakpoints.is_once(id) {
                    let Self {
                        target, breakpoints, ..
                    } = self;
                    if let Some(target) = target.as_mut() {
                        breakpoints.retire(id, target)?;
                    }
                    tracing::debug!(id, "temporary breakpoint removed after hit");
                }
                tracing::debug!(id, address = format_args!("0x{:x}", address), "breakpoint hit");
                self.state = RunState::Stopped;
                return Ok(StopReason::Breakpoint(id));
            }
        }
    }

    /// 停止・終了イベントをセッションの状態に反映する
    fn settle(&mut self, event: TargetEvent) -> StopReason {
        match event {
            TargetEvent::Trapped => {
                self.state = RunState::Stopped;
                StopReason::Step
            }
            TargetEvent::Signaled(sig) => {
                tracing::debug!(signal = %sig, "target stopped by signal");
                self.pending_signal = Some(sig);
                self.state = RunState::Stopped;
                StopReason::Signal(sig)
            }
            TargetEvent::Exited(code) => {
                tracing::debug!(code, "target exited");
                let reason = StopReason::Exited(code);
                self.drop_target(reason);
                reason
            }
            TargetEvent::Killed(sig) => {
                tracing::debug!(signal = %sig, "target killed");
                let reason = StopReason::Killed(sig);
                self.drop_target(reason);
                reason
            }
        }
    }

    /// ptrace/waitpidの失敗をデバッグ接続の喪失として扱う
    fn recover(&mut self, result: Result<StopReason>) -> Result<StopReason> {
        match result {
            Err(DebugError::Target(e)) => Err(self.lose(e)),
            Err(e) => {
                if self.state == RunState::Running {
                    self.state = RunState::Stopped;
                }
                Err(e)
            }
            ok => ok,
        }
    }

    fn lose(&mut self, error: anyhow::Error) -> DebugError {
        tracing::warn!(pid = ?self.pid, "lost connection to target: {:#}", error);
        self.drop_target(StopReason::LostConnection);
        DebugError::LostConnection {
            reason: format!("{:#}", error),
        }
    }

    fn drop_target(&mut self, reason: StopReason) {
        self.breakpoints.forget_all();
        self.watchpoints.forget_all();
        self.modules.clear();
        self.rendezvous = None;
        self.pending_signal = None;
        self.target = None;
        self.state = RunState::Exited;
        self.last_stop = Some(reason);
    }

    /// モジュールの追加・削除を反映し、保留中のブレークポイントを解決する
    fn on_module_event(&mut self) -> Result<()> {
        let target = self.target.as_ref().ok_or(DebugError::LostConnection {
            reason: "no target".to_string(),
        })?;
        let changes = self.modules.refresh(target)?;

        for module in &changes.unloaded {
            let internal = self.breakpoints.forget_range(module.start, module.end);
            if internal.contains(&TrapOwner::ModuleLoad) {
                self.rendezvous = None;
            }
        }

        if self.config.follow_module_loads && self.rendezvous.is_none() {
            if let Some(address) = self.modules.loader_rendezvous() {
                let Self {
                    target, breakpoints, ..
                } = self;
                if let Some(target) = target.as_mut() {
                    breakpoints.claim(TrapOwner::ModuleLoad, address, target)?;
                    tracing::debug!(address = format_args!("0x{:x}", address), "module load hook installed");
                    self.rendezvous = Some(address);
                }
            }
        }

        if !changes.loaded.is_empty() || !changes.unloaded.is_empty() {
            self.bind_pending();
        }
        Ok(())
    }

    /// 未設置のブレークポイントを解決できたものから設置する
    fn bind_pending(&mut self) {
        let Self {
            target,
            breakpoints,
            modules,
            ..
        } = self;
        let Some(target) = target.as_mut() else {
            return;
        };

        for (id, spec) in breakpoints.unbound() {
            let Some(address) = resolve_spec(modules, &spec) else {
                continue;
            };
            match breakpoints.install(id, address, target) {
                Ok(()) => tracing::debug!(
                    id,
                    %spec,
                    address = format_args!("0x{:x}", address),
                    "breakpoint resolved"
                ),
                Err(e) => tracing::debug!(id, %spec, "breakpoint not installable yet: {}", e),
            }
        }
    }
}

impl<T: Target> Drop for Session<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve_spec(modules: &ModuleMap, spec: &BreakpointSpec) -> Option<u64> {
    match spec {
        BreakpointSpec::Address(address) => Some(*address),
        BreakpointSpec::Symbol { module, name } => modules.resolve(module.as_deref(), name),
    }
}

fn launch_failure(program: impl fmt::Display, reason: impl fmt::Display) -> DebugError {
    DebugError::LaunchFailure {
        program: program.to_string(),
        reason: reason.to_string(),
    }
}

/// スタック巻き戻し用のターゲットの見え方
struct StackView<'a, T: Target> {
    target: &'a T,
    mappings: Vec<MemoryMapping>,
    modules: &'a ModuleMap,
}

impl<T: Target> StackMemory for StackView<'_, T> {
    fn read_word(&self, addr: u64) -> Option<u64> {
        self.target.read_word(addr).ok()
    }

    fn is_code(&self, addr: u64) -> bool {
        self.mappings
            .iter()
            .any(|m| m.executable && m.contains(addr))
    }

    fn is_function_start(&self, addr: u64) -> bool {
        self.modules.is_function_start(addr)
    }

    fn symbolize(&self, addr: u64) -> Option<String> {
        self.modules.symbolize(addr)
    }
}
