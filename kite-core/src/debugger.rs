//! デバッガのフロントエンド
//!
//! 各操作はイベントループへ要求を送り、応答を待つだけの薄いラッパーです。
//! 待機は非同期（`.await`）で、呼び出し側のスレッドはブロックしません。
//!
//! 実行制御（起動・ステップ・継続など）が進行中の間、ターゲットに触れる操作は
//! キューに積まずに [`RunState::Running`] の [`DebugError::InvalidState`] で拒否します。

use crate::breakpoint::{Breakpoint, BreakpointId, BreakpointSpec};
use crate::calls::FunctionCall;
use crate::config::SessionConfig;
use crate::disasm::Instruction;
use crate::event_loop::{self, Request};
use crate::modules::ModuleInfo;
use crate::session::{RunState, SessionStatus, StopReason, TraceEntry};
use crate::unwind::StackFrame;
use crate::watchpoint::{Watchpoint, WatchpointId};
use crate::{DebugError, Result};
use kite_target::{CpuState, Launcher, PtraceLauncher, WatchKind};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot, watch};

/// デバッガ
pub struct Debugger {
    requests: Option<mpsc::Sender<Request>>,
    /// 実行制御の操作が進行中か
    running: AtomicBool,
    /// イベントループが応答のたびに更新する状態
    status: watch::Receiver<SessionStatus>,
    worker: Option<JoinHandle<()>>,
}

/// 実行中フラグを保持している間だけ立てておくガード
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Debugger {
    /// ptraceで実プロセスを扱うデバッガを作成する
    pub fn spawn(config: SessionConfig) -> Result<Self> {
        Self::with_launcher(config, PtraceLauncher)
    }

    /// 任意のランチャーでデバッガを作成する
    pub fn with_launcher<L>(config: SessionConfig, launcher: L) -> Result<Self>
    where
        L: Launcher + Send + 'static,
    {
        let event_loop = event_loop::spawn(config, launcher)?;
        Ok(Self {
            requests: Some(event_loop.requests),
            running: AtomicBool::new(false),
            status: event_loop.status,
            worker: Some(event_loop.worker),
        })
    }

    /// 実行可能ファイルを起動し、エントリポイントで停止させる
    pub async fn init(&self, program: impl AsRef<Path>) -> Result<StopReason> {
        self.launch(program, &[]).await
    }

    /// 引数付きで実行可能ファイルを起動する
    pub async fn launch(&self, program: impl AsRef<Path>, args: &[String]) -> Result<StopReason> {
        let program = program.as_ref().to_path_buf();
        let args = args.to_vec();
        let _running = self.begin_control("launch")?;
        self.call(|reply| Request::Launch(program, args, reply)).await?
    }

    /// 既存のプロセスにアタッチする
    pub async fn attach(&self, pid: i32) -> Result<StopReason> {
        let _running = self.begin_control("attach")?;
        self.call(|reply| Request::Attach(pid, reply)).await?
    }

    /// ブレークポイントを追加する
    ///
    /// `0x401000`、`open`、`libc.so.6!open` の形式を受け付けます。
    pub async fn add_breakpoint(&self, spec: &str) -> Result<BreakpointId> {
        let spec: BreakpointSpec = spec.parse()?;
        self.add_breakpoint_spec(spec).await
    }

    /// 解析済みの指定でブレークポイントを追加する
    pub async fn add_breakpoint_spec(&self, spec: BreakpointSpec) -> Result<BreakpointId> {
        self.ensure_idle("add a breakpoint")?;
        self.call(|reply| Request::AddBreakpoint(spec, reply)).await?
    }

    /// 最初のヒットで削除される一時ブレークポイントを追加する
    pub async fn add_temporary_breakpoint(&self, spec: &str) -> Result<BreakpointId> {
        let spec: BreakpointSpec = spec.parse()?;
        self.ensure_idle("add a breakpoint")?;
        self.call(|reply| Request::AddTemporaryBreakpoint(spec, reply))
            .await?
    }

    /// ブレークポイントを削除する
    pub async fn remove_breakpoint(&self, id: BreakpointId) -> Result<()> {
        self.ensure_idle("remove a breakpoint")?;
        self.call(|reply| Request::RemoveBreakpoint(id, reply)).await?
    }

    /// ブレークポイントを有効化する（見つからなければfalse）
    pub async fn enable_breakpoint(&self, id: BreakpointId) -> Result<bool> {
        self.ensure_idle("enable a breakpoint")?;
        self.call(|reply| Request::SetBreakpointEnabled(id, true, reply))
            .await?
    }

    /// ブレークポイントを無効化する（見つからなければfalse）
    pub async fn disable_breakpoint(&self, id: BreakpointId) -> Result<bool> {
        self.ensure_idle("disable a breakpoint")?;
        self.call(|reply| Request::SetBreakpointEnabled(id, false, reply))
            .await?
    }

    /// 登録済みのブレークポイント
    pub async fn breakpoints(&self) -> Result<Vec<Breakpoint>> {
        self.call(Request::Breakpoints).await
    }

    /// 1命令だけ実行する
    pub async fn step(&self) -> Result<StopReason> {
        let _running = self.begin_control("step")?;
        self.call(Request::Step).await?
    }

    /// 実行を継続する
    pub async fn continue_execution(&self) -> Result<StopReason> {
        let _running = self.begin_control("continue")?;
        self.call(Request::Continue).await?
    }

    /// アドレスの `len` バイトが読み書きされるまで実行を継続する
    pub async fn continue_until_access(&self, address: u64, len: usize) -> Result<StopReason> {
        let _running = self.begin_control("continue until a memory access")?;
        self.call(|reply| Request::ContinueUntilAccess(address, len, reply))
            .await?
    }

    /// ウォッチポイントを設定する
    pub async fn add_watchpoint(
        &self,
        address: u64,
        len: usize,
        kind: WatchKind,
    ) -> Result<WatchpointId> {
        self.ensure_idle("set a watchpoint")?;
        self.call(|reply| Request::AddWatchpoint(address, len, kind, reply))
            .await?
    }

    /// ウォッチポイントを削除する（見つからなければfalse）
    pub async fn remove_watchpoint(&self, id: WatchpointId) -> Result<bool> {
        self.ensure_idle("remove a watchpoint")?;
        self.call(|reply| Request::RemoveWatchpoint(id, reply)).await?
    }

    /// 設定中のウォッチポイント
    pub async fn watchpoints(&self) -> Result<Vec<Watchpoint>> {
        self.call(Request::Watchpoints).await
    }

    /// 関数の全命令をトレースする（置いたトラップの数を返す）
    pub async fn trace_function(&self, spec: &str) -> Result<usize> {
        let spec: BreakpointSpec = spec.parse()?;
        self.ensure_idle("trace a function")?;
        self.call(|reply| Request::TraceFunction(spec, reply)).await?
    }

    /// トレースをやめる
    pub async fn stop_tracing(&self) -> Result<usize> {
        self.ensure_idle("stop tracing")?;
        self.call(Request::StopTracing).await?
    }

    /// 記録したトレースを取り出す
    pub async fn take_trace(&self) -> Result<Vec<TraceEntry>> {
        self.call(Request::TakeTrace).await
    }

    /// 現在のコールスタック（内側から順）
    pub async fn current_stack(&self) -> Result<Vec<StackFrame>> {
        self.ensure_idle("unwind the stack")?;
        self.call(Request::Stack).await?
    }

    /// 最も内側のスタックフレーム
    pub async fn current_stack_frame(&self) -> Result<Option<StackFrame>> {
        Ok(self.current_stack().await?.into_iter().next())
    }

    /// 現在の命令を `0x{addr:x} {text}` の形式で返す
    pub async fn current_instruction_string(&self) -> Result<String> {
        self.ensure_idle("decode an instruction")?;
        self.call(Request::CurrentInstruction).await?
    }

    /// 現在の命令をオペランドの値付きで返す
    pub async fn current_instruction_annotated(&self) -> Result<String> {
        self.ensure_idle("decode an instruction")?;
        self.call(Request::AnnotatedInstruction).await?
    }

    /// アドレスの命令をデコードする
    pub async fn render_instruction_at(&self, address: u64) -> Result<Instruction> {
        self.ensure_idle("decode an instruction")?;
        self.call(|reply| Request::RenderInstruction(address, reply))
            .await?
    }

    /// 関数の先頭で停止しているときの呼び出しを復元する
    pub async fn function_call_at(&self, address: Option<u64>) -> Result<Option<FunctionCall>> {
        self.ensure_idle("decode a function call")?;
        self.call(|reply| Request::FunctionCall(address, reply))
            .await?
    }

    /// メモリを読む
    pub async fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_idle("read memory")?;
        self.call(|reply| Request::ReadMemory(address, len, reply))
            .await?
    }

    /// レジスタを読む
    pub async fn registers(&self) -> Result<CpuState> {
        self.ensure_idle("read registers")?;
        self.call(Request::Registers).await?
    }

    /// アドレスを `module!symbol+0xoff` の形式で表す
    pub async fn symbolize(&self, address: u64) -> Result<Option<String>> {
        self.call(|reply| Request::Symbolize(address, reply)).await
    }

    /// ロード済みモジュールの一覧
    pub async fn modules(&self) -> Result<Vec<ModuleInfo>> {
        self.call(Request::Modules).await
    }

    /// セッションの状態
    ///
    /// イベントループを待たずに返します。実行制御の最中は `Running` になります。
    pub fn status(&self) -> SessionStatus {
        let mut status = self.status.borrow().clone();
        if self.running.load(Ordering::Acquire) && status.state != RunState::Exited {
            status.state = RunState::Running;
        }
        status
    }

    /// ターゲットを終了させる
    pub async fn kill(&self) -> Result<StopReason> {
        let _running = self.begin_control("kill the target")?;
        self.call(Request::Kill).await?
    }

    /// 実行中フラグを立てる（すでに立っていれば拒否）
    fn begin_control(&self, operation: &'static str) -> Result<Running<'_>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(running(operation));
        }
        Ok(Running(&self.running))
    }

    fn ensure_idle(&self, operation: &'static str) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(running(operation));
        }
        Ok(())
    }

    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Request) -> Result<R> {
        let requests = self.requests.as_ref().ok_or_else(event_loop_gone)?;
        let (reply, response) = oneshot::channel();
        requests
            .send(make(reply))
            .await
            .map_err(|_| event_loop_gone())?;
        response.await.map_err(|_| event_loop_gone())
    }
}

impl Drop for Debugger {
    /// イベントループを止め、ターゲットを片付け終わるまで待つ
    fn drop(&mut self) {
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("event loop thread panicked");
            }
        }
    }
}

fn running(operation: &'static str) -> DebugError {
    DebugError::InvalidState {
        operation,
        state: RunState::Running,
    }
}

fn event_loop_gone() -> DebugError {
    DebugError::LostConnection {
        reason: "event loop is not running".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLauncher, MockTarget, APP, ENTRY, ENTRY_SYMBOL};

    fn debugger() -> Debugger {
        Debugger::with_launcher(SessionConfig::default(), MockLauncher::new(MockTarget::program))
            .unwrap()
    }

    #[tokio::test]
    async fn test_script_flow() {
        let dbg = debugger();
        let id = dbg.add_breakpoint("EntrySymbol").await.unwrap();
        assert_eq!(dbg.init(APP).await.unwrap(), StopReason::Entry);

        let frame = dbg.current_stack_frame().await.unwrap().unwrap();
        assert_eq!(frame.instruction_pointer, ENTRY);
        assert_eq!(
            dbg.current_instruction_string().await.unwrap(),
            "0x400020 xor eax, eax"
        );

        assert_eq!(dbg.step().await.unwrap(), StopReason::Step);
        assert_eq!(
            dbg.current_instruction_annotated().await.unwrap(),
            "0x400022 mov eax, 1 - eax=0x0"
        );

        assert_eq!(
            dbg.continue_execution().await.unwrap(),
            StopReason::Breakpoint(id)
        );
        let stack = dbg.current_stack().await.unwrap();
        assert_eq!(stack[0].instruction_pointer, ENTRY_SYMBOL);
        assert_eq!(
            dbg.symbolize(ENTRY_SYMBOL).await.unwrap().as_deref(),
            Some("app!EntrySymbol")
        );
    }

    #[tokio::test]
    async fn test_status_reflects_state() {
        let dbg = debugger();
        assert_eq!(dbg.status().state, RunState::NotStarted);
        dbg.init(APP).await.unwrap();

        let status = dbg.status();
        assert_eq!(status.state, RunState::Stopped);
        assert_eq!(status.last_stop, Some(StopReason::Entry));
        assert_eq!(status.pid, Some(4242));

        assert_eq!(dbg.continue_execution().await.unwrap(), StopReason::Exited(0));
        assert_eq!(dbg.status().state, RunState::Exited);
    }

    #[tokio::test]
    async fn test_errors_are_distinguishable() {
        let dbg = debugger();
        assert!(matches!(
            dbg.step().await,
            Err(DebugError::InvalidState { .. })
        ));
        assert!(matches!(
            dbg.init("/no/such/program").await,
            Err(DebugError::LaunchFailure { .. })
        ));
        assert!(dbg.add_breakpoint("").await.is_err());
    }

    #[tokio::test]
    async fn test_operations_during_control_are_rejected() {
        let dbg = debugger();
        dbg.init(APP).await.unwrap();

        let running = dbg.begin_control("test").unwrap();
        assert_eq!(dbg.status().state, RunState::Running);
        assert!(matches!(
            dbg.step().await,
            Err(DebugError::InvalidState {
                operation: "step",
                state: RunState::Running
            })
        ));
        assert!(matches!(
            dbg.read_memory(ENTRY, 2).await,
            Err(DebugError::InvalidState {
                state: RunState::Running,
                ..
            })
        ));
        // ターゲットに触れない問い合わせは受け付ける
        assert!(dbg.breakpoints().await.unwrap().is_empty());
        drop(running);

        assert_eq!(dbg.status().state, RunState::Stopped);
        assert_eq!(dbg.step().await.unwrap(), StopReason::Step);
    }

    #[tokio::test]
    async fn test_step_while_continue_runs_is_rejected() {
        let (release, gate) = std::sync::mpsc::channel();
        let dbg = Debugger::with_launcher(
            SessionConfig::default(),
            MockLauncher::new(MockTarget::program).with_gate(gate),
        )
        .unwrap();
        // エントリまでの実行
        release.send(()).unwrap();
        dbg.init(APP).await.unwrap();

        let (continued, (step, seen)) = tokio::join!(dbg.continue_execution(), async {
            while dbg.status().state != RunState::Running {
                tokio::task::yield_now().await;
            }
            let step = dbg.step().await;
            let seen = dbg.status();
            release.send(()).unwrap();
            (step, seen)
        });

        assert!(matches!(
            step,
            Err(DebugError::InvalidState {
                operation: "step",
                state: RunState::Running
            })
        ));
        assert_eq!(seen.state, RunState::Running);
        assert_eq!(continued.unwrap(), StopReason::Exited(0));
        assert_eq!(dbg.status().state, RunState::Exited);
    }

    #[tokio::test]
    async fn test_joined_operations_are_serialized() {
        let dbg = debugger();
        dbg.init(APP).await.unwrap();

        let (step, breakpoints) = tokio::join!(dbg.step(), dbg.breakpoints());
        match step {
            Ok(reason) => assert_eq!(reason, StopReason::Step),
            Err(e) => panic!("unexpected error: {e}"),
        }
        assert!(breakpoints.unwrap().is_empty());
        assert_eq!(dbg.status().state, RunState::Stopped);
    }

    #[tokio::test]
    async fn test_temporary_breakpoint_and_trace() {
        let dbg = debugger();
        dbg.init(APP).await.unwrap();

        let id = dbg.add_temporary_breakpoint("EntrySymbol").await.unwrap();
        assert_eq!(dbg.continue_execution().await.unwrap(), StopReason::Breakpoint(id));
        assert!(dbg.breakpoints().await.unwrap().is_empty());

        assert_eq!(dbg.trace_function("EntrySymbol").await.unwrap(), 14);
        assert_eq!(dbg.continue_execution().await.unwrap(), StopReason::Exited(0));
        // ブレークポイント上から再開した先頭の命令は通過済み
        let trace = dbg.take_trace().await.unwrap();
        assert_eq!(trace.len(), 13);
        assert_eq!(trace[0].address, ENTRY_SYMBOL + 1);
    }
}
