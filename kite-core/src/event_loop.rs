//! イベントループ
//!
//! ptraceはトレーサーのスレッドに紐づくため、セッションは専用スレッドが所有し、
//! 要求はチャネル経由で1つずつ順番に処理します。
//! 応答を返す前にセッションの状態を公開するので、フロントエンドは待たずに状態を参照できます。

use crate::breakpoint::{Breakpoint, BreakpointId, BreakpointSpec};
use crate::calls::FunctionCall;
use crate::config::SessionConfig;
use crate::disasm::Instruction;
use crate::modules::ModuleInfo;
use crate::session::{Session, SessionStatus, StopReason, TraceEntry};
use crate::unwind::StackFrame;
use crate::watchpoint::{Watchpoint, WatchpointId};
use crate::{DebugError, Result};
use kite_target::{CpuState, Launcher, Target, WatchKind};
use std::path::PathBuf;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot, watch};

/// 要求キューの長さ
const QUEUE_DEPTH: usize = 16;

type Reply<T> = oneshot::Sender<T>;

/// イベントループへの要求
#[derive(Debug)]
pub(crate) enum Request {
    Launch(PathBuf, Vec<String>, Reply<Result<StopReason>>),
    Attach(i32, Reply<Result<StopReason>>),
    AddBreakpoint(BreakpointSpec, Reply<Result<BreakpointId>>),
    AddTemporaryBreakpoint(BreakpointSpec, Reply<Result<BreakpointId>>),
    RemoveBreakpoint(BreakpointId, Reply<Result<()>>),
    SetBreakpointEnabled(BreakpointId, bool, Reply<Result<bool>>),
    Breakpoints(Reply<Vec<Breakpoint>>),
    Step(Reply<Result<StopReason>>),
    Continue(Reply<Result<StopReason>>),
    ContinueUntilAccess(u64, usize, Reply<Result<StopReason>>),
    AddWatchpoint(u64, usize, WatchKind, Reply<Result<WatchpointId>>),
    RemoveWatchpoint(WatchpointId, Reply<Result<bool>>),
    Watchpoints(Reply<Vec<Watchpoint>>),
    TraceFunction(BreakpointSpec, Reply<Result<usize>>),
    StopTracing(Reply<Result<usize>>),
    TakeTrace(Reply<Vec<TraceEntry>>),
    Stack(Reply<Result<Vec<StackFrame>>>),
    RenderInstruction(u64, Reply<Result<Instruction>>),
    CurrentInstruction(Reply<Result<String>>),
    AnnotatedInstruction(Reply<Result<String>>),
    FunctionCall(Option<u64>, Reply<Result<Option<FunctionCall>>>),
    /// トラップを元のバイトに戻した内容を返す
    ReadMemory(u64, usize, Reply<Result<Vec<u8>>>),
    Registers(Reply<Result<CpuState>>),
    Symbolize(u64, Reply<Option<String>>),
    Modules(Reply<Vec<ModuleInfo>>),
    Kill(Reply<Result<StopReason>>),
}

/// 起動したイベントループへの接続
pub(crate) struct EventLoop {
    pub requests: mpsc::Sender<Request>,
    /// 応答のたびに更新されるセッションの状態
    pub status: watch::Receiver<SessionStatus>,
    pub worker: JoinHandle<()>,
}

/// イベントループのスレッドを起動する
pub(crate) fn spawn<L>(config: SessionConfig, mut launcher: L) -> Result<EventLoop>
where
    L: Launcher + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(QUEUE_DEPTH);
    let (status_tx, status_rx) = watch::channel(SessionStatus::default());
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

    let handle = std::thread::Builder::new()
        .name("kite-event-loop".to_string())
        .spawn(move || {
            let mut session = match Session::<L::Target>::new(config) {
                Ok(session) => {
                    let _ = ready_tx.send(Ok(()));
                    session
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            while let Some(request) = rx.blocking_recv() {
                handle(&mut session, &mut launcher, &status_tx, request);
            }

            tracing::debug!("event loop finished");
            session.shutdown();
            status_tx.send_replace(session.status());
        })
        .map_err(|e| anyhow::anyhow!("Failed to start event loop thread: {}", e))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(EventLoop {
            requests: tx,
            status: status_rx,
            worker: handle,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(DebugError::LostConnection {
            reason: "event loop thread exited during startup".to_string(),
        }),
    }
}

/// 要求を1つ処理して応答を返す
///
/// 呼び出し側がすでに待つのをやめていても処理は最後まで行い、応答だけを捨てます。
fn handle<L: Launcher>(
    session: &mut Session<L::Target>,
    launcher: &mut L,
    status: &watch::Sender<SessionStatus>,
    request: Request,
) {
    tracing::trace!(?request, "handling request");
    match request {
        Request::Launch(program, args, reply) => {
            let result = session.start(launcher, &program, &args);
            respond(session, status, reply, result);
        }
        Request::Attach(pid, reply) => {
            let result = session.attach(launcher, pid);
            respond(session, status, reply, result);
        }
        Request::AddBreakpoint(spec, reply) => {
            let result = session.add_breakpoint(spec);
            respond(session, status, reply, result);
        }
        Request::AddTemporaryBreakpoint(spec, reply) => {
            let result = session.add_temporary_breakpoint(spec);
            respond(session, status, reply, result);
        }
        Request::RemoveBreakpoint(id, reply) => {
            let result = session.remove_breakpoint(id);
            respond(session, status, reply, result);
        }
        Request::SetBreakpointEnabled(id, enabled, reply) => {
            let result = session.set_breakpoint_enabled(id, enabled);
            respond(session, status, reply, result);
        }
        Request::Breakpoints(reply) => {
            let result = session.breakpoints();
            respond(session, status, reply, result);
        }
        Request::Step(reply) => {
            let result = session.step_instruction();
            respond(session, status, reply, result);
        }
        Request::Continue(reply) => {
            let result = session.continue_execution();
            respond(session, status, reply, result);
        }
        Request::ContinueUntilAccess(address, len, reply) => {
            let result = session.continue_until_access(address, len);
            respond(session, status, reply, result);
        }
        Request::AddWatchpoint(address, len, kind, reply) => {
            let result = session.add_watchpoint(address, len, kind);
            respond(session, status, reply, result);
        }
        Request::RemoveWatchpoint(id, reply) => {
            let result = session.remove_watchpoint(id);
            respond(session, status, reply, result);
        }
        Request::Watchpoints(reply) => {
            let result = session.watchpoints();
            respond(session, status, reply, result);
        }
        Request::TraceFunction(spec, reply) => {
            let result = session.trace_function(spec);
            respond(session, status, reply, result);
        }
        Request::StopTracing(reply) => {
            let result = session.stop_tracing();
            respond(session, status, reply, result);
        }
        Request::TakeTrace(reply) => {
            let result = session.take_trace();
            respond(session, status, reply, result);
        }
        Request::Stack(reply) => {
            let result = session.current_stack();
            respond(session, status, reply, result);
        }
        Request::RenderInstruction(address, reply) => {
            let result = session.render_instruction_at(address);
            respond(session, status, reply, result);
        }
        Request::CurrentInstruction(reply) => {
            let result = session.current_instruction_string();
            respond(session, status, reply, result);
        }
        Request::AnnotatedInstruction(reply) => {
            let result = session.current_instruction_annotated();
            respond(session, status, reply, result);
        }
        Request::FunctionCall(address, reply) => {
            let result = session.function_call_at(address);
            respond(session, status, reply, result);
        }
        Request::ReadMemory(address, len, reply) => {
            let result = session.read_memory(address, len);
            respond(session, status, reply, result);
        }
        Request::Registers(reply) => {
            let result = session.registers();
            respond(session, status, reply, result);
        }
        Request::Symbolize(address, reply) => {
            let result = session.symbolize(address);
            respond(session, status, reply, result);
        }
        Request::Modules(reply) => {
            let result = session.modules();
            respond(session, status, reply, result);
        }
        Request::Kill(reply) => {
            let result = session.kill();
            respond(session, status, reply, result);
        }
    }
}

/// 状態を公開してから応答を返す
fn respond<T: Target, R>(
    session: &Session<T>,
    status: &watch::Sender<SessionStatus>,
    reply: Reply<R>,
    value: R,
) {
    status.send_replace(session.status());
    let _ = reply.send(value);
}
