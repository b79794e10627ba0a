//! kite デバッガのコア機能
//!
//! このクレートは、デバッガの中核となるロジックを提供します。
//! ブレークポイント、ウォッチポイント、実行制御、スタック巻き戻し、逆アセンブルを1つのセッションにまとめ、
//! 専用スレッドのイベントループを通して非同期に操作できるようにします。

pub mod breakpoint;
pub mod calls;
pub mod command;
pub mod config;
pub mod debugger;
pub mod disasm;
pub mod errors;
mod event_loop;
pub mod modules;
pub mod parse;
pub mod session;
pub mod unwind;
pub mod watchpoint;

#[cfg(test)]
mod mock;

pub use breakpoint::{Breakpoint, BreakpointId, BreakpointSpec};
pub use calls::{ArgValue, FunctionCall};
pub use command::Command;
pub use config::SessionConfig;
pub use debugger::Debugger;
pub use disasm::{Instruction, Operand};
pub use errors::DebugError;
pub use modules::ModuleInfo;
pub use session::{RunState, Session, SessionStatus, StopReason, TraceEntry};
pub use unwind::StackFrame;
pub use watchpoint::{Watchpoint, WatchpointId};

// 他のクレートから使用するために再エクスポート
pub use kite_target::{CpuState, Signal, WatchKind};

/// デバッガの結果型
pub type Result<T> = std::result::Result<T, DebugError>;
