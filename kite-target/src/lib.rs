//! Kite ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスを制御するための低レベル機能を提供します。
//! ptrace、レジスタアクセス、メモリアクセス、トラップ（INT3）とウォッチポイントの設置などを行います。
//! 上位のクレートは [`Target`] トレイト経由でのみプロセスに触れます。

pub mod process;
pub mod memory;
pub mod registers;
pub mod breakpoint;
pub mod target;
pub mod watchpoint;

pub use process::{Process, TargetEvent};
pub use memory::{Memory, MemoryMapping, MAX_READ_LEN};
pub use registers::{CpuState, Registers};
pub use breakpoint::{TrapSite, INT3_OPCODE};
pub use target::{Launcher, PtraceLauncher, PtraceTarget, Target};
pub use watchpoint::{WatchKind, WATCHPOINT_SLOTS};

pub use nix::sys::signal::Signal;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
