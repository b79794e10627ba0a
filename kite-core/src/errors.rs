//! デバッガのエラー

use crate::{BreakpointSpec, RunState};

/// デバッガ操作のエラー
///
/// 呼び出し側が種類ごとに判別できるよう、コア内部の失敗はすべてこの型で返します。
#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    /// ターゲットを起動できなかった（そのセッションでは致命的）
    #[error("failed to launch '{program}': {reason}")]
    LaunchFailure { program: String, reason: String },

    /// 実行状態が要求を満たしていない（正しい状態になれば再試行できる）
    #[error("cannot {operation} while the target is {state}")]
    InvalidState {
        operation: &'static str,
        state: RunState,
    },

    /// シンボルを定義するモジュールが最後までロードされなかった
    #[error("breakpoints never resolved to an address: {}", join_specs(.specs))]
    UnresolvedBreakpoint { specs: Vec<BreakpointSpec> },

    /// 命令としてデコードできないバイト列
    #[error("cannot decode instruction at 0x{address:x} (bytes: {})", hex_bytes(.bytes))]
    DecodeError { address: u64, bytes: Vec<u8> },

    /// ターゲットが予期せず終了した、またはデバッグ接続が切れた
    #[error("lost connection to the target: {reason}")]
    LostConnection { reason: String },

    /// メモリ・レジスタアクセスなどの失敗
    #[error(transparent)]
    Target(#[from] anyhow::Error),
}

fn join_specs(specs: &[BreakpointSpec]) -> String {
    specs
        .iter()
        .map(|spec| format!("'{}'", spec))
        .collect::<Vec<_>>()
        .join(", ")
}

/// バイト列を16進表記にする
fn hex_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<unreadable>".to_string();
    }
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
