//! セッション設定

/// x86-64命令の最大長
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// セッション設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// スタック巻き戻しの最大フレーム数（壊れたスタックでの無限ループ防止）
    pub max_stack_depth: usize,
    /// 命令デコード時に読むバイト数
    pub decode_window: usize,
    /// 動的ローダのランデブー関数にトラップを置いてモジュールロードを追跡するか
    pub follow_module_loads: bool,
    /// 起動時にプログラムのエントリポイントまで実行するか
    ///
    /// falseの場合、execve直後（動的ローダの先頭）で停止したままになります。
    pub stop_at_entry: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: 64,
            decode_window: MAX_INSTRUCTION_LEN,
            follow_module_loads: true,
            stop_at_entry: true,
        }
    }
}
