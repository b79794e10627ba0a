//! Kite ELF シンボル情報
//!
//! このクレートは、ELFファイルのシンボルテーブルとロード情報を読み取る機能を提供します。
//! シンボル名からアドレスへの解決、アドレスから最も近いシンボルへの逆引きを行います。
//! アドレスはすべてリンク時のアドレス（ロードバイアス適用前）です。

pub mod loader;
pub mod symbols;

pub use loader::ElfImage;
pub use symbols::{Symbol, SymbolResolver};

/// シンボル解析の結果型
pub type Result<T> = anyhow::Result<T>;
