//! ELFイメージの読み込み機能

use crate::{Result, Symbol};
use object::{Object, ObjectSegment, ObjectSymbol, SymbolKind};
use std::fs;
use std::path::Path;

/// ページ境界のマスク
const PAGE_MASK: u64 = !0xfff;

/// ELFイメージ
///
/// ファイルから読み取ったシンボルとロード情報だけを保持します。
/// ファイルの内容そのものは保持しません。
#[derive(Debug, Clone)]
pub struct ElfImage {
    /// 関数シンボル
    symbols: Vec<Symbol>,
    /// 最初のPT_LOADセグメントのページ先頭アドレス
    image_base: u64,
}

impl ElfImage {
    /// ELFファイルを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        let image = Self::parse(&file_data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        tracing::debug!(
            path = %path.display(),
            symbols = image.symbols.len(),
            image_base = format_args!("0x{:x}", image.image_base),
            "loaded ELF image"
        );
        Ok(image)
    }

    /// メモリ上のELFデータを解析する
    pub fn parse(data: &[u8]) -> Result<Self> {
        let object_file = object::File::parse(data)?;

        let mut symbols = Vec::new();

        // .symtab と .dynsym の両方を読む（ストリップ済みの共有ライブラリは .dynsym のみ）
        for symbol in object_file.symbols().chain(object_file.dynamic_symbols()) {
            if symbol.kind() != SymbolKind::Text || !symbol.is_definition() {
                continue;
            }
            let Ok(name) = symbol.name() else {
                continue;
            };
            if name.is_empty() || symbol.address() == 0 {
                continue;
            }
            symbols.push(Symbol::new(name.to_string(), symbol.address(), symbol.size()));
        }

        let image_base = object_file
            .segments()
            .map(|segment| segment.address())
            .min()
            .unwrap_or(0)
            & PAGE_MASK;

        Ok(Self {
            symbols,
            image_base,
        })
    }

    /// シンボル一覧から直接イメージを構築する
    pub fn from_parts(symbols: Vec<Symbol>, image_base: u64) -> Self {
        Self {
            symbols,
            image_base,
        }
    }

    /// 関数シンボルを取得する
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// リンク時の先頭アドレスを取得する
    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    /// ファイルオフセット0のマッピング開始アドレスからロードバイアスを計算する
    ///
    /// PIEや共有ライブラリはリンク時の先頭が0なので、マップされた先頭がそのままバイアスになります。
    pub fn load_bias(&self, mapped_start: u64) -> u64 {
        mapped_start.wrapping_sub(self.image_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_bias_for_pie_and_fixed_images() {
        let pie = ElfImage::from_parts(Vec::new(), 0);
        assert_eq!(pie.load_bias(0x5555_5555_4000), 0x5555_5555_4000);

        let fixed = ElfImage::from_parts(Vec::new(), 0x400000);
        assert_eq!(fixed.load_bias(0x400000), 0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ElfImage::parse(b"definitely not an elf file").is_err());
    }
}
