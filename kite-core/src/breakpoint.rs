//! ブレークポイント管理
//!
//! 論理的なブレークポイント（ユーザーが指定したもの）と、
//! メモリに書き込まれる物理的なトラップ（[`TrapSite`]）を分けて管理します。
//! 同じアドレスに解決されたブレークポイントは1つのトラップを共有し、
//! 所有者がいなくなった時点で元のバイトに戻します。

use crate::parse::{looks_like_address, parse_address};
use crate::Result;
use kite_target::{Target, TrapSite};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// ブレークポイントID
pub type BreakpointId = usize;

/// ブレークポイントの指定方法
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BreakpointSpec {
    /// 絶対アドレス
    Address(u64),
    /// シンボル名（モジュール名を指定しなければ全モジュールから探す）
    Symbol {
        module: Option<String>,
        name: String,
    },
}

impl BreakpointSpec {
    /// モジュールを限定しないシンボル指定を作成する
    pub fn symbol(name: impl Into<String>) -> Self {
        BreakpointSpec::Symbol {
            module: None,
            name: name.into(),
        }
    }

    /// シンボル指定かどうか
    pub fn is_symbolic(&self) -> bool {
        matches!(self, BreakpointSpec::Symbol { .. })
    }
}

impl From<u64> for BreakpointSpec {
    fn from(address: u64) -> Self {
        BreakpointSpec::Address(address)
    }
}

impl FromStr for BreakpointSpec {
    type Err = anyhow::Error;

    /// `0x401000`、`open`、`libc.so.6!open` の形式を受け付ける
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty breakpoint location"));
        }

        if looks_like_address(s) {
            return parse_address(s).map(BreakpointSpec::Address);
        }

        match s.split_once('!') {
            Some((module, name)) if !module.is_empty() && !name.is_empty() => {
                Ok(BreakpointSpec::Symbol {
                    module: Some(module.to_string()),
                    name: name.to_string(),
                })
            }
            Some(_) => Err(anyhow::anyhow!("Invalid breakpoint location '{}'", s)),
            None => Ok(BreakpointSpec::symbol(s)),
        }
    }
}

impl fmt::Display for BreakpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakpointSpec::Address(addr) => write!(f, "0x{:x}", addr),
            BreakpointSpec::Symbol {
                module: Some(module),
                name,
            } => write!(f, "{}!{}", module, name),
            BreakpointSpec::Symbol { module: None, name } => write!(f, "{}", name),
        }
    }
}

/// ブレークポイント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub spec: BreakpointSpec,
    /// 解決済みのアドレス（シンボルはモジュールのロード後に決まる）
    pub address: Option<u64>,
    pub enabled: bool,
    /// トラップを所有しているか
    pub installed: bool,
    /// 同じ指定で追加された回数
    pub references: usize,
    /// 最初のヒットで削除される
    pub once: bool,
}

/// トラップの所有者
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrapOwner {
    /// ユーザーのブレークポイント
    User(BreakpointId),
    /// 起動時にエントリポイントまで走らせるための一時トラップ
    Entry,
    /// 動的ローダのランデブー関数（モジュールロードの通知）
    ModuleLoad,
    /// 関数トレース（命令ごとに記録して実行を続ける）
    Trace,
}

/// 所有者付きのトラップ
#[derive(Debug)]
struct Site {
    trap: TrapSite,
    owners: BTreeSet<TrapOwner>,
}

/// ブレークポイントテーブル
pub struct BreakpointTable {
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    sites: HashMap<u64, Site>,
    /// 一度でも設置された、または未解決として報告済みのブレークポイント
    accounted: BTreeSet<BreakpointId>,
    next_id: BreakpointId,
}

impl BreakpointTable {
    /// 新しいブレークポイントテーブルを作成する
    pub fn new() -> Self {
        Self {
            breakpoints: BTreeMap::new(),
            sites: HashMap::new(),
            accounted: BTreeSet::new(),
            next_id: 1,
        }
    }

    /// ブレークポイントを登録する（トラップはまだ設置しない）
    ///
    /// 同じ指定がすでにあれば参照カウントを増やして同じIDを返します。
    /// 一時的でない登録が1つでもあれば、そのブレークポイントは一時的ではなくなります。
    pub fn register(&mut self, spec: BreakpointSpec, once: bool) -> BreakpointId {
        if let Some(bp) = self.breakpoints.values_mut().find(|bp| bp.spec == spec) {
            bp.references += 1;
            bp.once &= once;
            return bp.id;
        }

        let id = self.next_id;
        self.next_id += 1;

        let address = match spec {
            BreakpointSpec::Address(addr) => Some(addr),
            BreakpointSpec::Symbol { .. } => None,
        };

        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                spec,
                address,
                enabled: true,
                installed: false,
                references: 1,
                once,
            },
        );
        id
    }

    /// 解決済みアドレスにトラップを設置する
    ///
    /// すでに設置済みなら何もしません。
    pub fn install<T: Target + ?Sized>(
        &mut self,
        id: BreakpointId,
        address: u64,
        target: &mut T,
    ) -> Result<()> {
        let Some(bp) = self.breakpoints.get(&id) else {
            return Ok(());
        };
        if bp.installed || !bp.enabled {
            return Ok(());
        }

        self.claim(TrapOwner::User(id), address, target)?;

        if let Some(bp) = self.breakpoints.get_mut(&id) {
            bp.address = Some(address);
            bp.installed = true;
        }
        self.accounted.insert(id);
        Ok(())
    }

    /// ブレークポイントを削除する
    ///
    /// 参照カウントを1つ減らし、0になったらトラップの所有を放棄します。
    /// 存在しないIDに対しては何もしません。完全に削除された場合はtrueを返します。
    pub fn remove<T: Target + ?Sized>(&mut self, id: BreakpointId, target: &mut T) -> Result<bool> {
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return Ok(false);
        };

        bp.references -= 1;
        if bp.references > 0 {
            return Ok(false);
        }

        self.retire(id, target)?;
        Ok(true)
    }

    /// 参照カウントに関係なくブレークポイントを削除する（一時ブレークポイントのヒット後）
    pub fn retire<T: Target + ?Sized>(&mut self, id: BreakpointId, target: &mut T) -> Result<()> {
        let Some(bp) = self.breakpoints.remove(&id) else {
            return Ok(());
        };
        self.accounted.remove(&id);

        if let Some(address) = bp.address.filter(|_| bp.installed) {
            self.release(TrapOwner::User(id), address, target)?;
        }
        Ok(())
    }

    /// ブレークポイントを有効化・無効化する
    ///
    /// 無効化するとトラップの所有を放棄します。有効化したブレークポイントは
    /// 呼び出し側が改めて [`BreakpointTable::install`] します。
    pub fn set_enabled<T: Target + ?Sized>(
        &mut self,
        id: BreakpointId,
        enabled: bool,
        target: &mut T,
    ) -> Result<bool> {
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return Ok(false);
        };
        bp.enabled = enabled;

        if !enabled && bp.installed {
            bp.installed = false;
            if let Some(address) = bp.address {
                self.release(TrapOwner::User(id), address, target)?;
            }
        }
        Ok(true)
    }

    /// 内部用のトラップを設置する
    pub fn claim<T: Target + ?Sized>(
        &mut self,
        owner: TrapOwner,
        address: u64,
        target: &mut T,
    ) -> Result<()> {
        if let Some(site) = self.sites.get_mut(&address) {
            site.owners.insert(owner);
            return Ok(());
        }

        let mut trap = TrapSite::new(address);
        trap.arm(target)?;
        tracing::trace!(address = format_args!("0x{:x}", address), ?owner, "trap armed");

        self.sites.insert(
            address,
            Site {
                trap,
                owners: BTreeSet::from([owner]),
            },
        );
        Ok(())
    }

    /// トラップの所有を放棄する
    ///
    /// 所有者がいなくなったら元のバイトに戻してトラップを削除します。
    pub fn release<T: Target + ?Sized>(
        &mut self,
        owner: TrapOwner,
        address: u64,
        target: &mut T,
    ) -> Result<()> {
        let Some(site) = self.sites.get_mut(&address) else {
            return Ok(());
        };
        site.owners.remove(&owner);
        if !site.owners.is_empty() {
            return Ok(());
        }

        if let Some(mut site) = self.sites.remove(&address) {
            site.trap.disarm(target)?;
            tracing::trace!(address = format_args!("0x{:x}", address), "trap removed");
        }
        Ok(())
    }

    /// ある所有者のトラップをすべて放棄する（放棄した数を返す）
    pub fn release_owner<T: Target + ?Sized>(
        &mut self,
        owner: TrapOwner,
        target: &mut T,
    ) -> Result<usize> {
        let addresses: Vec<u64> = self
            .sites
            .iter()
            .filter(|(_, site)| site.owners.contains(&owner))
            .map(|(address, _)| *address)
            .collect();
        for address in &addresses {
            self.release(owner, *address, target)?;
        }
        Ok(addresses.len())
    }

    /// アドレスのトラップを一時的に外す（元のバイトを戻す）
    pub fn disarm_at<T: Target + ?Sized>(&mut self, address: u64, target: &mut T) -> Result<()> {
        if let Some(site) = self.sites.get_mut(&address) {
            site.trap.disarm(target)?;
        }
        Ok(())
    }

    /// アドレスのトラップを再設置する（まだ所有者がいる場合のみ）
    pub fn rearm_at<T: Target + ?Sized>(&mut self, address: u64, target: &mut T) -> Result<()> {
        if let Some(site) = self.sites.get_mut(&address) {
            site.trap.arm(target)?;
        }
        Ok(())
    }

    /// アドレスにトラップ（外している途中のものも含む）があるかどうか
    pub fn has_site(&self, address: u64) -> bool {
        self.sites.contains_key(&address)
    }

    /// アドレスのトラップがメモリに書き込まれているかどうか
    pub fn is_armed_at(&self, address: u64) -> bool {
        self.sites
            .get(&address)
            .is_some_and(|site| site.trap.is_armed())
    }

    /// アドレスのトラップの所有者
    pub fn owners_at(&self, address: u64) -> Vec<TrapOwner> {
        self.sites
            .get(&address)
            .map(|site| site.owners.iter().copied().collect())
            .unwrap_or_default()
    }

    /// アドレスで停止したときに報告するユーザーのブレークポイント
    pub fn user_hit(&self, address: u64) -> Option<BreakpointId> {
        self.owners_at(address).into_iter().find_map(|owner| match owner {
            TrapOwner::User(id) => Some(id),
            _ => None,
        })
    }

    /// 読み取ったメモリのうちトラップが覆っている位置を元のバイトに戻す
    pub fn unpatch(&self, base: u64, bytes: &mut [u8]) {
        let end = base.saturating_add(bytes.len() as u64);
        for (address, site) in &self.sites {
            if *address >= base && *address < end {
                site.trap.unpatch(base, bytes);
            }
        }
    }

    /// 有効かつ未設置のブレークポイント
    pub fn unbound(&self) -> Vec<(BreakpointId, BreakpointSpec)> {
        self.breakpoints
            .values()
            .filter(|bp| bp.enabled && !bp.installed)
            .map(|bp| (bp.id, bp.spec.clone()))
            .collect()
    }

    /// アンロードされた範囲のトラップを忘れる
    ///
    /// そこに解決されていたシンボル指定のブレークポイントは未解決に戻ります。
    /// 内部トラップの所有者は戻り値で返します。
    pub fn forget_range(&mut self, start: u64, end: u64) -> Vec<TrapOwner> {
        let addresses: Vec<u64> = self
            .sites
            .keys()
            .copied()
            .filter(|addr| *addr >= start && *addr < end)
            .collect();

        let mut internal = Vec::new();
        for address in addresses {
            let Some(mut site) = self.sites.remove(&address) else {
                continue;
            };
            site.trap.forget();
            for owner in site.owners {
                match owner {
                    TrapOwner::User(id) => {
                        if let Some(bp) = self.breakpoints.get_mut(&id) {
                            bp.installed = false;
                            if bp.spec.is_symbolic() {
                                bp.address = None;
                            }
                        }
                    }
                    other => internal.push(other),
                }
            }
        }
        internal
    }

    /// ターゲットが終了したときにトラップの状態を捨てる
    pub fn forget_all(&mut self) {
        for (_, mut site) in self.sites.drain() {
            site.trap.forget();
        }
        for bp in self.breakpoints.values_mut() {
            bp.installed = false;
        }
    }

    /// すべてのトラップを外す（デタッチ前）
    pub fn disarm_all<T: Target + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        for site in self.sites.values_mut() {
            site.trap.disarm(target)?;
        }
        Ok(())
    }

    /// 一度も解決されなかったシンボル指定のうち、まだ報告していないもの（ID順）
    ///
    /// 返したものは報告済みとして記録し、次からは返しません。
    pub fn take_unreported(&mut self) -> Vec<BreakpointSpec> {
        let unreported: Vec<&Breakpoint> = self
            .breakpoints
            .values()
            .filter(|bp| bp.enabled && bp.address.is_none() && !self.accounted.contains(&bp.id))
            .collect();
        let specs = unreported.iter().map(|bp| bp.spec.clone()).collect();
        let ids: Vec<BreakpointId> = unreported.iter().map(|bp| bp.id).collect();
        self.accounted.extend(ids);
        specs
    }

    /// 一時ブレークポイントかどうか
    pub fn is_once(&self, id: BreakpointId) -> bool {
        self.breakpoints.get(&id).is_some_and(|bp| bp.once)
    }

    /// ブレークポイントを取得する
    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// 全てのブレークポイントを取得する
    pub fn all(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    /// ブレークポイントの数を取得する
    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self::new()
    }
}
