//! プロセス制御機能

use crate::Result;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::ffi::CString;
use std::path::Path;

/// waitpidで観測したデバッグイベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEvent {
    /// SIGTRAPで停止（INT3実行またはステップ実行完了）
    Trapped,
    /// SIGTRAP以外のシグナルで停止
    Signaled(Signal),
    /// プロセス終了
    Exited(i32),
    /// シグナルによる強制終了
    Killed(Signal),
}

impl TargetEvent {
    /// プロセスがもう存在しないイベントかどうか
    pub fn is_terminal(&self) -> bool {
        matches!(self, TargetEvent::Exited(_) | TargetEvent::Killed(_))
    }
}

/// デバッグ対象のプロセス
pub struct Process {
    pid: Pid,
    /// forkで起動したプロセスか（falseならアタッチ）
    spawned: bool,
    /// 終了を観測済みか
    exited: bool,
}

impl Process {
    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// 新しいプロセスをforkして起動し、PTRACE_TRACEMEを設定してから
    /// 指定された実行可能ファイルをexecveで実行します。
    /// プロセスはexecve直後（動的ローダの先頭）で停止状態で返されます。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        use nix::unistd::{execve, fork, ForkResult};

        let program = program.as_ref();
        if !program.is_file() {
            return Err(anyhow::anyhow!("No such executable: {}", program.display()));
        }

        let program_path = program.to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid program path"))?;
        let program_cstring = CString::new(program_path)?;

        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_str())?);
        }

        // 環境変数は親プロセスから継承
        let env: Vec<CString> = std::env::vars()
            .map(|(key, val)| CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from))
            .collect::<Result<Vec<_>>>()?;

        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                        // デバッガが先に死んだ場合はターゲットも終了させる
                        ptrace::setoptions(child, ptrace::Options::PTRACE_O_EXITKILL)?;
                        tracing::debug!(pid = child.as_raw(), "process stopped after execve");
                        Ok(Self {
                            pid: child,
                            spawned: true,
                            exited: false,
                        })
                    }
                    WaitStatus::Exited(_, code) => Err(anyhow::anyhow!(
                        "Process exited with code {} before reaching execve stop",
                        code
                    )),
                    status => {
                        Err(anyhow::anyhow!("Unexpected wait status after execve: {:?}", status))
                    }
                }
            }
            ForkResult::Child => {
                if ptrace::traceme().is_ok() {
                    let _ = execve(&program_cstring, &cstring_args, &env);
                }
                // execveが失敗した場合、親はExitedとして観測する
                unsafe { nix::libc::_exit(127) }
            }
        }
    }

    /// 既存のプロセスにアタッチする
    ///
    /// PTRACE_ATTACHが送るSIGSTOPで停止するまで待機します。
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid)?;

        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, _) => Ok(Self {
                pid,
                spawned: false,
                exited: false,
            }),
            status => Err(anyhow::anyhow!("Unexpected wait status after attach: {:?}", status)),
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// forkで起動したプロセスかどうか
    pub fn is_spawned(&self) -> bool {
        self.spawned
    }

    /// プロセスを実行継続する
    pub fn continue_execution(&self, signal: Option<Signal>) -> Result<()> {
        ptrace::cont(self.pid, signal)?;
        Ok(())
    }

    /// 1命令だけ実行する（ステップ実行）
    ///
    /// 関数呼び出しの中にも入ります（ステップイン）。
    /// 完了は [`Process::wait_event`] で観測します。
    pub fn step(&self, signal: Option<Signal>) -> Result<()> {
        ptrace::step(self.pid, signal)?;
        Ok(())
    }

    /// 次の停止イベントを待機する
    pub fn wait_event(&mut self) -> Result<TargetEvent> {
        loop {
            let event = match waitpid(self.pid, None)? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => TargetEvent::Trapped,
                WaitStatus::Stopped(_, signal) => TargetEvent::Signaled(signal),
                WaitStatus::PtraceEvent(_, signal, _) => TargetEvent::Signaled(signal),
                WaitStatus::Exited(_, code) => TargetEvent::Exited(code),
                WaitStatus::Signaled(_, signal, _) => TargetEvent::Killed(signal),
                // 停止・終了以外の状態変化は待ち続ける
                _ => continue,
            };
            if event.is_terminal() {
                self.exited = true;
            }
            return Ok(event);
        }
    }

    /// プロセスを強制終了する
    pub fn kill(&mut self) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        nix::sys::signal::kill(self.pid, Signal::SIGKILL)?;
        // ゾンビを回収する
        while !self.wait_event()?.is_terminal() {}
        Ok(())
    }

    /// プロセスからデタッチする
    pub fn detach(&mut self) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        ptrace::detach(self.pid, None)?;
        self.exited = true;
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        // 起動したプロセスは終了させ、アタッチしたプロセスは解放する
        let result = if self.spawned { self.kill() } else { self.detach() };
        if let Err(e) = result {
            tracing::warn!(pid = self.pid.as_raw(), "failed to release target: {}", e);
        }
    }
}
