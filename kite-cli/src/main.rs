//! kite CLI - コマンドラインインターフェース
//!
//! x86-64 Linux向けデバッガ kite のREPLとスクリプト実行

mod print;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kite_core::{Command, Debugger, SessionConfig, StopReason};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

/// kite - x86-64 Linux Debugger
#[derive(Parser)]
#[command(name = "kite")]
#[command(version = "0.1.0")]
#[command(about = "Breakpoints, watchpoints, stepping and stack inspection for Linux x86-64 processes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: DebugCommand,

    /// Run commands from a file (one per line) instead of the interactive prompt
    #[arg(short, long, global = true)]
    script: Option<PathBuf>,

    /// Set a breakpoint before the program starts (repeatable)
    #[arg(short = 'b', long = "break", global = true)]
    breakpoints: Vec<String>,

    /// Maximum number of frames shown by backtrace
    #[arg(long, global = true, default_value_t = SessionConfig::default().max_stack_depth)]
    max_depth: usize,

    /// Do not track shared libraries loaded after startup
    #[arg(long, global = true)]
    no_module_hook: bool,

    /// Enable debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: PathBuf,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Process ID to attach to
        pid: i32,
    },
}

/// コマンド実行後にREPLを続けるかどうか
enum Flow {
    Continue,
    Quit,
}

/// CLIの状態
struct Repl {
    debugger: Debugger,
    runtime: Runtime,
    program: Option<PathBuf>,
    args: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = SessionConfig {
        max_stack_depth: cli.max_depth,
        follow_module_loads: !cli.no_module_hook,
        ..SessionConfig::default()
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;
    let mut repl = Repl {
        debugger: Debugger::spawn(config)?,
        runtime,
        program: None,
        args: Vec::new(),
    };

    for spec in &cli.breakpoints {
        repl.execute(Command::Break(spec.clone()))?;
    }

    match cli.command {
        DebugCommand::Run { binary, args } => {
            repl.program = Some(binary);
            repl.args = args;
            // スクリプトでは `start` で起動する
            if cli.script.is_none() {
                repl.execute(Command::Start)?;
            }
        }
        DebugCommand::Attach { pid } => {
            let reason = repl.runtime.block_on(repl.debugger.attach(pid))?;
            println!("Attached to process {} ({})", pid, reason);
        }
    }

    match cli.script {
        Some(path) => run_script(&mut repl, &path),
        None => run_repl(&mut repl),
    }
}

/// ログ出力を初期化する（標準エラー出力）
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// スクリプトのコマンドを順に実行する（エラーで中断）
fn run_script(repl: &mut Repl, path: &PathBuf) -> Result<()> {
    let script = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;

    for (lineno, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        println!("(kite) {}", line);

        let command = Command::parse(line)
            .with_context(|| format!("{}:{}: unknown command '{}'", path.display(), lineno + 1, line))?;
        let flow = repl
            .execute(command)
            .with_context(|| format!("{}:{}: '{}' failed", path.display(), lineno + 1, line))?;
        if let Flow::Quit = flow {
            break;
        }
    }
    Ok(())
}

/// REPLループを実行する
fn run_repl(repl: &mut Repl) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(kite) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                let Some(command) = Command::parse(line) else {
                    println!("Unknown command: {}", line);
                    println!("Type 'help' for available commands.");
                    continue;
                };
                match repl.execute(command) {
                    Ok(Flow::Quit) => break,
                    Ok(Flow::Continue) => {}
                    Err(e) => eprintln!("Error: {:#}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

impl Repl {
    /// コマンドを1つ実行する
    fn execute(&mut self, command: Command) -> Result<Flow> {
        let dbg = &self.debugger;
        let rt = &self.runtime;

        match command {
            Command::Break(loc) => {
                let id = rt.block_on(dbg.add_breakpoint(&loc))?;
                let bps = rt.block_on(dbg.breakpoints())?;
                match bps.iter().find(|bp| bp.id == id).and_then(|bp| bp.address) {
                    Some(addr) => println!("Breakpoint {} at 0x{:x} ({})", id, addr, loc),
                    None => println!("Breakpoint {} pending ({})", id, loc),
                }
            }
            Command::TemporaryBreak(loc) => {
                let id = rt.block_on(dbg.add_temporary_breakpoint(&loc))?;
                println!("Temporary breakpoint {} ({})", id, loc);
            }
            Command::Delete(id) => {
                rt.block_on(dbg.remove_breakpoint(id))?;
                println!("Deleted breakpoint {}", id);
            }
            Command::Enable(id) => {
                if !rt.block_on(dbg.enable_breakpoint(id))? {
                    println!("No breakpoint {}", id);
                }
            }
            Command::Disable(id) => {
                if !rt.block_on(dbg.disable_breakpoint(id))? {
                    println!("No breakpoint {}", id);
                }
            }
            Command::Start => {
                let program = self
                    .program
                    .clone()
                    .context("No program to start (use `kite run <binary>`)")?;
                let reason = rt.block_on(dbg.launch(&program, &self.args))?;
                println!("Started {} ({})", program.display(), reason);
                self.show_location()?;
            }
            Command::Continue => {
                println!("Continuing execution...");
                let reason = rt.block_on(dbg.continue_execution())?;
                println!("{}", print::stop_reason(&reason));
                if !reason.is_terminal() {
                    self.show_location()?;
                }
            }
            Command::StepInstruction => {
                let reason = rt.block_on(dbg.step())?;
                if reason == StopReason::Step {
                    self.show_location()?;
                } else {
                    println!("{}", print::stop_reason(&reason));
                }
            }
            Command::Watch { address, len, kind } => {
                let id = rt.block_on(dbg.add_watchpoint(address, len, kind))?;
                println!("Watchpoint {} ({}) on 0x{:x} len {}", id, kind, address, len);
            }
            Command::Unwatch(id) => {
                if !rt.block_on(dbg.remove_watchpoint(id))? {
                    println!("No watchpoint {}", id);
                }
            }
            Command::UntilAccess { address, len } => {
                println!("Continuing until 0x{:x} is accessed...", address);
                let reason = rt.block_on(dbg.continue_until_access(address, len))?;
                println!("{}", print::stop_reason(&reason));
                if !reason.is_terminal() {
                    self.show_location()?;
                }
            }
            Command::Trace(loc) => {
                let count = rt.block_on(dbg.trace_function(&loc))?;
                println!("Tracing {} instructions of {}", count, loc);
            }
            Command::Untrace => {
                let count = rt.block_on(dbg.stop_tracing())?;
                println!("Removed {} trace points", count);
            }
            Command::Backtrace => {
                for line in print::stack(&rt.block_on(dbg.current_stack())?) {
                    println!("{}", line);
                }
            }
            Command::Frame => match rt.block_on(dbg.current_stack_frame())? {
                Some(frame) => println!("{}", print::frame(&frame)),
                None => println!("No stack frames"),
            },
            Command::Examine(None) => {
                println!("{}", rt.block_on(dbg.current_instruction_annotated())?);
            }
            Command::Examine(Some(addr)) => {
                let insn = rt.block_on(dbg.render_instruction_at(addr))?;
                println!("{}", print::instruction(&insn));
            }
            Command::InfoBreakpoints => {
                let bps = rt.block_on(dbg.breakpoints())?;
                if bps.is_empty() {
                    println!("No breakpoints");
                }
                for bp in &bps {
                    println!("{}", print::breakpoint(bp));
                }
            }
            Command::InfoRegisters => {
                for line in print::registers(&rt.block_on(dbg.registers())?) {
                    println!("{}", line);
                }
            }
            Command::InfoModules => {
                for module in rt.block_on(dbg.modules())? {
                    println!("{}", print::module(&module));
                }
            }
            Command::InfoWatchpoints => {
                let wps = rt.block_on(dbg.watchpoints())?;
                if wps.is_empty() {
                    println!("No watchpoints");
                }
                for wp in &wps {
                    println!("{}", print::watchpoint(wp));
                }
            }
            Command::InfoTrace => {
                let trace = rt.block_on(dbg.take_trace())?;
                if trace.is_empty() {
                    println!("No traced instructions");
                }
                for entry in &trace {
                    println!("{}", print::trace_entry(entry));
                }
            }
            Command::InfoCall(addr) => match rt.block_on(dbg.function_call_at(addr))? {
                Some(call) => println!("{}", call),
                None => println!("No function at this address"),
            },
            Command::Read { address, len } => {
                let bytes = rt.block_on(dbg.read_memory(address, len))?;
                for line in print::hexdump(address, &bytes) {
                    println!("{}", line);
                }
            }
            Command::Kill => {
                let reason = rt.block_on(dbg.kill())?;
                println!("{}", print::stop_reason(&reason));
            }
            Command::Help => print_help(),
            Command::Quit => {
                println!("Goodbye!");
                return Ok(Flow::Quit);
            }
        }

        Ok(Flow::Continue)
    }

    /// 停止位置（シンボルと命令）を表示する
    fn show_location(&self) -> Result<()> {
        let dbg = &self.debugger;
        if let Some(frame) = self.runtime.block_on(dbg.current_stack_frame())? {
            println!("{}", print::frame(&frame));
        }
        println!("{}", self.runtime.block_on(dbg.current_instruction_annotated())?);
        Ok(())
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help (h)             - Show this help message");
    println!("  quit/exit (q)        - Exit the debugger");
    println!();
    println!("Execution:");
    println!("  start (r)            - Launch the program and stop at its entry point");
    println!("  continue (c)         - Continue execution");
    println!("  stepi (si)           - Execute one instruction");
    println!("  kill (k)             - Terminate the program");
    println!();
    println!("Breakpoints:");
    println!("  break <loc> (b)      - Set breakpoint at symbol, module!symbol or address");
    println!("  tbreak <loc> (tb)    - Set breakpoint removed after its first hit");
    println!("  delete <id> (d)      - Delete breakpoint");
    println!("  enable/disable <id>  - Toggle breakpoint");
    println!("  info breakpoints     - List breakpoints");
    println!();
    println!("Watchpoints:");
    println!("  watch <addr> [len]   - Stop after writes to memory (len 1/2/4/8)");
    println!("  awatch <addr> [len]  - Stop after reads or writes");
    println!("  unwatch <id>         - Delete watchpoint");
    println!("  until-access <addr> [len] (ua) - Continue until memory is accessed");
    println!("  info watchpoints     - List watchpoints");
    println!();
    println!("Tracing:");
    println!("  trace <function>     - Record every instruction of a function");
    println!("  untrace              - Stop tracing");
    println!("  info trace           - Show and clear recorded instructions");
    println!();
    println!("Inspection:");
    println!("  backtrace (bt)       - Show call stack");
    println!("  frame (f)            - Show innermost frame");
    println!("  x/i [addr]           - Show instruction at address (default: current, with values)");
    println!("  info call [addr]     - Show arguments of the function stopped at");
    println!("  read <addr> [len]    - Dump memory");
    println!("  info registers       - Show registers");
    println!("  info modules         - Show loaded modules");
    println!();
    println!("Examples:");
    println!("  break main");
    println!("  break libc.so.6!write");
    println!("  break 0x401000");
}
