use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use movcpu::config::SessionConfig;
use movcpu::decode::{cell_name, decode, disassemble};
use movcpu::engine::{Engine, Event, StepOutcome};
use movcpu::memory::{A, B, C, CMP, MEMORY_SIZE, Memory, OUT, ProgramFill, RegisterSeed, SUB, SUM, TRN, Word};
use movcpu::run::{Breakpoints, run_blocking};
use movcpu::session::Session;
use movcpu::storage::{FileStorage, StoragePort};

type CliResult<T = ()> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "movcpu", about = "MOV-only teaching CPU: 100 cells, one instruction")]
struct Cli {
    /// Directory holding saved memory images.
    #[arg(long, global = true, default_value = ".movcpu")]
    store: PathBuf,

    /// Initial value of operand register A (@02).
    #[arg(long, global = true, default_value_t = 0, value_parser = clap::value_parser!(u16).range(0..=9999))]
    a: Word,

    /// Initial value of operand register B (@03).
    #[arg(long, global = true, default_value_t = 0, value_parser = clap::value_parser!(u16).range(0..=9999))]
    b: Word,

    /// Initial value of the condition register C (@08).
    #[arg(long, global = true, default_value_t = 0, value_parser = clap::value_parser!(u16).range(0..=9999))]
    c: Word,

    /// Delay between steps of the automatic run loop, in milliseconds.
    #[arg(long, global = true, default_value_t = 100)]
    interval_ms: u64,

    /// Do not save the machine after every change.
    #[arg(long, global = true)]
    no_autosave: bool,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG wins.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a program until it halts, hits a breakpoint or waits for input.
    Run {
        /// Saved image to run instead of the sample program.
        #[arg(long)]
        image: Option<String>,

        /// Give up after this many steps.
        #[arg(long, default_value_t = 10_000)]
        max_steps: usize,

        /// ROM address to stop at (repeatable).
        #[arg(long = "break")]
        breakpoints: Vec<usize>,
    },
    /// Print the ROM listing of a saved image or the sample program.
    Disasm {
        #[arg(long)]
        image: Option<String>,
    },
    /// List saved images.
    List,
    /// Delete a saved image.
    Delete { name: String },
    /// Interactive prompt over a persistent session.
    Repl,
}

impl Cli {
    fn seed(&self) -> CliResult<RegisterSeed> {
        Ok(RegisterSeed::new(self.a, self.b, self.c)?)
    }

    fn session_config(&self) -> CliResult<SessionConfig> {
        Ok(SessionConfig {
            run_interval: Duration::from_millis(self.interval_ms),
            autosave: !self.no_autosave,
            register_seed: self.seed()?,
        })
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = dispatch(&cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn dispatch(cli: &Cli) -> CliResult {
    let mut storage = FileStorage::new(cli.store.clone());
    match &cli.command {
        Command::Run {
            image,
            max_steps,
            breakpoints,
        } => {
            let memory = load_memory(&storage, image.as_deref(), cli.seed()?)?;
            run_program(memory, *max_steps, breakpoints)
        }
        Command::Disasm { image } => {
            let memory = load_memory(&storage, image.as_deref(), cli.seed()?)?;
            print!("{}", disassemble(&memory));
            Ok(())
        }
        Command::List => {
            for name in storage.list_names()? {
                println!("{name}");
            }
            Ok(())
        }
        Command::Delete { name } => {
            storage.delete(name)?;
            Ok(())
        }
        Command::Repl => repl(Session::open(storage, cli.session_config()?)),
    }
}

/// A named image from storage, or the sample program with the seeded
/// registers.
fn load_memory(storage: &impl StoragePort, name: Option<&str>, seed: RegisterSeed) -> CliResult<Memory> {
    let Some(name) = name else {
        return Ok(Memory::zeroed()
            .with_registers(seed)
            .with_program(ProgramFill::Sample));
    };
    let image = storage
        .load(Some(name))?
        .ok_or_else(|| format!("no saved image named '{name}'"))?;
    Ok(Memory::try_from(&image)?)
}

fn run_program(memory: Memory, max_steps: usize, breakpoints: &[usize]) -> CliResult {
    let mut engine = Engine::new(memory);
    let events = engine.subscribe();
    let bps = Breakpoints::new();
    for &addr in breakpoints {
        bps.toggle(addr)?;
    }

    let reason = run_blocking(&mut engine, &bps, Some(max_steps))?;

    for event in events.try_iter() {
        if let Event::Output(value) = event {
            println!("{value:04}");
        }
    }
    eprintln!("{reason} after {} step(s) of history", engine.history_len());
    eprint!("{}", render_registers(&engine.snapshot()));
    Ok(())
}

fn render_registers(memory: &Memory) -> String {
    let p = memory.pointers();
    let next = if memory.is_halted() {
        "HALT".to_string()
    } else {
        format!("{:04}  {}", memory.instruction(), decode(memory.instruction()))
    };
    format!(
        "PC @{:02}  next {next}\n\
         A {:04}  B {:04}  C {:04}  SUM {:04}  SUB {:04}  CMP {:04}  TRN {:04}  OUT {:04}\n",
        p.pc, memory[A], memory[B], memory[C], memory[SUM], memory[SUB], memory[CMP], memory[TRN], memory[OUT],
    )
}

/// Ten rows of ten cells. `>` marks PC, `*` a breakpoint.
fn render_grid<S: StoragePort>(session: &Session<S>) -> String {
    use std::fmt::Write;
    let memory = session.snapshot();
    let mut out = String::new();
    for row in (0..MEMORY_SIZE).step_by(10) {
        let _ = write!(out, "@{row:02}:");
        for addr in row..row + 10 {
            let mark = if addr == memory.pc() {
                '>'
            } else if session.has_breakpoint(addr) {
                '*'
            } else {
                ' '
            };
            let _ = write!(out, " {mark}{:04}", memory[addr]);
        }
        out.push('\n');
    }
    out
}

const REPL_HELP: &str = "\
commands:
  step | s             execute one instruction
  back | b             undo one instruction
  run | r              start the run loop in the background
  stop                 stop the run loop
  wait                 block until the run loop stops
  break ADDR           toggle a breakpoint on a ROM address
  set ADDR VALUE       write a cell (clears undo history)
  in VALUE             put VALUE on the input port
  show                 registers and memory grid
  out                  output log
  disasm               ROM listing
  reset                reset registers, keep ROM
  clear                back up and erase ROM
  save NAME | load NAME | delete NAME | list
  quit";

fn repl<S: StoragePort>(mut session: Session<S>) -> CliResult {
    println!("{REPL_HELP}");
    print!("{}", render_registers(&session.snapshot()));

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        match repl_command(&mut session, &words) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {e}"),
        }
    }
    session.stop_run()?;
    Ok(())
}

/// Execute one prompt line. Returns `false` to quit.
fn repl_command<S: StoragePort>(session: &mut Session<S>, words: &[&str]) -> CliResult<bool> {
    match words {
        [] => {}
        ["quit" | "q" | "exit"] => return Ok(false),
        ["help" | "h" | "?"] => println!("{REPL_HELP}"),
        ["step" | "s"] => match session.step()? {
            StepOutcome::Halted => println!("halted"),
            StepOutcome::Executed(step) => {
                if let Some(value) = step.output {
                    println!("OUT {value:04}");
                }
                print!("{}", render_registers(&session.snapshot()));
            }
        },
        ["back" | "b"] => {
            if session.step_back()? {
                print!("{}", render_registers(&session.snapshot()));
            } else {
                println!("nothing to undo");
            }
        }
        ["run" | "r"] => {
            if !session.start_run()? {
                println!("already running");
            }
        }
        ["stop"] => match session.stop_run()? {
            Some(reason) => println!("{reason}"),
            None => println!("not running"),
        },
        ["wait"] => match session.join_run()? {
            Some(reason) => println!("{reason}"),
            None => println!("not running"),
        },
        ["break", addr] => {
            let addr = addr.parse()?;
            let set = session.toggle_breakpoint(addr)?;
            println!("breakpoint @{addr:02} {}", if set { "set" } else { "cleared" });
        }
        ["set", addr, value] => {
            let addr: usize = addr.parse()?;
            session.update_memory(addr, value.parse()?)?;
            println!("@{addr:02} ({}) = {:04}", cell_name(addr), session.snapshot()[addr]);
        }
        ["in", value] => session.set_input(value.parse()?)?,
        ["show"] => {
            print!("{}", render_registers(&session.snapshot()));
            print!("{}", render_grid(session));
        }
        ["out"] => {
            for value in session.output_log() {
                println!("{value:04}");
            }
        }
        ["disasm"] => print!("{}", disassemble(&session.snapshot())),
        ["reset"] => session.reset()?,
        ["clear"] => println!("backed up as {}", session.clear_program()?),
        ["save", name] => session.save_as(name)?,
        ["load", name] => {
            if !session.load_by_name(name)? {
                println!("no saved image named '{name}'");
            }
        }
        ["delete", name] => session.delete_program(name)?,
        ["list"] => {
            for name in session.saved_names()? {
                println!("{name}");
            }
        }
        _ => println!("unknown command, try 'help'"),
    }
    Ok(true)
}
