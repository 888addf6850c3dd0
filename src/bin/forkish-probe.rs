//! forkish-probe - drives forkish end to end for the integration tests.
//!
//! Every subcommand exercises one path through the library and leaves its
//! observations in files the caller names.

use std::env;
use std::error::Error;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{self, ExitCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use forkish::signals::{HandlerResult, HandlerSpec, Signal, SignalHandler};
use forkish::stdio::{self, StreamTargets};
use forkish::{Branch, Daemon, DaemonError, Daemonizer, Strategy, exit_hook, pidfile};
use tracing_subscriber::EnvFilter;

type ProbeResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "forkish-probe")]
#[command(about = "Exercise forkish daemonization and signal handling")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Daemonize, record token, PID and working directory, then linger
    Daemon(DaemonArgs),

    /// Spawn a daemon that never reports readiness (exit 3 on timeout)
    SpawnTimeout {
        #[arg(long)]
        pid_file: PathBuf,
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
    },

    /// Sleep, ignoring any resume request
    Stall {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },

    /// Log INT, TERM and ABRT deliveries; exit once all three arrived
    Signals {
        #[arg(long)]
        pid_file: PathBuf,
        #[arg(long)]
        log: PathBuf,
        /// Created once the handler is running
        #[arg(long)]
        ready: PathBuf,
        #[arg(long, value_enum)]
        delivery: Delivery,
    },

    /// Leave TERM on the default handler and ignore ABRT; record what the
    /// main thread is woken with
    AwaitTerm {
        #[arg(long)]
        pid_file: PathBuf,
        #[arg(long)]
        log: PathBuf,
        #[arg(long)]
        ready: PathBuf,
        #[arg(long, value_enum)]
        delivery: Delivery,
    },

    /// Emulated delivery whose TERM handler exits the process; an exit hook
    /// removes the PID file
    ExitOnTerm {
        #[arg(long)]
        pid_file: PathBuf,
        #[arg(long)]
        ready: PathBuf,
    },

    /// Redirect the standard streams, echo one stdin line to stdout
    Redirect {
        #[arg(long)]
        stdin: PathBuf,
        #[arg(long)]
        stdout: PathBuf,
        #[arg(long)]
        stderr: PathBuf,
    },
}

#[derive(clap::Args)]
struct DaemonArgs {
    #[arg(long)]
    pid_file: PathBuf,
    /// Written by the daemon: token, PID and working directory, one per line
    #[arg(long)]
    result: PathBuf,
    #[arg(long, default_value = "token")]
    token: String,
    #[arg(long)]
    workdir: Option<PathBuf>,
    /// Target for the daemon's stdout and stderr
    #[arg(long)]
    log: Option<PathBuf>,
    #[arg(long, default_value_t = 500)]
    linger_ms: u64,
    #[arg(long, value_enum, default_value_t = Mode::Fork)]
    strategy: Mode,
    /// Use the scoped API; setup appends one line here
    #[arg(long)]
    setup_marker: Option<PathBuf>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Fork,
    Spawn,
}

impl From<Mode> for Strategy {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Fork => Strategy::Fork,
            Mode::Spawn => Strategy::Spawn,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Delivery {
    Native,
    Emulated,
}

fn main() -> ExitCode {
    init_tracing();
    forkish::helper_main();

    let args = Args::parse();
    match run(args.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("forkish-probe: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run(command: Command) -> ProbeResult<ExitCode> {
    match command {
        Command::Daemon(args) => daemon(args),
        Command::SpawnTimeout {
            pid_file,
            timeout_ms,
        } => spawn_timeout(&pid_file, Duration::from_millis(timeout_ms)),
        Command::Stall { seconds } => {
            thread::sleep(Duration::from_secs(seconds));
            Ok(ExitCode::SUCCESS)
        }
        Command::Signals {
            pid_file,
            log,
            ready,
            delivery,
        } => signals(&pid_file, &log, &ready, delivery),
        Command::AwaitTerm {
            pid_file,
            log,
            ready,
            delivery,
        } => await_term(&pid_file, &log, &ready, delivery),
        Command::ExitOnTerm { pid_file, ready } => exit_on_term(&pid_file, &ready),
        Command::Redirect {
            stdin,
            stdout,
            stderr,
        } => redirect(StreamTargets {
            stdin,
            stdout,
            stderr,
        }),
    }
}

fn daemon(args: DaemonArgs) -> ProbeResult<ExitCode> {
    let mut daemon = Daemon::new(&args.pid_file).strategy(args.strategy.into());
    if let Some(dir) = &args.workdir {
        daemon = daemon.working_directory(dir);
    }
    if let Some(log) = &args.log {
        daemon = daemon.stdout(log).stderr(log);
    }

    let token = match &args.setup_marker {
        None => daemon.daemonize(args.token.clone())?,
        Some(marker) => {
            let branch = Daemonizer::scope(|d| {
                if d.is_setup() {
                    append_line(marker, "setup")?;
                }
                d.daemonize(daemon, args.token.clone())
            })?;
            match branch {
                Branch::Daemon(token) => token,
                // The scope exits the caller before this point.
                Branch::Caller => return Ok(ExitCode::SUCCESS),
            }
        }
    };

    let cwd = env::current_dir()?;
    let record = format!("{token}\n{}\n{}\n", process::id(), cwd.display());
    let staging = args.result.with_extension("partial");
    fs::write(&staging, record)?;
    fs::rename(&staging, &args.result)?;

    thread::sleep(Duration::from_millis(args.linger_ms));
    Ok(ExitCode::SUCCESS)
}

fn spawn_timeout(pid_file: &Path, timeout: Duration) -> ProbeResult<ExitCode> {
    let exe = env::current_exe()?;
    let outcome = Daemon::new(pid_file)
        .strategy(Strategy::Spawn)
        .startup_timeout(timeout)
        .rescript(exe, ["stall", "--seconds", "5"])
        .daemonize(());

    match outcome {
        Err(DaemonError::StartupTimeout(_)) => Ok(ExitCode::from(3)),
        Err(e) => Err(e.into()),
        Ok(()) => Ok(ExitCode::SUCCESS),
    }
}

/// Native delivery targets this process directly, so it records its own PID.
fn signal_handler(pid_file: &Path, delivery: Delivery) -> ProbeResult<SignalHandler> {
    let strategy = match delivery {
        Delivery::Native => Strategy::Fork,
        Delivery::Emulated => Strategy::Spawn,
    };
    let handler = SignalHandler::with_strategy(pid_file, strategy)?;
    if delivery == Delivery::Native {
        pidfile::overwrite(pid_file, process::id())?;
    }
    Ok(handler)
}

fn signals(pid_file: &Path, log: &Path, ready: &Path, delivery: Delivery) -> ProbeResult<ExitCode> {
    let handler = signal_handler(pid_file, delivery)?;

    let seen = Arc::new(AtomicUsize::new(0));
    for (signal, name) in [
        (Signal::Int, "INT"),
        (Signal::Term, "TERM"),
        (Signal::Abrt, "ABRT"),
    ] {
        let log = log.to_path_buf();
        let seen = Arc::clone(&seen);
        handler.set(
            signal,
            HandlerSpec::custom(move |_signum: i32| -> HandlerResult {
                append_line(&log, name)?;
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
    }

    handler.start()?;
    fs::write(ready, "ready\n")?;

    let deadline = Instant::now() + Duration::from_secs(30);
    while seen.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        handler.wait(Some(Duration::from_millis(50)))?;
    }
    handler.stop()?;

    if seen.load(Ordering::SeqCst) < 3 {
        return Err("not every signal arrived".into());
    }
    Ok(ExitCode::SUCCESS)
}

fn await_term(pid_file: &Path, log: &Path, ready: &Path, delivery: Delivery) -> ProbeResult<ExitCode> {
    let handler = signal_handler(pid_file, delivery)?;
    handler.set(Signal::Abrt, HandlerSpec::Ignore);
    handler.start()?;
    fs::write(ready, "ready\n")?;

    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if let Err(received) = handler.wait(Some(Duration::from_millis(50))) {
            append_line(log, &format!("{received:?}"))?;
            handler.stop()?;
            return Ok(ExitCode::SUCCESS);
        }
    }
    handler.stop()?;
    Err("no signal reached the main thread".into())
}

fn exit_on_term(pid_file: &Path, ready: &Path) -> ProbeResult<ExitCode> {
    let owned = pid_file.to_path_buf();
    exit_hook::register(move || {
        let _ = fs::remove_file(&owned);
    });

    let handler = SignalHandler::with_strategy(pid_file, Strategy::Spawn)?;
    handler.set(
        Signal::Term,
        HandlerSpec::custom(|_signum: i32| -> HandlerResult { process::exit(0) }),
    );
    handler.start()?;
    fs::write(ready, "ready\n")?;

    thread::sleep(Duration::from_secs(30));
    Ok(ExitCode::from(4))
}

fn redirect(targets: StreamTargets) -> ProbeResult<ExitCode> {
    println!("before");
    stdio::redirect_streams(&targets)?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    println!("after:{}", line.trim_end());
    eprintln!("err");
    Ok(ExitCode::SUCCESS)
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
