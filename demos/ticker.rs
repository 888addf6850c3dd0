//! Daemonizes, then appends a tick to a log every second until SIGTERM or
//! SIGINT arrives. SIGABRT is ignored.
//!
//! ```text
//! cargo run --example ticker -- /tmp/ticker
//! kill -TERM "$(cat /tmp/ticker/ticker.pid)"
//! ```

use std::env;
use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use forkish::signals::HandlerSpec;
use forkish::{Daemon, Signal, SignalHandler};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    forkish::helper_main();

    let dir = env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir);
    let pid_file = dir.join("ticker.pid");

    let interval_ms: u64 = Daemon::new(&pid_file)
        .working_directory(&dir)
        .stdout(dir.join("ticker.log"))
        .stderr(dir.join("ticker.log"))
        .daemonize(1000)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let handler = SignalHandler::new(&pid_file)?;
    handler.set(Signal::Abrt, HandlerSpec::Ignore);
    handler.start()?;
    info!(pid_file = %pid_file.display(), "ticker running");

    let mut ticks = 0u64;
    loop {
        if let Err(signal) = handler.wait(Some(Duration::from_millis(interval_ms))) {
            info!(ticks, %signal, "ticker stopping");
            break;
        }
        ticks += 1;
        println!("tick {ticks}");
    }

    handler.stop()?;
    Ok(())
}
