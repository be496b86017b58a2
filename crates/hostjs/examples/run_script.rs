//! Run a script file to completion
//!
//! ```text
//! cargo run --example run_script -- [engine args...] <script.js>
//! ```
//!
//! Engine arguments start with `--` and come before the script path, e.g.
//! `--memory-limit=64m`. The process exits with the guest's exit code.

use anyhow::{bail, Context as _};
use hostjs::{Embedder, HostValue, ModuleDescriptor};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (engine_args, rest): (Vec<&String>, Vec<&String>) =
        args.iter().partition(|arg| arg.starts_with("--"));
    let Some(script) = rest.first() else {
        bail!("usage: run_script [engine args...] <script.js>");
    };

    let mut embedder = Embedder::new();
    embedder
        .initialize("run_script", &engine_args)
        .context("failed to start guest runtime")?;

    // Small host module so scripts can tell they are embedded.
    embedder.register_module(
        ModuleDescriptor::new("host")
            .function("version", |_| Ok(HostValue::from(hostjs::VERSION)))
            .function("now", |_| {
                let elapsed = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default();
                Ok(HostValue::from(elapsed.as_secs_f64() * 1000.0))
            })
            .expose_as("host"),
    )?;

    match embedder.run(script.as_str()) {
        Ok(value) if !value.is_undefined() => tracing::info!(result = %value, "script completed"),
        Ok(_) => {}
        Err(err) => {
            tracing::error!(error = %err, "script failed");
            embedder.deinitialize();
            std::process::exit(1);
        }
    }

    let mut ticks = 0u64;
    embedder.run_event_loop(|| ticks += 1)?;
    tracing::debug!(ticks, "event loop finished");

    if let Some(stats) = embedder.loop_stats() {
        tracing::debug!(
            units = stats.units,
            uncaught = stats.uncaught,
            average_tick = ?stats.average_tick,
            slowest_tick = ?stats.slowest_tick,
            "loop stats"
        );
    }

    let code = embedder.deinitialize();
    std::process::exit(code);
}
