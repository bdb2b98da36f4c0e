//! Courier
//!
//! Starts the demo plugins and forwards commands read from stdin.
//!
//! ```text
//! led on()            send `on()` to the `led` plugin
//! status counter      print the counter worker's task status
//! level 2             set the debug level
//! list                list registered plugins
//! quit
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use courier::channel::Timeout;
use courier::config::CourierConfig;
use courier::debug::WriterSink;
use courier::demo::{CounterPlugin, EchoPlugin, LedPlugin, idle, led_worker};
use courier::directory::Directory;
use courier::kernel::{Kernel, TokioKernel};
use courier::plugin::PluginHost;

/// Courier plugin console
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Run demo plugins and send them commands", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug level (overrides the config file)
    #[arg(short, long)]
    debug_level: Option<u8>,

    /// Command timeout in milliseconds, 0 waits forever (overrides the config file)
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Print status reports as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("courier=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CourierConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CourierConfig::default(),
    };
    if let Some(level) = args.debug_level {
        config.debug.level = level;
    }
    if let Some(ms) = args.timeout_ms {
        config.plugin.command_timeout_ms = ms;
    }

    info!("Starting courier v{}", env!("CARGO_PKG_VERSION"));

    let directory = Arc::new(Directory::from_config(&config));
    directory.set_debug_sink(Arc::new(WriterSink::new(std::io::stderr())));
    let kernel: Arc<dyn Kernel> = Arc::new(TokioKernel::new());
    let options = config.plugin.start_options();

    let led = PluginHost::new("led", LedPlugin::default(), directory.clone(), kernel.clone())?;
    let echo = PluginHost::new("echo", EchoPlugin, directory.clone(), kernel.clone())?;
    let counter = PluginHost::new("counter", CounterPlugin::default(), directory.clone(), kernel)?;

    led.start(led_worker, options.clone())?;
    echo.start(idle, options.clone())?;
    counter.start(idle, options)?;
    info!("Started {} plugins", directory.count());

    let _monitor = match config.directory.monitor_interval() {
        Some(interval) => Some(directory.spawn_monitor(interval)?),
        None => None,
    };

    let session = Session {
        directory: directory.clone(),
        timeout: config.plugin.command_timeout(),
        json: args.json,
    };
    session.run().await?;

    led.stop().await;
    echo.stop().await;
    counter.stop().await;
    info!("Courier stopped");
    Ok(())
}

/// Reads operator lines from stdin until `quit` or end of input.
struct Session {
    directory: Arc<Directory>,
    timeout: Timeout,
    json: bool,
}

impl Session {
    async fn run(&self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let rest = rest.trim();

            match head {
                "quit" | "exit" => break,
                "list" => {
                    for name in self.directory.names() {
                        println!("{}", name);
                    }
                }
                "status" => self.status(rest)?,
                "level" => match rest.parse::<u8>() {
                    Ok(level) => println!("debug level {}", self.directory.set_debug_level(level)),
                    Err(_) => println!("usage: level <0-255>"),
                },
                target if rest.is_empty() => println!("usage: {} <command>", target),
                target => match self.directory.dispatch(target, rest, self.timeout).await {
                    Ok(reply) => println!("{}", reply),
                    Err(e) => {
                        warn!(plugin = %target, error = %e, "Command failed");
                        println!("error: {}", e);
                    }
                },
            }
        }
        Ok(())
    }

    fn status(&self, name: &str) -> Result<()> {
        let snapshot = self.directory.status(name);
        if self.json {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        } else {
            print!("{}", snapshot);
        }
        Ok(())
    }
}
