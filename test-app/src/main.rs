// lsctl command-line tool -- connect to an instrument, query it, send raw
// commands, run workflows and watch events.
//
// Usage:
//   lsctl-cli --host 192.168.10.2 status
//   lsctl-cli --host 192.168.10.2 settings Objective
//   lsctl-cli --host 192.168.10.2 position z
//   lsctl-cli --host 192.168.10.2 send 0x2001 --param 0=2 --value 35
//   lsctl-cli --host 192.168.10.2 --table extra.toml send 0x5001 --wait
//   lsctl-cli --host 192.168.10.2 run-workflow scan.txt --wait-secs 600
//   lsctl-cli --host 192.168.10.2 monitor --duration 60
//
// Logging goes to stderr; set RUST_LOG (default `lsctl=info`).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use lsctl::{
    Axis, CommandTable, Instrument, InstrumentBuilder, InstrumentEvent, Message, WorkflowState,
};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// lsctl command-line tool -- exercises an instrument connection.
#[derive(Parser)]
#[command(name = "lsctl-cli", version, about)]
struct Cli {
    /// Instrument IP address or hostname.
    #[arg(long)]
    host: String,

    /// Command port. The live port is the next one up.
    #[arg(long, default_value_t = lsctl::DEFAULT_COMMAND_PORT)]
    port: u16,

    /// TOML file extending the command classification table.
    #[arg(long)]
    table: Option<PathBuf>,

    /// Reply timeout in milliseconds for commands without their own
    /// [default: the table's default_timeout_ms, else 3000].
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Skip the settings exchange after connecting.
    #[arg(long)]
    no_settings: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and print connection and system state.
    Status,

    /// Print the scope settings, or a single key.
    Settings { key: Option<String> },

    /// Send a raw command.
    Send {
        /// Command code (hex with 0x prefix, or decimal).
        #[arg(value_parser = parse_code)]
        code: u32,

        /// Parameter as SLOT=VALUE, repeatable.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(usize, u32)>,

        /// Floating-point value field.
        #[arg(long)]
        value: Option<f64>,

        /// Wait for a reply even if the table says the command has none.
        #[arg(long, conflicts_with = "no_wait")]
        wait: bool,

        /// Do not wait for a reply even if the table says there is one.
        #[arg(long)]
        no_wait: bool,
    },

    /// Read a stage axis position.
    Position {
        /// Axis: x, y, z or r.
        axis: Axis,
    },

    /// Switch every laser off.
    LasersOff,

    /// Send a workflow file and start it.
    RunWorkflow {
        file: PathBuf,

        /// Wait up to this many seconds for completion (0 = return after
        /// the start is acknowledged).
        #[arg(long, default_value_t = 0)]
        wait_secs: u64,
    },

    /// Tell the instrument to stop its running workflow.
    StopWorkflow,

    /// Print events as they arrive.
    Monitor {
        /// Duration in seconds (0 = until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },
}

/// Parse "0x4001" or "16385" into a command code.
fn parse_code(s: &str) -> std::result::Result<u32, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex code: {e}")),
        None => s.parse().map_err(|e| format!("invalid code: {e}")),
    }
}

/// Parse "SLOT=VALUE".
fn parse_param(s: &str) -> std::result::Result<(usize, u32), String> {
    let (slot, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SLOT=VALUE, got '{s}'"))?;
    let slot: usize = slot.parse().map_err(|e| format!("invalid slot: {e}"))?;
    if slot >= lsctl::PARAM_COUNT {
        return Err(format!("slot must be below {}", lsctl::PARAM_COUNT));
    }
    let value = parse_code(value)?;
    Ok((slot, value))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_status(instrument: &Instrument) -> Result<()> {
    println!("Connection:   {}", instrument.state());
    match instrument.settings() {
        Some(settings) => println!("Settings:     {} entries", settings.len()),
        None => println!("Settings:     not loaded"),
    }
    let state = instrument
        .system_state()
        .await
        .context("failed to query system state")?;
    println!("System state: 0x{state:08X}");
    println!("Workflow:     {}", instrument.workflow().state());
    Ok(())
}

async fn cmd_settings(instrument: &Instrument, key: Option<&str>) -> Result<()> {
    let settings = match instrument.settings() {
        Some(s) => s,
        None => instrument
            .reload_settings()
            .await
            .context("failed to retrieve settings")?,
    };

    match key {
        Some(key) => match settings.get(key) {
            Some(value) => println!("{value}"),
            None => bail!("no setting named '{key}'"),
        },
        None => {
            for (k, v) in settings.iter() {
                println!("{k} = {v}");
            }
        }
    }
    Ok(())
}

async fn cmd_send(
    instrument: &Instrument,
    code: u32,
    params: &[(usize, u32)],
    value: Option<f64>,
    wait: Option<bool>,
) -> Result<()> {
    let mut request = instrument.dispatcher().request(code);
    for &(slot, v) in params {
        request = request.param(slot, v);
    }
    if let Some(value) = value {
        request = request.value(value);
    }
    if let Some(wait) = wait {
        request = request.expects_response(wait);
    }

    let name = instrument.dispatcher().table().name(code);
    let start = Instant::now();
    let reply = instrument
        .send(request)
        .await
        .with_context(|| format!("command {name} failed"))?;
    let elapsed = start.elapsed();

    match reply {
        Some(reply) => {
            println!("{name}: reply in {:.1} ms", elapsed.as_secs_f64() * 1000.0);
            print_message(&reply);
        }
        None => println!("{name}: sent (no reply expected)"),
    }
    Ok(())
}

async fn cmd_position(instrument: &Instrument, axis: Axis) -> Result<()> {
    let position = instrument
        .stage_position(axis)
        .await
        .with_context(|| format!("failed to read {axis:?} position"))?;
    println!("{axis:?}: {position:.4} mm");
    Ok(())
}

async fn cmd_run_workflow(instrument: &Instrument, file: &Path, wait_secs: u64) -> Result<()> {
    let script = std::fs::read(file)
        .with_context(|| format!("failed to read workflow file {}", file.display()))?;

    let mut events = instrument.subscribe();
    instrument
        .workflow()
        .execute(script)
        .await
        .context("failed to start workflow")?;
    println!("Workflow started.");

    if wait_secs == 0 {
        return Ok(());
    }

    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!("workflow did not complete within {wait_secs} s");
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(InstrumentEvent::WorkflowCompleted)) => {
                println!("Workflow completed.");
                return Ok(());
            }
            Ok(Ok(InstrumentEvent::WorkflowFailed { reason })) => {
                bail!("workflow failed: {reason}");
            }
            Ok(Ok(InstrumentEvent::ConnectionError { reason })) => {
                bail!("connection lost while waiting: {reason}");
            }
            Ok(Ok(_)) => {}
            Ok(Err(RecvError::Lagged(n))) => {
                eprintln!("[warning] missed {n} events");
                if instrument.workflow().state() == WorkflowState::Completed {
                    println!("Workflow completed.");
                    return Ok(());
                }
            }
            Ok(Err(RecvError::Closed)) => bail!("event channel closed"),
            Err(_) => bail!("workflow did not complete within {wait_secs} s"),
        }
    }
}

async fn cmd_stop_workflow(instrument: &Instrument) -> Result<()> {
    instrument
        .workflow()
        .stop_remote()
        .await
        .context("failed to send workflow stop")?;
    println!("Stop sent.");
    Ok(())
}

async fn cmd_monitor(instrument: &Instrument, duration_secs: u64) -> Result<()> {
    let mut events = instrument.subscribe();
    println!("Monitoring instrument events (Ctrl-C to stop)...");

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));

    loop {
        let timeout = match deadline {
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    println!("Monitor duration elapsed.");
                    break;
                }
                remaining
            }
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = tokio::time::timeout(timeout, events.recv()) => match received {
                Ok(Ok(InstrumentEvent::Notification(message))) => {
                    let name = instrument.dispatcher().table().name(message.code());
                    println!("[notification] {name}");
                    print_message(&message);
                }
                Ok(Ok(event)) => println!("[event] {event:?}"),
                Ok(Err(RecvError::Lagged(n))) => {
                    println!("[warning] missed {n} events (consumer too slow)");
                }
                Ok(Err(RecvError::Closed)) => {
                    println!("Event channel closed.");
                    break;
                }
                Err(_) => {
                    if deadline.is_some() {
                        println!("Monitor duration elapsed.");
                    }
                    break;
                }
            },
        }
    }
    Ok(())
}

fn print_message(message: &Message) {
    let frame = &message.frame;
    println!("  code:    0x{:04X}", frame.code);
    println!("  status:  0x{:08X}", frame.status);
    println!("  params:  {:?}", frame.params);
    println!("  value:   {}", frame.value);
    let data = frame.data_str();
    if !data.is_empty() {
        println!("  data:    {data}");
    }
    if !message.payload.is_empty() {
        println!("  payload: {} bytes", message.payload.len());
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

async fn connect(cli: &Cli) -> Result<Instrument> {
    let table = match &cli.table {
        Some(path) => CommandTable::from_file(path)
            .with_context(|| format!("failed to load command table {}", path.display()))?,
        None => CommandTable::canonical(),
    };

    let mut builder = InstrumentBuilder::new()
        .host(&cli.host)
        .command_port(cli.port)
        .command_table(table)
        .load_settings(!cli.no_settings);
    if let Some(ms) = cli.timeout_ms {
        builder = builder.command_timeout(Duration::from_millis(ms));
    }
    builder
        .build()
        .await
        .with_context(|| format!("failed to connect to {}:{}", cli.host, cli.port))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lsctl=info")),
        )
        .init();

    let cli = Cli::parse();
    let instrument = connect(&cli).await?;

    let result = match &cli.command {
        Command::Status => cmd_status(&instrument).await,
        Command::Settings { key } => cmd_settings(&instrument, key.as_deref()).await,
        Command::Send {
            code,
            params,
            value,
            wait,
            no_wait,
        } => {
            let wait = match (*wait, *no_wait) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            cmd_send(&instrument, *code, params, *value, wait).await
        }
        Command::Position { axis } => cmd_position(&instrument, *axis).await,
        Command::LasersOff => instrument
            .disable_all_lasers()
            .await
            .context("failed to disable lasers")
            .map(|()| println!("All lasers disabled.")),
        Command::RunWorkflow { file, wait_secs } => {
            cmd_run_workflow(&instrument, file, *wait_secs).await
        }
        Command::StopWorkflow => cmd_stop_workflow(&instrument).await,
        Command::Monitor { duration } => cmd_monitor(&instrument, *duration).await,
    };

    instrument.disconnect().await.ok();
    result
}
