use std::process;
use std::sync::Arc;

use anyhow::Context;
use stdmux::{CommandLauncher, ContainerConfig, ContainerRegistry, ServerConfig};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage:
  stdmux demux [--raw]
  stdmux serve [--host <host>] [--port <port>] [--name <name>] [--tty] [--stdin] -- <command>...

Commands:
  demux    Split a multiplexed stream on stdin into stdout and stderr
  serve    Register one container running <command> and serve the attach API

Options:
  --raw            Copy stdin verbatim (TTY streams carry no frames)
  --host <host>    Listen address [default: 0.0.0.0]
  --port <port>    Listen port [default: 2375]
  --name <name>    Container id [default: main]
  --tty            Treat the container as a TTY (raw, merged output)
  --stdin          Keep the container's stdin open for attached clients";

#[derive(Debug, PartialEq)]
enum Command {
    Demux {
        raw: bool,
    },
    Serve {
        server: ServerConfig,
        name: String,
        tty: bool,
        open_stdin: bool,
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing(matches!(command, Command::Demux { .. }));

    if let Err(e) = run(command).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let subcommand = args.get(1).ok_or("missing command")?;
    let rest = &args[2..];
    match subcommand.as_str() {
        "demux" => parse_demux(rest),
        "serve" => parse_serve(rest),
        "--help" | "-h" => Err(String::new()),
        other => Err(format!("unknown command: {other}")),
    }
}

fn parse_demux(args: &[String]) -> Result<Command, String> {
    let mut raw = false;
    for arg in args {
        match arg.as_str() {
            "--raw" => raw = true,
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unexpected argument: {other}")),
        }
    }
    Ok(Command::Demux { raw })
}

fn parse_serve(args: &[String]) -> Result<Command, String> {
    let mut server = ServerConfig::default();
    let mut name = "main".to_string();
    let mut tty = false;
    let mut open_stdin = false;
    let mut command = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                server.host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                let port = args.get(i).ok_or("--port requires a value")?;
                server.port = port
                    .parse()
                    .map_err(|_| format!("invalid port: {port}"))?;
            }
            "--name" => {
                i += 1;
                name = args.get(i).ok_or("--name requires a value")?.clone();
            }
            "--tty" => tty = true,
            "--stdin" => open_stdin = true,
            "--" => {
                command = args[i + 1..].to_vec();
                break;
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    if command.is_empty() {
        return Err("missing container command after --".to_string());
    }
    Ok(Command::Serve {
        server,
        name,
        tty,
        open_stdin,
        command,
    })
}

/// Logs go to stderr. `demux` writes payload to stderr too, so it only logs
/// warnings unless asked otherwise.
fn init_tracing(quiet: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("STDMUX_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ if quiet => "warn",
            _ => "info",
        };
        EnvFilter::new(format!("stdmux={base_level},stdmux_cli={base_level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Demux { raw } => demux(raw).await,
        Command::Serve {
            server,
            name,
            tty,
            open_stdin,
            command,
        } => {
            let registry = Arc::new(ContainerRegistry::new(Arc::new(CommandLauncher::new())));
            let config = ContainerConfig::new(command)
                .with_tty(tty)
                .with_open_stdin(open_stdin);
            registry.create(name.clone(), config)?;
            tracing::info!(
                container_id = %name,
                tty,
                open_stdin,
                "Container registered, waiting for a start request"
            );
            stdmux::serve(server, registry).await
        }
    }
}

async fn demux(raw: bool) -> anyhow::Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    if raw {
        let copied = tokio::io::copy(&mut stdin, &mut stdout)
            .await
            .context("failed to copy stdin")?;
        stdout.flush().await?;
        tracing::debug!(copied, "Copied raw stream");
        return Ok(());
    }

    let mut stderr = tokio::io::stderr();
    let written = stdmux::decode_stream(stdin, &mut stdout, &mut stderr)
        .await
        .context("failed to demultiplex stdin")?;
    tracing::debug!(written, "Demultiplexed stream");
    Ok(())
}
