use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use modbus_engine::config::{install as install_config, Config};
use modbus_engine::{ModbusClient, ModbusServer, PrimaryTable, RegisterFile, RegisterStore};

/// Serve or query Modbus/TCP registers described by a register file
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// TOML settings (timeouts, retries, frame logging)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the register file and print change events as JSON lines
    Serve {
        #[arg(long)]
        registers: PathBuf,
        /// Overrides PORT from the register file
        #[arg(long)]
        port: Option<u16>,
    },
    /// Read one named value from a server
    Get {
        #[arg(long)]
        registers: PathBuf,
        /// coil, di, ir or hr
        #[arg(long)]
        table: PrimaryTable,
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Write one named value to a server
    Set {
        #[arg(long)]
        registers: PathBuf,
        #[arg(long)]
        table: PrimaryTable,
        #[arg(long)]
        name: String,
        #[arg(long)]
        value: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print every defined item with its address and mask, without any I/O
    Dump {
        #[arg(long)]
        registers: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct ValueReport<'a> {
    table: PrimaryTable,
    name: &'a str,
    value: String,
}

#[derive(Debug, Serialize)]
struct EntryReport<'a> {
    table: PrimaryTable,
    address: u16,
    mask: String,
    name: &'a str,
    value: String,
}

fn load_registers(path: &Path) -> Result<(RegisterFile, RegisterStore)> {
    let file = RegisterFile::from_path(path)
        .with_context(|| format!("loading register file {}", path.display()))?;
    let store = file
        .build_store()
        .with_context(|| format!("building registers from {}", path.display()))?;
    Ok((file, store))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn serve(registers: &Path, port: Option<u16>) -> Result<()> {
    let (file, store) = load_registers(registers)?;
    for line in &file.info {
        tracing::info!(info = %line, "register file");
    }
    let mut events = store.subscribe();
    let server = ModbusServer::new(store);
    let addr = server.start(port.unwrap_or(file.port)).await?;
    tracing::info!(%addr, "serving; Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = events.recv() => match ev {
                Ok(ev) => print_json(&ev)?,
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "change events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    }
    server.close();
    Ok(())
}

async fn connect_client(
    registers: &Path,
    host: Option<String>,
    port: Option<u16>,
) -> Result<ModbusClient> {
    let (file, store) = load_registers(registers)?;
    let mut target = file.target();
    if let Some(host) = host {
        target = target.with_host(host);
    }
    if let Some(port) = port {
        target = target.with_port(port);
    }
    let client = ModbusClient::new(store, target);
    client
        .connect()
        .await
        .with_context(|| format!("connecting to {}", client.target().addr))?;
    Ok(client)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &cli.settings {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        let cfg = Config::from_toml_str(&text)?;
        if install_config(cfg).is_err() {
            bail!("settings were already initialized");
        }
    }

    match cli.command {
        Command::Serve { registers, port } => serve(&registers, port).await?,
        Command::Get {
            registers,
            table,
            name,
            host,
            port,
        } => {
            let client = connect_client(&registers, host, port).await?;
            let value = client.remote_value(table, &name).await?;
            print_json(&ValueReport { table, name: &name, value })?;
            client.disconnect();
        }
        Command::Set {
            registers,
            table,
            name,
            value,
            host,
            port,
        } => {
            let client = connect_client(&registers, host, port).await?;
            let value = client.set_remote_value(table, &name, &value).await?;
            print_json(&ValueReport { table, name: &name, value })?;
            client.disconnect();
        }
        Command::Dump { registers } => {
            let (_, store) = load_registers(&registers)?;
            for table in PrimaryTable::ALL {
                for entry in store.entries(table) {
                    if entry.is_continuation() {
                        continue;
                    }
                    for (i, item) in entry.items.iter().enumerate() {
                        print_json(&EntryReport {
                            table,
                            address: entry.address,
                            mask: format!("{:04X}", item.mask),
                            name: &item.name,
                            value: store.get_at(table, entry.address, i)?,
                        })?;
                    }
                }
            }
        }
    }
    Ok(())
}
