use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use wulpus_core::client::{BridgeClient, ClientError};
use wulpus_core::config;
use wulpus_proto::CONFIG_BLOCK_LEN;

/// WULPUS command-line client
#[derive(Parser)]
#[command(name = "wulpus", author, version, about = "Client for the WULPUS gateway bridge", long_about = None)]
struct Cli {
    /// Bridge address (ip:port); defaults to the configured client address
    #[arg(long, global = true)]
    addr: Option<String>,

    /// Seconds to wait for each reply
    #[arg(long, global = true, default_value_t = 3)]
    timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum RxMode {
    Start,
    Stop,
}

#[derive(Subcommand)]
enum Commands {
    /// Run diagnostic checks and output a report
    Doctor {
        /// Output JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
    /// Check that the bridge answers
    Ping,
    /// Send a configuration block read from a file
    Config {
        /// Raw configuration bytes, at most 68
        file: PathBuf,
    },
    /// Enable or disable sample streaming
    Rx {
        #[arg(value_enum)]
        mode: RxMode,
    },
    /// Start streaming and print sample frames
    Stream {
        /// Number of frames to receive
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Print frames as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// End the session
    Close,
    /// Restart the gateway
    Reset,
}

#[derive(Serialize)]
struct FrameLine {
    acq_nr: u16,
    tx_rx_id: u8,
    data_valid: u8,
    min: i16,
    max: i16,
}

fn fail(context: &str, err: ClientError) -> ! {
    eprintln!("{}: {}", context, err);
    process::exit(1);
}

fn resolve_addr(flag: Option<String>) -> String {
    if let Some(addr) = flag {
        return addr;
    }
    match config::load_config_or_default() {
        Ok((cfg, path)) => {
            if let Err(err) = cfg.validate() {
                eprintln!("Config validation failed ({}): {}", path.display(), err);
                process::exit(1);
            }
            cfg.client_addr()
        }
        Err(err) => {
            eprintln!("Failed to load config: {}", err);
            process::exit(1);
        }
    }
}

async fn connect(addr: &str, timeout: Duration) -> BridgeClient {
    match BridgeClient::connect(addr, timeout).await {
        Ok(client) => client,
        Err(err) => fail("connect failed", err),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout);
    let command = match cli.command {
        Some(command) => command,
        None => {
            println!("No subcommand provided. Try `wulpus ping`.");
            return;
        }
    };

    if let Commands::Doctor { json } = command {
        let report = wulpus_core::doctor::doctor_check().await;
        if json {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Failed to serialize doctor report: {}", e),
            }
        } else {
            println!("doctor: {}", report.overall);
            println!("version: {}", report.version);
            for check in report.checks {
                println!("- [{}] {}: {}", check.status, check.id, check.summary);
            }
        }
        return;
    }

    let addr = resolve_addr(cli.addr);
    let mut client = connect(&addr, timeout).await;

    match command {
        Commands::Doctor { .. } => {}
        Commands::Ping => match client.ping().await {
            Ok(rtt) => println!("pong from {} in {:?}", addr, rtt),
            Err(err) => fail("ping failed", err),
        },
        Commands::Config { file } => {
            let data = match fs::read(&file) {
                Ok(data) => data,
                Err(err) => {
                    eprintln!("Failed to read {}: {}", file.display(), err);
                    process::exit(1);
                }
            };
            if data.is_empty() || data.len() > CONFIG_BLOCK_LEN {
                eprintln!(
                    "Configuration must be 1..={} bytes, got {}",
                    CONFIG_BLOCK_LEN,
                    data.len()
                );
                process::exit(1);
            }
            if let Err(err) = client.send_config(&data).await {
                fail("config failed", err);
            }
            println!("sent {} configuration bytes", data.len());
        }
        Commands::Rx { mode } => {
            let result = match mode {
                RxMode::Start => client.start_rx().await,
                RxMode::Stop => client.stop_rx().await,
            };
            if let Err(err) = result {
                fail("rx failed", err);
            }
        }
        Commands::Stream { count, json } => {
            if let Err(err) = client.start_rx().await {
                fail("start rx failed", err);
            }
            for _ in 0..count {
                let acq = match client.receive_sample(timeout).await {
                    Ok(acq) => acq,
                    Err(err) => fail("stream failed", err),
                };
                let line = FrameLine {
                    acq_nr: acq.acq_nr,
                    tx_rx_id: acq.tx_rx_id,
                    data_valid: acq.data_valid,
                    min: acq.samples.iter().copied().min().unwrap_or_default(),
                    max: acq.samples.iter().copied().max().unwrap_or_default(),
                };
                if json {
                    match serde_json::to_string(&line) {
                        Ok(s) => println!("{}", s),
                        Err(e) => eprintln!("Failed to serialize frame: {}", e),
                    }
                } else {
                    println!(
                        "acq {:5} tx/rx {} valid {} range [{}, {}]",
                        line.acq_nr, line.tx_rx_id, line.data_valid, line.min, line.max
                    );
                }
            }
            if let Err(err) = client.stop_rx().await {
                fail("stop rx failed", err);
            }
        }
        Commands::Close => {
            if let Err(err) = client.close().await {
                fail("close failed", err);
            }
        }
        Commands::Reset => {
            if let Err(err) = client.reset().await {
                fail("reset failed", err);
            }
            println!("gateway restarting");
        }
    }
}
