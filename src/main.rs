//! Command-line front end for the calibration client

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use xcpcal_rs::config::DeviceConfig;
use xcpcal_rs::transport::serial::SerialLink;
use xcpcal_rs::{CalContext, ClientEvent, SignalConfig, Value, XcpClient};

#[derive(Parser)]
#[command(name = "xcpcal", about = "XCP-over-serial calibration and measurement", version)]
struct Cli {
    /// Device configuration file (JSON)
    #[arg(short, long, default_value = "device.json")]
    config: String,

    /// Override the serial port from the configuration
    #[arg(short, long)]
    port: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the slave's event channels and their cycle times
    Channels,
    /// Read a symbol once and print its raw and physical value
    Read {
        /// Scoped identifier, <database>/<name>
        identifier: String,
    },
    /// Write a physical value to a parameter
    Write {
        /// Scoped identifier, <database>/<name>
        identifier: String,
        /// Integer, float, or dictionary label
        value: String,
    },
    /// Run a measurement and print samples
    Measure {
        /// Polled signals as <identifier>[:rate_ms]
        #[arg(long = "poll")]
        poll: Vec<String>,
        /// DAQ signals as <identifier>@<event channel>
        #[arg(long = "daq")]
        daq: Vec<String>,
        /// Measurement duration in seconds
        #[arg(short, long, default_value_t = 5)]
        duration: u64,
    },
}

fn parse_value(text: &str) -> Value {
    if let Ok(v) = text.parse::<i64>() {
        Value::Integer(v)
    } else if let Ok(v) = text.parse::<f64>() {
        Value::Float(v)
    } else {
        Value::Text(text.to_string())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = DeviceConfig::load(&cli.config)
        .with_context(|| format!("loading configuration '{}'", cli.config))?;
    if let Some(port) = cli.port {
        config.serial.port = port;
    }

    let mut context = CalContext::new();
    for path in &config.databases {
        context
            .load_database(path)
            .with_context(|| format!("loading database {}", path.display()))?;
    }

    match cli.command {
        Command::Measure { ref poll, ref daq, .. } if poll.is_empty() && daq.is_empty() => {
            bail!("measure needs at least one --poll or --daq signal");
        }
        _ => {}
    }

    let context = Arc::new(configure_signals(context, &cli.command)?);
    let mut client = XcpClient::new(Arc::clone(&context));
    let link = SerialLink::open(&config.serial).context("opening serial port")?;
    client.connect(Box::new(link)).context("connecting")?;

    let result = run(&mut client, &cli.command);
    client.disconnect();
    result
}

fn configure_signals(context: CalContext, command: &Command) -> anyhow::Result<CalContext> {
    if let Command::Measure { poll, daq, .. } = command {
        for entry in poll {
            let (identifier, rate) = match entry.split_once(':') {
                Some((id, rate)) => (id, rate.parse::<u64>().context("poll rate")?),
                None => (entry.as_str(), 100),
            };
            context.set_signal_config(SignalConfig::polling(identifier).with_rate_ms(rate));
        }
        for entry in daq {
            let (identifier, channel) = entry
                .split_once('@')
                .context("DAQ signals take the form <identifier>@<event channel>")?;
            context.set_signal_config(SignalConfig::daq(identifier, channel));
        }
    }
    Ok(context)
}

fn run(client: &mut XcpClient, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Channels => {
            let mut channels: Vec<_> = client.get_event_channels().into_iter().collect();
            channels.sort();
            for (name, cycle) in channels {
                println!("{:<24} {}", name, cycle);
            }
        }
        Command::Read { identifier } => {
            let (raw, physical) = client.upload(identifier)?;
            println!("{} = {} (raw {})", identifier, physical, raw);
        }
        Command::Write { identifier, value } => {
            client.download(identifier, &parse_value(value))?;
            let (_, physical) = client.upload(identifier)?;
            println!("{} = {}", identifier, physical);
        }
        Command::Measure { duration, .. } => {
            let events = client.subscribe();
            client.setup_measurement()?;
            client.start_measurement()?;

            let deadline = std::time::Instant::now() + Duration::from_secs(*duration);
            while std::time::Instant::now() < deadline {
                match events.recv_timeout(Duration::from_millis(100)) {
                    Ok(ClientEvent::Data(sample)) => {
                        println!(
                            "{} {:<32} {}",
                            sample.timestamp.format("%H:%M:%S%.3f"),
                            sample.identifier,
                            sample.physical
                        );
                    }
                    Ok(ClientEvent::Error(message)) => eprintln!("error: {}", message),
                    Ok(_) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
            client.stop_measurement()?;
        }
    }
    Ok(())
}
