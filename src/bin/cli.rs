//! Fieldlink CLI - Command-line interface
//!
//! Headless harness around the channel manager: monitor a peripheral over a
//! real or simulated transport, decode capture files, manage the config.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use fieldlink_core::cli::{
    describe_event, init_logging, print_exit_codes, CliResult, OutputFormat, Render,
};
use fieldlink_core::config::{log_dir, AppConfig};
use fieldlink_core::core::decoder::FrameDecoder;
use fieldlink_core::core::links::{eml_channel, gps_channel, telemetry_channel};
use fieldlink_core::core::transport::{
    list_ports, mock_devices, BleTransport, BleTransportConfig, DeviceDescriptor, ListenConfig,
    ListenTransport, SerialConfig, SerialTransport, SimulatedProfile, SimulatedTransport,
    Transport, TransportKind,
};
use fieldlink_core::{Channel, ChannelKind, EmlDecoder, GpsDecoder, JsonStreamDecoder};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

/// Fieldlink CLI
#[derive(Parser, Debug)]
#[command(
    name = "fieldlink",
    version,
    about = "GPS, EML locator and telemetry link manager",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Also write JSON logs to the platform log directory
    #[arg(long, global = true)]
    log_file: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "FIELDLINK_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports, or BLE peripherals with --ble
    ListPorts {
        /// Scan for BLE peripherals instead
        #[arg(long)]
        ble: bool,

        /// BLE scan duration (seconds)
        #[arg(long, default_value = "5")]
        scan_secs: u64,
    },

    /// Monitor a channel over a serial port (USB or RFCOMM tty)
    MonitorSerial {
        /// Channel protocol
        #[arg(short, long, default_value = "gps")]
        channel: ChannelKind,

        /// Serial port name (e.g., /dev/ttyUSB0, /dev/rfcomm0, COM3)
        #[arg(short, long)]
        port: String,

        /// Baud rate (defaults to the channel's configured rate)
        #[arg(short, long)]
        baud: Option<u32>,

        /// Exit after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Monitor a channel over Bluetooth LE
    MonitorBle {
        /// Channel protocol
        #[arg(short, long, default_value = "gps")]
        channel: ChannelKind,

        /// Peripheral id or address, as shown by `list-ports --ble`
        #[arg(short, long)]
        device: String,

        /// Exit after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Wait for a peripheral that connects to us
    Listen {
        /// Channel protocol
        #[arg(short, long, default_value = "eml")]
        channel: ChannelKind,

        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:4352")]
        bind: String,

        /// Silence that ends one message (ms)
        #[arg(long, default_value = "500")]
        quiet_ms: u64,

        /// Exit after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Run a channel against the simulated peripheral
    Simulate {
        /// Channel protocol (gps or eml)
        #[arg(short, long, default_value = "gps")]
        channel: ChannelKind,

        /// Emit interval (ms)
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Exit after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Decode a capture file offline
    Parse {
        /// Channel protocol
        #[arg(short, long, default_value = "gps")]
        channel: ChannelKind,

        /// Capture file
        file: PathBuf,

        /// Feed the decoder this many bytes at a time
        #[arg(long, default_value = "64")]
        chunk: usize,
    },

    /// Show or create the configuration file
    Config {
        /// Print the effective configuration (the default action)
        #[arg(long, conflicts_with = "init")]
        show: bool,

        /// Write a default configuration file
        #[arg(long)]
        init: bool,

        /// Overwrite an existing file with --init
        #[arg(long, requires = "init")]
        force: bool,
    },

    /// Print the exit code table
    ExitCodes,
}

/// How long a monitor runs
#[derive(Debug, Clone, Copy)]
struct RunOptions {
    format: OutputFormat,
    quiet: bool,
    duration: Option<Duration>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return CliResult::from_error(&e).to_exit_code();
        }
    };

    let level = if cli.verbose {
        Some("debug")
    } else if cli.quiet {
        Some("error")
    } else {
        None
    };
    let mut logging = config.logging.clone();
    if cli.log_file && logging.directory.is_none() {
        logging.directory = log_dir();
    }
    let _guard = match init_logging(&logging, level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: could not set up logging: {e}");
            return CliResult::from(e).to_exit_code();
        }
    };

    match run(&cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let result = CliResult::from_error(&e);
            eprintln!("Error: {e:#}");
            result.to_exit_code()
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) if path.exists() => AppConfig::load_from(path)?,
        Some(_) => AppConfig::default(),
        None => AppConfig::load()?,
    };
    Ok(config)
}

async fn run(cli: &Cli, config: AppConfig) -> anyhow::Result<()> {
    match &cli.command {
        Commands::ListPorts { ble, scan_secs } => list_devices(cli, *ble, *scan_secs).await,

        Commands::MonitorSerial {
            channel,
            port,
            baud,
            duration,
        } => {
            let baud = baud.unwrap_or(channel_config(&config, *channel).baud_rate);
            let transport = SerialTransport::new(SerialConfig::new(baud));
            let device = DeviceDescriptor::new(port.clone(), TransportKind::Serial);
            monitor(cli, &config, *channel, Box::new(transport), device, *duration).await
        }

        Commands::MonitorBle {
            channel,
            device,
            duration,
        } => {
            let transport = BleTransport::new(BleTransportConfig::default());
            let device = DeviceDescriptor::new(device.clone(), TransportKind::Ble);
            monitor(cli, &config, *channel, Box::new(transport), device, *duration).await
        }

        Commands::Listen {
            channel,
            bind,
            quiet_ms,
            duration,
        } => {
            let transport = ListenTransport::new(ListenConfig {
                bind: bind.clone(),
                quiet_ms: *quiet_ms,
            });
            let device = ListenTransport::device_for(bind);
            monitor(cli, &config, *channel, Box::new(transport), device, *duration).await
        }

        Commands::Simulate {
            channel,
            interval_ms,
            duration,
        } => {
            let profile = match channel {
                ChannelKind::Gps => SimulatedProfile::Gps,
                ChannelKind::Eml => SimulatedProfile::Eml,
                ChannelKind::Telemetry => bail!("the simulator produces gps or eml data only"),
            };
            let transport = SimulatedTransport::new(profile)
                .interval(Duration::from_millis((*interval_ms).max(1)));
            let device = mock_devices()
                .into_iter()
                .next()
                .context("simulator has no devices")?;
            monitor(cli, &config, *channel, Box::new(transport), device, *duration).await
        }

        Commands::Parse {
            channel,
            file,
            chunk,
        } => parse_file(cli, &config, *channel, file, *chunk),

        Commands::Config { init, force, .. } => handle_config(cli, &config, *init, *force),

        Commands::ExitCodes => {
            print_exit_codes();
            Ok(())
        }
    }
}

fn channel_config(config: &AppConfig, kind: ChannelKind) -> &fieldlink_core::ChannelConfig {
    match kind {
        ChannelKind::Gps => &config.gps,
        ChannelKind::Eml => &config.eml,
        ChannelKind::Telemetry => &config.telemetry,
    }
}

async fn list_devices(cli: &Cli, ble: bool, scan_secs: u64) -> anyhow::Result<()> {
    let devices = if ble {
        if !cli.quiet {
            eprintln!("Scanning for {scan_secs} s...");
        }
        let mut transport = BleTransport::new(BleTransportConfig {
            scan_secs,
            ..BleTransportConfig::default()
        });
        transport.enumerate_devices().await?
    } else {
        list_ports()?
    };

    if devices.is_empty() {
        if !cli.quiet {
            eprintln!("No devices found.");
        }
        return Ok(());
    }

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&devices)?),
        OutputFormat::Text => {
            for device in &devices {
                match &device.address {
                    Some(address) if *address != device.id => {
                        println!("{:<40} {:<20} {}", device.id, address, device.label());
                    }
                    _ => println!("{:<40} {}", device.id, device.label()),
                }
            }
        }
    }
    Ok(())
}

async fn monitor(
    cli: &Cli,
    config: &AppConfig,
    kind: ChannelKind,
    transport: Box<dyn Transport>,
    device: DeviceDescriptor,
    duration: Option<u64>,
) -> anyhow::Result<()> {
    let options = RunOptions {
        format: cli.format,
        quiet: cli.quiet,
        duration: duration.map(Duration::from_secs),
    };

    match kind {
        ChannelKind::Gps => run_channel(gps_channel(&config.gps), transport, device, options).await,
        ChannelKind::Eml => run_channel(eml_channel(&config.eml), transport, device, options).await,
        ChannelKind::Telemetry => {
            run_channel(telemetry_channel(&config.telemetry), transport, device, options).await
        }
    }
}

async fn run_channel<R: Render + Send + Sync + 'static>(
    channel: Channel<R>,
    transport: Box<dyn Transport>,
    device: DeviceDescriptor,
    options: RunOptions,
) -> anyhow::Result<()> {
    let format = options.format;
    let subscription = channel.subscribe(move |record: &R| {
        println!("{}", record.render(format));
        Ok(())
    });

    let mut events = channel.events();
    let quiet = options.quiet;
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if !quiet {
                        let now = chrono::Local::now().format("%H:%M:%S");
                        eprintln!("[{now}] {}", describe_event(&event));
                    }
                }
                Err(RecvError::Lagged(n)) => debug!(skipped = n, "Event reporter lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(channel = %channel.kind(), device = %device, "Starting monitor");
    channel.set_transport(Some(transport)).await?;
    channel.select_device(Some(device)).await?;

    if !options.quiet {
        eprintln!("Monitoring {}. Press Ctrl+C to exit.", channel.kind());
    }

    match options.duration {
        Some(duration) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                () = tokio::time::sleep(duration) => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    subscription.unsubscribe();
    channel.shutdown().await?;
    reporter.abort();

    if !options.quiet {
        eprintln!("Disconnected.");
    }
    Ok(())
}

fn parse_file(
    cli: &Cli,
    config: &AppConfig,
    kind: ChannelKind,
    file: &Path,
    chunk: usize,
) -> anyhow::Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let channel = channel_config(config, kind);

    let (records, discarded) = match kind {
        ChannelKind::Gps => decode_all(
            GpsDecoder::new(channel.line_buffer_cap, channel.emit_invalid_fixes),
            &data,
            chunk,
            cli.format,
        ),
        ChannelKind::Eml => decode_all(
            EmlDecoder::new(channel.line_buffer_cap),
            &data,
            chunk,
            cli.format,
        ),
        ChannelKind::Telemetry => decode_all(
            JsonStreamDecoder::new(channel.json_buffer_cap),
            &data,
            chunk,
            cli.format,
        ),
    };

    if !cli.quiet {
        eprintln!("{records} records, {discarded} frames discarded");
    }
    Ok(())
}

fn decode_all<D>(mut decoder: D, data: &[u8], chunk: usize, format: OutputFormat) -> (usize, usize)
where
    D: FrameDecoder,
    D::Record: Render,
{
    let mut records = 0;
    let mut discarded = 0;

    for piece in data.chunks(chunk.max(1)) {
        let decoded = decoder.decode(piece);
        for record in &decoded.records {
            println!("{}", record.render(format));
        }
        for discard in &decoded.discarded {
            debug!(frame = %discard.frame, reason = %discard.reason, "Frame discarded");
        }
        if let Some(dropped) = decoded.overflowed {
            debug!(dropped, "Buffer overflow");
        }
        records += decoded.records.len();
        discarded += decoded.discarded.len();
    }
    (records, discarded)
}

fn handle_config(
    cli: &Cli,
    config: &AppConfig,
    init: bool,
    force: bool,
) -> anyhow::Result<()> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::default_path()?,
    };

    if init {
        if path.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", path.display());
        }
        AppConfig::default().save_to(&path)?;
        if !cli.quiet {
            eprintln!("Wrote {}", path.display());
        }
        return Ok(());
    }

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => {
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(config)?);
        }
    }
    Ok(())
}
