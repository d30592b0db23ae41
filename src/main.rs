use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use serde_json::json;

use smartgadget_rs::prelude::*;
use smartgadget_rs::registers::now_ms;

/// Address used for the in-memory gadget when `--device` is omitted.
const SIMULATED_DEVICE: &str = "00:00:00:00:00:01";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Family {
    Sht3x,
    Shtc1,
}

impl From<Family> for DeviceFamily {
    fn from(family: Family) -> Self {
        match family {
            Family::Sht3x => DeviceFamily::Sht3x,
            Family::Shtc1 => DeviceFamily::Shtc1,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "smartgadget",
    version,
    about = "Read and download the data log of Sensirion Smart Gadgets"
)]
struct Cli {
    /// MAC address of the gadget, e.g. C4:A1:2F:00:9E:31
    #[arg(short, long)]
    device: Option<DeviceId>,

    /// Talk to an in-memory gadget instead of the Bluetooth adapter
    #[arg(long)]
    simulate: bool,

    #[arg(long, value_enum, default_value_t = Family::Sht3x)]
    family: Family,

    /// Connection attempts per operation
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Device information, current readout and logger registers
    Info,
    /// Current temperature, humidity and dew point
    Read,
    /// Battery level in percent
    Battery,
    /// Show the logger interval, or change it (this clears the log)
    Interval {
        /// New interval in ms
        #[arg(long)]
        set: Option<u32>,
    },
    /// Download the data log
    Fetch {
        /// Download passes to merge
        #[arg(long, default_value_t = 1)]
        iterations: usize,
        /// Oldest timestamp to download, ms since epoch
        #[arg(long)]
        oldest: Option<u64>,
        /// Newest timestamp to download, ms since epoch
        #[arg(long)]
        newest: Option<u64>,
        #[arg(long)]
        no_temperature: bool,
        #[arg(long)]
        no_humidity: bool,
        /// Leave the gadget clock alone
        #[arg(long)]
        no_sync: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Results go to stdout as JSON; logs go to stderr.  For verbose output:
    //   RUST_LOG=smartgadget_rs=debug smartgadget --simulate fetch
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let family = DeviceFamily::from(cli.family);

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = GadgetClientConfig {
        supervisor: SupervisorConfig {
            max_attempts: cli.max_attempts,
            ..SupervisorConfig::default()
        },
        ..GadgetClientConfig::default()
    };

    // ── Run ───────────────────────────────────────────────────────────────────
    let output = if cli.simulate {
        let id = match cli.device {
            Some(id) => id,
            None => SIMULATED_DEVICE.parse()?,
        };
        info!("Simulating a {family} gadget at {id}");
        let gadget = SimulatedGadget::new(SimConfig::demo(family, now_ms()));
        let mut client = GadgetClient::new(gadget, config);
        run(&mut client, id, &cli.command).await?
    } else {
        let id = cli
            .device
            .context("--device is required unless --simulate is given")?;
        let btle = BtleConfig {
            family,
            ..BtleConfig::default()
        };
        let mut client = GadgetClient::bluetooth(btle, config);
        let output = run(&mut client, id, &cli.command).await;
        client.disconnect_all().await;
        output?
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run<C: Connector>(
    client: &mut GadgetClient<C>,
    id: DeviceId,
    command: &Command,
) -> Result<serde_json::Value> {
    let value = match command {
        Command::Info => serde_json::to_value(client.info(id).await?)?,
        Command::Read => serde_json::to_value(client.temperature_humidity_dewpoint(id).await?)?,
        Command::Battery => json!({ "battery": client.battery(id).await? }),
        Command::Interval { set } => {
            if let Some(interval_ms) = *set {
                info!("Setting the logger interval of {id} to {interval_ms} ms; the log is cleared");
                client.set_logger_interval(id, interval_ms).await?;
            }
            json!({ "logger_interval_ms": client.logger_interval(id).await? })
        }
        Command::Fetch {
            iterations,
            oldest,
            newest,
            no_temperature,
            no_humidity,
            no_sync,
        } => {
            let options = FetchOptions {
                hints: WindowHints {
                    sync: if *no_sync { SyncTime::Skip } else { SyncTime::Now },
                    oldest_ms: *oldest,
                    newest_ms: *newest,
                },
                selection: StreamSelection {
                    temperature: !*no_temperature,
                    humidity: !*no_humidity,
                },
                num_iterations: *iterations,
            };
            let log = client.fetch_logged_data(id, &options).await?;
            info!(
                "{id}: {}/{} temperatures, {}/{} humidities after {} pass(es)",
                log.temperatures.filled(),
                log.temperatures.len(),
                log.humidities.filled(),
                log.humidities.len(),
                log.passes
            );
            serde_json::to_value(&log)?
        }
    };
    Ok(value)
}
