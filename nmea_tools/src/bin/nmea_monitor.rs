//! Connects to an NMEA sensor and prints incoming data blocks and
//! status transitions until Ctrl-C.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nmea_driver::{discover, LogLevel, SensorHost};

#[derive(Parser)]
#[command(about = "Print NMEA data received through the sensor driver")]
struct Args {
    /// List discoverable sensors and their configuration schemas.
    #[arg(long)]
    list: bool,

    /// Sensor uri.
    #[arg(long, default_value = nmea_driver::UDP_URI)]
    uri: String,

    /// Device id used in state keys.
    #[arg(long, default_value = "nmea")]
    dev_id: String,

    /// UDP port to listen on (UDP sensor only).
    #[arg(long, default_value_t = 10000)]
    udp_port: u16,

    /// UART port id from the configuration schema, 0 for auto scan
    /// (UART sensor only).
    #[arg(long, default_value_t = 0)]
    uart_port: i64,
}

struct PrintHost;

impl SensorHost for PrintHost {
    fn sensor_data(&self, device: &str, source: &str, time_us: i64, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        println!(
            "{device}/{source} rx time {:.3}s\n{}",
            time_us as f64 / 1e6,
            text.trim_end_matches('\0'),
        );
    }

    fn sensor_log(&self, device: &str, _time_us: i64, level: LogLevel, message: &str) {
        println!("{device} [{level:?}] {message}");
    }

    fn device_state(&self, _device: &str) {}
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.list {
        for info in discover::list() {
            println!("{} ({})", info.uri, info.label);
            if let Some(schema) = discover::config(&info.uri) {
                println!("{}", serde_json::to_string_pretty(&schema)?);
            }
        }
        return Ok(());
    }

    if !discover::check(&args.uri) {
        bail!("unknown sensor uri {}", args.uri);
    }

    let mut params = Map::new();
    params.insert("/dev-id".to_string(), Value::from(args.dev_id.clone()));
    if args.uri.eq_ignore_ascii_case(nmea_driver::UDP_URI) {
        params.insert("/udp/port".to_string(), json!(args.udp_port));
    } else if args.uart_port != 0 {
        params.insert("/uart/port".to_string(), json!(args.uart_port));
    }

    let driver = discover::connect(&args.uri, &params, Arc::new(PrintHost))
        .with_context(|| format!("connecting to {} failed", args.uri))?;
    driver.set_enable(&args.dev_id, true);
    tracing::debug!(uri = args.uri.as_str(), "driver connected");

    let info = discover::driver_info();
    println!(
        "{} {} (build {}) listening on {}",
        info.name, info.version, info.build_id, args.uri
    );

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .context("installing the Ctrl-C handler failed")?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    driver.disconnect();
    Ok(())
}
