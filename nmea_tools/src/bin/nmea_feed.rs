//! Sends synthetic GGA/RMC sentence pairs over UDP, for exercising the
//! driver without sensor hardware.

use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(about = "Send synthetic NMEA sentences over UDP")]
struct Args {
    /// Destination host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Destination port.
    #[arg(long, default_value_t = 10000)]
    port: u16,

    /// Epochs to send, 0 for unbounded.
    #[arg(long, default_value_t = 0)]
    count: u64,

    /// Seconds between epochs.
    #[arg(long, default_value_t = 1.0)]
    interval: f64,
}

fn sentence(body: &str) -> String {
    let crc = body.bytes().fold(0u8, |acc, byte| acc ^ byte);
    format!("${body}*{crc:02X}\r\n")
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

    let socket = UdpSocket::bind("0.0.0.0:0").context("binding the send socket failed")?;
    let target = format!("{}:{}", args.host, args.port);
    let interval = Duration::from_secs_f64(args.interval.max(0.01));

    tracing::info!(
        dest = target.as_str(),
        interval_s = interval.as_secs_f64(),
        "feeding NMEA"
    );

    let mut sent = 0u64;
    loop {
        let now = Utc::now();
        let stamp = now.format("%H%M%S%.3f");

        let gga = sentence(&format!(
            "GPGGA,{stamp},5530.1230,N,03730.1230,E,1,08,0.9,12.0,M,0.0,M,,"
        ));
        let rmc = sentence(&format!(
            "GPRMC,{stamp},A,5530.1230,N,03730.1230,E,0.4,084.4,{},003.1,W",
            now.format("%d%m%y"),
        ));

        let epoch = format!("{gga}{rmc}");
        socket
            .send_to(epoch.as_bytes(), &target)
            .context("sending the datagram failed")?;
        tracing::debug!(bytes = epoch.len(), epoch = sent + 1, "datagram sent");

        sent += 1;
        if args.count != 0 && sent >= args.count {
            break;
        }
        thread::sleep(interval);
    }

    tracing::info!(sent, "feed finished");
    Ok(())
}
