//! Driver for NMEA 0183 sensors.
//!
//! The driver ingests NMEA sentences from navigation and sensor devices
//! over a serial (UART) transport or an IPv4 UDP transport, re-assembles
//! the byte stream into blocks of sentences sharing a common navigation
//! timestamp and publishes those blocks, together with device health,
//! through the [`SensorHost`] interface.
//!
//! A sensor is addressed by URI: [`UART_URI`] for serial devices,
//! [`UDP_URI`] for datagram input. The [`discover`] module lists both,
//! builds the per-URI connection schema and creates driver instances.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nmea_driver::{discover, LogLevel, SensorHost};
//!
//! struct Host;
//!
//! impl SensorHost for Host {
//!     fn sensor_data(&self, device: &str, _source: &str, _time_us: i64, data: &[u8]) {
//!         println!("{device}: {}", String::from_utf8_lossy(data));
//!     }
//!     fn sensor_log(&self, _device: &str, _time_us: i64, _level: LogLevel, message: &str) {
//!         println!("{message}");
//!     }
//!     fn device_state(&self, _device: &str) {}
//! }
//!
//! let params = serde_json::Map::new();
//! let driver = discover::connect(nmea_driver::UDP_URI, &params, Arc::new(Host)).unwrap();
//! driver.set_enable("nmea", true);
//! ```

pub mod device;
pub mod discover;
pub mod driver;
pub mod receiver;
pub mod schema;
pub mod uart;
pub mod udp;

pub use device::{DeviceStatus, DriverError, LogLevel, SensorHost, Transport, TransportListener};
pub use discover::{DiscoverInfo, DriverInfo};
pub use driver::NmeaDriver;
pub use receiver::NmeaReceiver;
pub use uart::{NmeaUart, UartDevice, UartMode};
pub use udp::NmeaUdp;

use std::sync::OnceLock;
use std::time::Instant;

/// Sensor URI of the UART transport.
pub const UART_URI: &str = "nmea://uart";

/// Sensor URI of the UDP transport.
pub const UDP_URI: &str = "nmea://udp";

/// Product name advertised through the driver info schema.
pub const DRIVER_NAME: &str = "NMEA-0183";

/// Source tag attached to every `sensor-data` event.
pub const NMEA_SOURCE: &str = "NMEA";

static MONOTONIC_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic time in microseconds.
///
/// All acquisition timestamps and log timestamps produced by the driver
/// come from this clock. The epoch is the first call in the process.
pub fn monotonic_us() -> i64 {
    let epoch = MONOTONIC_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}
