//! Discovery of NMEA sensors.
//!
//! The driver serves exactly two sensor URIs: [`UDP_URI`] and
//! [`UART_URI`]. [`list`] enumerates them, [`config`] builds the
//! connection schema for one of them (with the serial ports and IPv4
//! addresses present at call time) and [`connect`] creates a driver
//! instance.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::device::{DriverError, SensorHost};
use crate::driver::{connect_schema, NmeaDriver};
use crate::schema::Schema;
use crate::{DRIVER_NAME, UART_URI, UDP_URI};

/// One discoverable sensor.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoverInfo {
    pub label: String,
    pub uri: String,
}

/// Driver identity advertised to hosts.
#[derive(Debug, Clone, Serialize)]
pub struct DriverInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub build_id: &'static str,
}

/// The sensors this driver can connect to.
pub fn list() -> Vec<DiscoverInfo> {
    vec![
        DiscoverInfo {
            label: "UDP NMEA sensor".to_string(),
            uri: UDP_URI.to_string(),
        },
        DiscoverInfo {
            label: "UART NMEA sensor".to_string(),
            uri: UART_URI.to_string(),
        },
    ]
}

/// Connection schema for `uri`, or `None` for a URI this driver does
/// not serve.
pub fn config(uri: &str) -> Option<Schema> {
    connect_schema(uri)
}

/// Whether `uri` names a sensor this driver can connect to. Matching is
/// case-insensitive.
pub fn check(uri: &str) -> bool {
    uri.eq_ignore_ascii_case(UART_URI) || uri.eq_ignore_ascii_case(UDP_URI)
}

/// Connects to the sensor at `uri`. See [`NmeaDriver::connect`].
pub fn connect(
    uri: &str,
    params: &Map<String, Value>,
    host: Arc<dyn SensorHost>,
) -> Result<NmeaDriver, DriverError> {
    NmeaDriver::connect(uri, params, host)
}

pub fn driver_info() -> DriverInfo {
    DriverInfo {
        name: DRIVER_NAME,
        version: env!("CARGO_PKG_VERSION"),
        build_id: env!("NMEA_DRIVER_BUILD_ID"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sensors_are_listed() {
        let sensors = list();
        assert_eq!(sensors.len(), 2);
        assert!(sensors.iter().any(|info| info.uri == UDP_URI));
        assert!(sensors.iter().any(|info| info.uri == UART_URI));
    }

    #[test]
    fn check_is_case_insensitive() {
        assert!(check("nmea://uart"));
        assert!(check("NMEA://UDP"));
        assert!(!check("nmea://tcp"));
        assert!(!check("file://uart"));
    }

    #[test]
    fn every_listed_uri_has_a_config() {
        for info in list() {
            assert!(config(&info.uri).is_some(), "no schema for {}", info.uri);
        }
        assert!(config("nmea://tcp").is_none());
    }

    #[test]
    fn identity_is_populated() {
        let info = driver_info();
        assert_eq!(info.name, "NMEA-0183");
        assert!(!info.version.is_empty());
        assert!(!info.build_id.is_empty());
    }
}
