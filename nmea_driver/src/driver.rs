//! Driver supervisor.
//!
//! Owns the transport for one sensor instance: opens it, watches data
//! arrival, promotes the OK/WARNING/ERROR status, restarts the
//! transport after an I/O error and relays assembled blocks to the
//! host. A fixed UART port or a UDP address runs the *starter* loop;
//! UART with the reserved Auto port id runs the *scanner* loop, which
//! probes every serial device in parallel and keeps the first one that
//! produces valid NMEA.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::device::{DeviceStatus, DriverError, LogLevel, SensorHost, Transport, TransportListener};
use crate::schema::{stable_id, EnumValue, Schema};
use crate::uart::{list_uart_devices, NmeaUart, UartMode};
use crate::udp::{list_ipv4_addresses, NmeaUdp};
use crate::{monotonic_us, DRIVER_NAME, NMEA_SOURCE, UART_URI, UDP_URI};

pub(crate) const PARAM_DEVICE_ID: &str = "/dev-id";
pub(crate) const PARAM_TIMEOUT_WARNING: &str = "/timeout/warning";
pub(crate) const PARAM_TIMEOUT_ERROR: &str = "/timeout/error";
pub(crate) const PARAM_UART_PORT: &str = "/uart/port";
pub(crate) const PARAM_UART_MODE: &str = "/uart/mode";
pub(crate) const PARAM_UDP_ADDRESS: &str = "/udp/address";
pub(crate) const PARAM_UDP_PORT: &str = "/udp/port";

const DEFAULT_DEVICE_ID: &str = "nmea";
const DEFAULT_WARNING_TIMEOUT: f64 = 5.0;
const DEFAULT_ERROR_TIMEOUT: f64 = 30.0;
const DEFAULT_UDP_PORT: u16 = 10_000;

/// Supervisor tick.
const TICK: Duration = Duration::from_millis(100);

/// One probe sweep covers two full speed cycles on every port; after
/// that the sweep restarts with a fresh device list.
const PROBE_SWEEP: Duration = Duration::from_secs(25);

/// Parsed connection parameters.
#[derive(Debug, Clone)]
struct DriverParams {
    dev_id: String,
    uart_port: i64,
    uart_mode: UartMode,
    udp_address: i64,
    udp_port: u16,
    warning_timeout: f64,
    error_timeout: f64,
}

impl Default for DriverParams {
    fn default() -> DriverParams {
        DriverParams {
            dev_id: DEFAULT_DEVICE_ID.to_string(),
            uart_port: 0,
            uart_mode: UartMode::Auto,
            udp_address: 0,
            udp_port: DEFAULT_UDP_PORT,
            warning_timeout: DEFAULT_WARNING_TIMEOUT,
            error_timeout: DEFAULT_ERROR_TIMEOUT,
        }
    }
}

/// Connection schema for `uri`: the common keys plus the transport
/// specific ones, with ports and addresses enumerated at call time.
pub(crate) fn connect_schema(uri: &str) -> Option<Schema> {
    let uart = uri.eq_ignore_ascii_case(UART_URI);
    let udp = uri.eq_ignore_ascii_case(UDP_URI);
    if !uart && !udp {
        return None;
    }

    let mut schema = Schema::new();

    schema.add_string(PARAM_DEVICE_ID, "Device id", DEFAULT_DEVICE_ID);
    schema.add_double(
        PARAM_TIMEOUT_WARNING,
        "Timeout before warning",
        DEFAULT_WARNING_TIMEOUT,
        0.0,
        30.0,
        1.0,
    );
    schema.add_double(
        PARAM_TIMEOUT_ERROR,
        "Timeout before error",
        DEFAULT_ERROR_TIMEOUT,
        30.0,
        60.0,
        1.0,
    );

    if uart {
        let mut ports = vec![EnumValue::new(0, "auto", "Auto select")];
        for device in list_uart_devices() {
            ports.push(EnumValue::new(stable_id(&device.path), &device.name, &device.name));
        }
        schema.add_enum(PARAM_UART_PORT, "Port", 0, ports);

        let modes = [
            UartMode::Auto,
            UartMode::B4800,
            UartMode::B9600,
            UartMode::B19200,
            UartMode::B38400,
            UartMode::B57600,
            UartMode::B115200,
        ]
        .iter()
        .map(|mode| EnumValue::new(mode.id(), mode.key(), mode.label()))
        .collect();
        schema.add_enum(PARAM_UART_MODE, "Mode", UartMode::Auto.id(), modes);
    }

    if udp {
        let mut addresses = vec![
            EnumValue::new(0, "all", "All addresses"),
            EnumValue::new(1, "loopback", "Loopback"),
        ];
        for address in list_ipv4_addresses() {
            addresses.push(EnumValue::new(stable_id(&address), &address, &address));
        }
        schema.add_enum(PARAM_UDP_ADDRESS, "Address", 0, addresses);
        schema.add_integer(
            PARAM_UDP_PORT,
            "UDP port",
            DEFAULT_UDP_PORT as i64,
            1024,
            65_535,
            1,
        );
    }

    Some(schema)
}

/// Validates the parameter list against the URI's schema and extracts
/// the typed parameters. Unknown keys and out-of-range values reject
/// the whole connection.
fn parse_params(uri: &str, list: &Map<String, Value>) -> Result<DriverParams, DriverError> {
    let schema = connect_schema(uri).ok_or_else(|| DriverError::UnknownUri(uri.to_string()))?;
    let mut params = DriverParams::default();

    for (key, value) in list {
        if !schema.check(key, value) {
            return Err(DriverError::InvalidParam(key.clone()));
        }

        match key.as_str() {
            PARAM_DEVICE_ID => {
                if let Some(dev_id) = value.as_str() {
                    if !dev_id.is_empty() {
                        params.dev_id = dev_id.to_string();
                    }
                }
            }
            PARAM_TIMEOUT_WARNING => {
                if let Some(timeout) = value.as_f64() {
                    params.warning_timeout = timeout;
                }
            }
            PARAM_TIMEOUT_ERROR => {
                if let Some(timeout) = value.as_f64() {
                    params.error_timeout = timeout;
                }
            }
            PARAM_UART_PORT => {
                if let Some(port) = value.as_i64() {
                    params.uart_port = port;
                }
            }
            PARAM_UART_MODE => {
                if let Some(mode) = value.as_i64().and_then(UartMode::from_id) {
                    params.uart_mode = mode;
                }
            }
            PARAM_UDP_ADDRESS => {
                if let Some(address) = value.as_i64() {
                    params.udp_address = address;
                }
            }
            PARAM_UDP_PORT => {
                if let Some(port) = value.as_i64() {
                    params.udp_port = port as u16;
                }
            }
            _ => {}
        }
    }

    Ok(params)
}

/// State and info schema of one instance: driver identity strings plus
/// the live status key, all read-only.
fn state_schema(dev_id: &str) -> (Schema, String) {
    use crate::schema::KeyAccess;

    let mut schema = Schema::new();

    let info = [
        ("name", "Name", dev_id),
        ("drv", "Driver", DRIVER_NAME),
        ("drv-version", "Driver version", env!("CARGO_PKG_VERSION")),
        ("drv-build-id", "Driver build id", env!("NMEA_DRIVER_BUILD_ID")),
    ];
    for (suffix, label, value) in info {
        schema
            .add_string(&format!("/info/{dev_id}/{suffix}"), label, value)
            .access = KeyAccess::Read;
    }

    let status_key = format!("/state/{dev_id}/status");
    let statuses = [DeviceStatus::Ok, DeviceStatus::Warning, DeviceStatus::Error]
        .iter()
        .map(|status| EnumValue::new(status.id(), status.as_str(), status.as_str()))
        .collect();
    schema
        .add_enum(&status_key, "Status", DeviceStatus::Error.id(), statuses)
        .access = KeyAccess::Read;

    (schema, status_key)
}

struct DriverCore {
    uri: String,
    params: DriverParams,
    host: Arc<dyn SensorHost>,

    schema: Schema,
    status_key: String,

    enable: AtomicBool,
    shutdown: AtomicBool,
    io_error: AtomicBool,

    status: AtomicI32,
    prev_status: AtomicI32,

    /// Monotonic µs of the last received block.
    last_rx: AtomicI64,

    /// Raised when a transport occupies the slot below. The CAS on this
    /// flag is what serialises competing probe claims during a scan.
    bound: AtomicBool,
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

/// One connected sensor instance. Dropping it disconnects.
pub struct NmeaDriver {
    core: Arc<DriverCore>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl NmeaDriver {
    /// Validates `uri` and `params` against the connection schema and
    /// starts the supervisor. Invalid parameters reject the connection
    /// before any background work begins.
    pub fn connect(
        uri: &str,
        params: &Map<String, Value>,
        host: Arc<dyn SensorHost>,
    ) -> Result<NmeaDriver, DriverError> {
        let params = parse_params(uri, params)?;
        let (schema, status_key) = state_schema(&params.dev_id);

        // UART with the reserved Auto port id scans; everything else
        // connects directly.
        let scan = uri.eq_ignore_ascii_case(UART_URI) && params.uart_port == 0;

        let core = Arc::new(DriverCore {
            uri: uri.to_string(),
            params,
            host,
            schema,
            status_key,
            enable: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            io_error: AtomicBool::new(false),
            status: AtomicI32::new(DeviceStatus::Error.as_raw()),
            prev_status: AtomicI32::new(DeviceStatus::Error.as_raw()),
            last_rx: AtomicI64::new(monotonic_us()),
            bound: AtomicBool::new(false),
            transport: Mutex::new(None),
        });

        let supervisor = {
            let core = Arc::clone(&core);
            let (name, body): (&str, fn(Arc<DriverCore>)) = if scan {
                ("uart-scanner", scanner_loop)
            } else {
                ("nmea-starter", starter_loop)
            };
            thread::Builder::new()
                .name(name.into())
                .spawn(move || body(core))
                .expect("failed to spawn the supervisor thread")
        };

        tracing::debug!(uri = core.uri.as_str(), dev_id = core.params.dev_id.as_str(), "sensor connected");

        Ok(NmeaDriver {
            core,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Stops the supervisor and closes the transport. Idempotent; also
    /// runs on drop.
    pub fn disconnect(&self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().take() {
            let _ = handle.join();
        }

        let transport = self.core.transport.lock().take();
        if let Some(transport) = transport {
            transport.close();
        }
        self.core.bound.store(false, Ordering::SeqCst);

        tracing::debug!(uri = self.core.uri.as_str(), "sensor disconnected");
    }

    /// Toggles emission of `sensor-data` events for the named sensor.
    /// The transport keeps running either way so the status stays live.
    /// Returns `false` when `name` is not this instance's device id.
    pub fn set_enable(&self, name: &str, enable: bool) -> bool {
        if name != self.core.params.dev_id {
            return false;
        }
        self.core.enable.store(enable, Ordering::SeqCst);
        true
    }

    /// The state and info schema of this instance.
    pub fn schema(&self) -> &Schema {
        &self.core.schema
    }

    /// Reads a state parameter. Only the status key is live; everything
    /// else in the schema is constant.
    pub fn param_get(&self, key: &str) -> Option<Value> {
        if key == self.core.status_key {
            Some(Value::from(self.status().id()))
        } else {
            None
        }
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_raw(self.core.status.load(Ordering::SeqCst))
    }
}

impl Drop for NmeaDriver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Regular data path: resets the data timer, promotes the status and
/// relays the block to the host.
struct BlockRelay {
    core: Weak<DriverCore>,
}

impl TransportListener for BlockRelay {
    fn on_block(&self, time_us: i64, block: &[u8]) {
        let Some(core) = self.core.upgrade() else { return };

        core.last_rx.store(monotonic_us(), Ordering::SeqCst);
        core.status.store(DeviceStatus::Ok.as_raw(), Ordering::SeqCst);

        if core.enable.load(Ordering::SeqCst) {
            core.host
                .sensor_data(&core.params.dev_id, NMEA_SOURCE, time_us, block);
        }
    }

    fn on_io_error(&self) {
        if let Some(core) = self.core.upgrade() {
            core.io_error.store(true, Ordering::SeqCst);
        }
    }
}

/// Probe path used during the UART scan: the first valid block claims
/// the transport slot and rewires the winner to the regular relay.
struct ProbeRelay {
    core: Weak<DriverCore>,
    uart: Weak<NmeaUart>,
}

impl TransportListener for ProbeRelay {
    fn on_block(&self, _time_us: i64, _block: &[u8]) {
        let Some(core) = self.core.upgrade() else { return };
        let Some(uart) = self.uart.upgrade() else { return };

        if core
            .bound
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            uart.start(Arc::new(BlockRelay {
                core: Arc::downgrade(&core),
            }));
            *core.transport.lock() = Some(uart);
            tracing::debug!("uart probe claimed the transport");
        }
    }
}

/// Direct connection loop: keep the configured port open and watch the
/// data flow.
fn starter_loop(core: Arc<DriverCore>) {
    while !core.shutdown.load(Ordering::SeqCst) {
        if core.bound.load(Ordering::SeqCst) {
            check_data(&core);
        } else if core.uri.eq_ignore_ascii_case(UART_URI) {
            start_uart(&core);
        } else if core.uri.eq_ignore_ascii_case(UDP_URI) {
            start_udp(&core);
        }

        thread::sleep(TICK);
    }
}

fn start_uart(core: &Arc<DriverCore>) {
    // Resolve the stored port id against the current enumeration; an
    // unplugged device is simply retried on the next tick.
    let path = list_uart_devices()
        .into_iter()
        .find(|device| stable_id(&device.path) == core.params.uart_port)
        .map(|device| device.path);
    let Some(path) = path else { return };

    let uart = NmeaUart::new();
    match uart.set_device(Some(&path), core.params.uart_mode) {
        Ok(()) => bind_transport(core, Arc::new(uart)),
        Err(err) => tracing::debug!(path = path.as_str(), "uart open failed: {err}"),
    }
}

fn start_udp(core: &Arc<DriverCore>) {
    let address = match core.params.udp_address {
        0 => Some("any".to_string()),
        1 => Some("loopback".to_string()),
        id => list_ipv4_addresses()
            .into_iter()
            .find(|address| stable_id(address) == id),
    };
    let Some(address) = address else { return };

    let udp = NmeaUdp::new();
    match udp.set_address(Some(&address), core.params.udp_port) {
        Ok(()) => bind_transport(core, Arc::new(udp)),
        Err(err) => tracing::debug!(address = address.as_str(), "udp open failed: {err}"),
    }
}

fn bind_transport(core: &Arc<DriverCore>, transport: Arc<dyn Transport>) {
    transport.start(Arc::new(BlockRelay {
        core: Arc::downgrade(core),
    }));
    *core.transport.lock() = Some(transport);
    core.bound.store(true, Ordering::SeqCst);
}

/// Auto-discovery loop: probe every UART in parallel, keep the first
/// one that yields valid NMEA, refresh the device list every sweep.
fn scanner_loop(core: Arc<DriverCore>) {
    let mut probes: Vec<Arc<NmeaUart>> = Vec::new();
    let mut sweep_started = Instant::now();

    while !core.shutdown.load(Ordering::SeqCst) {
        if core.bound.load(Ordering::SeqCst) {
            // A probe won; the losers are released here.
            release_probes(&core, &mut probes);
            check_data(&core);
        } else if probes.is_empty() {
            for device in list_uart_devices() {
                let uart = Arc::new(NmeaUart::new());
                if let Err(err) = uart.set_device(Some(&device.path), UartMode::Auto) {
                    tracing::debug!(path = device.path.as_str(), "probe open failed: {err}");
                    continue;
                }
                uart.start(Arc::new(ProbeRelay {
                    core: Arc::downgrade(&core),
                    uart: Arc::downgrade(&uart),
                }));
                probes.push(uart);
            }
            sweep_started = Instant::now();
        } else if sweep_started.elapsed() > PROBE_SWEEP {
            // Two full speed sweeps have passed without data; restart
            // with a fresh device list to pick up new hardware.
            release_probes(&core, &mut probes);
        }

        thread::sleep(TICK);
    }

    release_probes(&core, &mut probes);
}

fn release_probes(core: &DriverCore, probes: &mut Vec<Arc<NmeaUart>>) {
    if probes.is_empty() {
        return;
    }

    let bound = core.transport.lock().clone();
    for probe in probes.drain(..) {
        let probe: Arc<dyn Transport> = probe;
        // The winner lives on in the transport slot.
        let claimed = bound
            .as_ref()
            .is_some_and(|transport| Arc::ptr_eq(transport, &probe));
        if !claimed {
            probe.close();
        }
    }
}

/// Per-tick health check, run while a transport is bound.
fn check_data(core: &Arc<DriverCore>) {
    let elapsed = (monotonic_us() - core.last_rx.load(Ordering::SeqCst)) as f64 / 1e6;
    let mut current = core.status.load(Ordering::SeqCst);
    let mut disconnected = false;

    if core.io_error.swap(false, Ordering::SeqCst) {
        // The handle is gone. Drop the transport; the next tick (or the
        // next probe sweep) reopens it.
        let transport = core.transport.lock().take();
        if let Some(transport) = transport {
            transport.close();
        }
        core.bound.store(false, Ordering::SeqCst);

        core.status
            .store(DeviceStatus::Error.as_raw(), Ordering::SeqCst);
        current = DeviceStatus::Error.as_raw();
        disconnected = true;
    } else if elapsed > core.params.error_timeout {
        core.status
            .store(DeviceStatus::Error.as_raw(), Ordering::SeqCst);
        current = DeviceStatus::Error.as_raw();
    } else if elapsed > core.params.warning_timeout {
        // CAS so a block landing right now is not demoted.
        if core
            .status
            .compare_exchange(
                DeviceStatus::Ok.as_raw(),
                DeviceStatus::Warning.as_raw(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            current = DeviceStatus::Warning.as_raw();
        }
    }

    if core.prev_status.load(Ordering::SeqCst) != current {
        let message = match DeviceStatus::from_raw(current) {
            DeviceStatus::Ok => "The sensor is fully operational.",
            DeviceStatus::Warning => "Temporary error while receiving data.",
            DeviceStatus::Error if disconnected => {
                "An error occurred while receiving data, port disconnected."
            }
            DeviceStatus::Error => "An error occurred while receiving data.",
        };

        core.host.device_state(&core.params.dev_id);
        core.host
            .sensor_log(&core.params.dev_id, monotonic_us(), LogLevel::Info, message);

        core.prev_status.store(current, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply_without_params() {
        let params = parse_params(UDP_URI, &Map::new()).unwrap();
        assert_eq!(params.dev_id, "nmea");
        assert_eq!(params.udp_port, 10_000);
        assert_eq!(params.udp_address, 0);
        assert_eq!(params.warning_timeout, 5.0);
        assert_eq!(params.error_timeout, 30.0);
    }

    #[test]
    fn uri_matching_is_case_insensitive() {
        assert!(parse_params("NMEA://UDP", &Map::new()).is_ok());
        assert!(parse_params("NMEA://UART", &Map::new()).is_ok());
        assert!(matches!(
            parse_params("nmea://tcp", &Map::new()),
            Err(DriverError::UnknownUri(_))
        ));
    }

    #[test]
    fn unknown_keys_reject_the_connection() {
        let mut list = Map::new();
        list.insert("/bogus".into(), json!(1));
        assert!(matches!(
            parse_params(UDP_URI, &list),
            Err(DriverError::InvalidParam(_))
        ));

        // UART keys are not part of the UDP schema.
        let mut list = Map::new();
        list.insert(PARAM_UART_MODE.into(), json!(1));
        assert!(parse_params(UDP_URI, &list).is_err());
    }

    #[test]
    fn out_of_range_values_reject_the_connection() {
        let mut list = Map::new();
        list.insert(PARAM_UDP_PORT.into(), json!(80));
        assert!(parse_params(UDP_URI, &list).is_err());

        let mut list = Map::new();
        list.insert(PARAM_TIMEOUT_ERROR.into(), json!(90.0));
        assert!(parse_params(UDP_URI, &list).is_err());
    }

    #[test]
    fn valid_params_are_extracted() {
        let mut list = Map::new();
        list.insert(PARAM_DEVICE_ID.into(), json!("gps0"));
        list.insert(PARAM_UDP_ADDRESS.into(), json!(1));
        list.insert(PARAM_UDP_PORT.into(), json!(20_000));
        list.insert(PARAM_TIMEOUT_WARNING.into(), json!(10));

        let params = parse_params(UDP_URI, &list).unwrap();
        assert_eq!(params.dev_id, "gps0");
        assert_eq!(params.udp_address, 1);
        assert_eq!(params.udp_port, 20_000);
        assert_eq!(params.warning_timeout, 10.0);
    }

    #[test]
    fn uart_mode_param_is_decoded() {
        let mut list = Map::new();
        list.insert(PARAM_UART_MODE.into(), json!(UartMode::B19200.id()));
        let params = parse_params(UART_URI, &list).unwrap();
        assert_eq!(params.uart_mode, UartMode::B19200);
    }

    #[test]
    fn connect_schema_splits_by_uri() {
        let uart = connect_schema(UART_URI).unwrap();
        assert!(uart.key(PARAM_UART_PORT).is_some());
        assert!(uart.key(PARAM_UART_MODE).is_some());
        assert!(uart.key(PARAM_UDP_PORT).is_none());

        let udp = connect_schema(UDP_URI).unwrap();
        assert!(udp.key(PARAM_UDP_ADDRESS).is_some());
        assert!(udp.key(PARAM_UDP_PORT).is_some());
        assert!(udp.key(PARAM_UART_PORT).is_none());

        assert!(connect_schema("nmea://pigeon").is_none());
    }

    #[test]
    fn state_schema_exposes_status_and_info() {
        let (schema, status_key) = state_schema("gps0");
        assert_eq!(status_key, "/state/gps0/status");
        assert!(schema.key(&status_key).is_some());
        assert!(schema.key("/info/gps0/name").is_some());
        assert!(schema.key("/info/gps0/drv").is_some());
        assert!(schema.key("/info/gps0/drv-version").is_some());
        assert!(schema.key("/info/gps0/drv-build-id").is_some());
    }

    #[derive(Default)]
    struct TestHost {
        logs: Mutex<Vec<String>>,
        states: Mutex<Vec<String>>,
    }

    impl SensorHost for TestHost {
        fn sensor_data(&self, _device: &str, _source: &str, _time_us: i64, _data: &[u8]) {}

        fn sensor_log(&self, _device: &str, _time_us: i64, _level: LogLevel, message: &str) {
            self.logs.lock().push(message.to_string());
        }

        fn device_state(&self, device: &str) {
            self.states.lock().push(device.to_string());
        }
    }

    struct FakeTransport {
        closed: Arc<AtomicBool>,
    }

    impl Transport for FakeTransport {
        fn start(&self, _listener: Arc<dyn TransportListener>) {}

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn test_core(host: Arc<TestHost>, params: DriverParams) -> Arc<DriverCore> {
        let (schema, status_key) = state_schema(&params.dev_id);
        Arc::new(DriverCore {
            uri: UDP_URI.to_string(),
            params,
            host,
            schema,
            status_key,
            enable: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            io_error: AtomicBool::new(false),
            status: AtomicI32::new(DeviceStatus::Error.as_raw()),
            prev_status: AtomicI32::new(DeviceStatus::Error.as_raw()),
            last_rx: AtomicI64::new(monotonic_us()),
            bound: AtomicBool::new(false),
            transport: Mutex::new(None),
        })
    }

    #[test]
    fn io_error_drops_the_transport_and_reports() {
        let host = Arc::new(TestHost::default());
        let core = test_core(host.clone(), DriverParams::default());

        let closed = Arc::new(AtomicBool::new(false));
        bind_transport(
            &core,
            Arc::new(FakeTransport {
                closed: Arc::clone(&closed),
            }),
        );
        assert!(core.bound.load(Ordering::SeqCst));

        // The sensor was healthy when the handle died.
        core.status.store(DeviceStatus::Ok.as_raw(), Ordering::SeqCst);
        core.prev_status
            .store(DeviceStatus::Ok.as_raw(), Ordering::SeqCst);
        core.io_error.store(true, Ordering::SeqCst);

        check_data(&core);

        assert!(closed.load(Ordering::SeqCst));
        assert!(!core.bound.load(Ordering::SeqCst));
        assert!(core.transport.lock().is_none());
        assert_eq!(
            core.status.load(Ordering::SeqCst),
            DeviceStatus::Error.as_raw()
        );
        assert_eq!(
            host.logs.lock().as_slice(),
            ["An error occurred while receiving data, port disconnected."]
        );
        assert_eq!(host.states.lock().as_slice(), ["nmea"]);
    }

    #[test]
    fn data_silence_degrades_the_status() {
        let host = Arc::new(TestHost::default());
        let params = DriverParams {
            warning_timeout: 0.5,
            error_timeout: 2.0,
            ..DriverParams::default()
        };
        let core = test_core(host.clone(), params);

        core.status.store(DeviceStatus::Ok.as_raw(), Ordering::SeqCst);
        core.prev_status
            .store(DeviceStatus::Ok.as_raw(), Ordering::SeqCst);

        // Past the warning timeout but short of the error timeout.
        core.last_rx
            .store(monotonic_us() - 1_000_000, Ordering::SeqCst);
        check_data(&core);
        assert_eq!(
            core.status.load(Ordering::SeqCst),
            DeviceStatus::Warning.as_raw()
        );

        // Past the error timeout.
        core.last_rx
            .store(monotonic_us() - 3_000_000, Ordering::SeqCst);
        check_data(&core);
        assert_eq!(
            core.status.load(Ordering::SeqCst),
            DeviceStatus::Error.as_raw()
        );

        assert_eq!(
            host.logs.lock().as_slice(),
            [
                "Temporary error while receiving data.",
                "An error occurred while receiving data."
            ]
        );
    }

    #[test]
    fn warning_only_applies_from_ok() {
        let host = Arc::new(TestHost::default());
        let params = DriverParams {
            warning_timeout: 0.5,
            error_timeout: 30.0,
            ..DriverParams::default()
        };
        let core = test_core(host, params);

        // Silence in the warning range must not promote an ERROR that
        // is already latched; only OK degrades to WARNING.
        core.status
            .store(DeviceStatus::Error.as_raw(), Ordering::SeqCst);
        core.last_rx
            .store(monotonic_us() - 1_000_000, Ordering::SeqCst);
        check_data(&core);
        assert_eq!(
            core.status.load(Ordering::SeqCst),
            DeviceStatus::Error.as_raw()
        );
    }
}
