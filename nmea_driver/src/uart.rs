//! UART transport.
//!
//! Owns one serial port, feeds received bytes into a sentence assembler
//! and, in [`UartMode::Auto`], cycles through the standard NMEA speeds
//! until a sentence passes checksum validation. Reads are one byte at a
//! time under a timeout derived from the current speed, so an idle line
//! is noticed within a couple of character times.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serialport::{ClearBuffer, SerialPort, SerialPortType};

use crate::device::{DriverError, Transport, TransportListener};
use crate::monotonic_us;
use crate::receiver::NmeaReceiver;

/// Pause between iterations when the reader has nothing to read.
const LOOP_PAUSE: Duration = Duration::from_millis(100);

/// Pause while spinning in the reconfiguration handshake.
const HANDSHAKE_PAUSE: Duration = Duration::from_millis(10);

/// How long Auto mode listens on one speed before trying the next.
const SWEEP_PERIOD: Duration = Duration::from_secs(2);

/// Character times to wait for before a read times out.
const TIMEOUT_CHARS: u64 = 25;

/// Line configuration of a UART sensor. All fixed speeds are 8-N-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartMode {
    Disabled,
    /// Cycle through all fixed speeds until valid NMEA is seen.
    Auto,
    B4800,
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
}

impl UartMode {
    /// Enum id used in the connection schema.
    pub fn id(self) -> i64 {
        self as i64
    }

    pub fn from_id(id: i64) -> Option<UartMode> {
        match id {
            0 => Some(UartMode::Disabled),
            1 => Some(UartMode::Auto),
            2 => Some(UartMode::B4800),
            3 => Some(UartMode::B9600),
            4 => Some(UartMode::B19200),
            5 => Some(UartMode::B38400),
            6 => Some(UartMode::B57600),
            7 => Some(UartMode::B115200),
            _ => None,
        }
    }

    /// Schema key of the mode.
    pub fn key(self) -> &'static str {
        match self {
            UartMode::Disabled => "disabled",
            UartMode::Auto => "auto",
            UartMode::B4800 => "4800-8N1",
            UartMode::B9600 => "9600-8N1",
            UartMode::B19200 => "19200-8N1",
            UartMode::B38400 => "38400-8N1",
            UartMode::B57600 => "57600-8N1",
            UartMode::B115200 => "115200-8N1",
        }
    }

    /// Human-readable label of the mode.
    pub fn label(self) -> &'static str {
        match self {
            UartMode::Disabled => "Disabled",
            UartMode::Auto => "Auto select",
            UartMode::B4800 => "4800 8N1",
            UartMode::B9600 => "9600 8N1",
            UartMode::B19200 => "19200 8N1",
            UartMode::B38400 => "38400 8N1",
            UartMode::B57600 => "57600 8N1",
            UartMode::B115200 => "115200 8N1",
        }
    }

    fn baud(self) -> Option<u32> {
        match self {
            UartMode::B4800 => Some(4_800),
            UartMode::B9600 => Some(9_600),
            UartMode::B19200 => Some(19_200),
            UartMode::B38400 => Some(38_400),
            UartMode::B57600 => Some(57_600),
            UartMode::B115200 => Some(115_200),
            UartMode::Disabled | UartMode::Auto => None,
        }
    }

    /// Next speed in the Auto sweep: 4800 → … → 115200 → 4800.
    fn next_speed(self) -> UartMode {
        match self {
            UartMode::B4800 => UartMode::B9600,
            UartMode::B9600 => UartMode::B19200,
            UartMode::B19200 => UartMode::B38400,
            UartMode::B38400 => UartMode::B57600,
            UartMode::B57600 => UartMode::B115200,
            _ => UartMode::B4800,
        }
    }

    /// Read timeout: 25 character times, 10 bit times per character.
    fn read_timeout(self) -> Duration {
        match self.baud() {
            Some(baud) => Duration::from_micros(TIMEOUT_CHARS * 10 * 1_000_000 / baud as u64),
            None => LOOP_PAUSE,
        }
    }
}

/// A serial device visible on this host.
#[derive(Debug, Clone)]
pub struct UartDevice {
    /// Display name: `COM<n>` for on-board ports, `USBCOM<n>` for USB
    /// serial adapters.
    pub name: String,
    /// OS path used to open the device.
    pub path: String,
}

/// Enumerates serial devices, in stable path order.
pub fn list_uart_devices() -> Vec<UartDevice> {
    let mut ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(err) => {
            tracing::debug!("serial port enumeration failed: {err}");
            return Vec::new();
        }
    };
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));

    let mut devices = Vec::new();
    let mut com = 0u32;
    let mut usbcom = 0u32;

    for port in ports {
        let name = match port.port_type {
            SerialPortType::UsbPort(_) => {
                usbcom += 1;
                format!("USBCOM{usbcom}")
            }
            _ => {
                com += 1;
                format!("COM{com}")
            }
        };
        devices.push(UartDevice {
            name,
            path: port.port_name,
        });
    }

    devices
}

/// An open serial port plus the read timeout of its current speed.
struct OpenPort {
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

struct UartShared {
    receiver: NmeaReceiver,

    started: AtomicBool,
    configure: AtomicBool,
    terminate: AtomicBool,
    auto_speed: AtomicBool,

    /// Freshly opened port handed from `set_device` to the reader.
    pending: Mutex<Option<OpenPort>>,
}

/// NMEA receiver bound to a serial port. The reader thread starts with
/// the instance and idles until a device is selected.
pub struct NmeaUart {
    shared: Arc<UartShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl NmeaUart {
    pub fn new() -> NmeaUart {
        let shared = Arc::new(UartShared {
            receiver: NmeaReceiver::new(),
            started: AtomicBool::new(true),
            configure: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            auto_speed: AtomicBool::new(false),
            pending: Mutex::new(None),
        });

        let reader = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("uart-reader".into())
                .spawn(move || reader_loop(shared))
                .expect("failed to spawn the uart-reader thread")
        };

        NmeaUart {
            shared,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Selects the serial device and line mode. Safe to call repeatedly
    /// on a running instance: the reader is parked, the old port closed
    /// and the new one installed before reading resumes. `None` or
    /// [`UartMode::Disabled`] park the transport.
    pub fn set_device(&self, path: Option<&str>, mode: UartMode) -> Result<(), DriverError> {
        let shared = &self.shared;

        // Two-phase handshake: claim the configure latch, then wait for
        // the reader to close its port and park.
        while shared
            .configure
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            thread::sleep(HANDSHAKE_PAUSE);
        }
        while shared.started.load(Ordering::SeqCst) {
            thread::sleep(HANDSHAKE_PAUSE);
        }

        let result = Self::open_device(shared, path, mode);

        shared.started.store(true, Ordering::SeqCst);
        shared.configure.store(false, Ordering::SeqCst);

        result
    }

    fn open_device(shared: &UartShared, path: Option<&str>, mode: UartMode) -> Result<(), DriverError> {
        // Close any port the reader never picked up, old device first.
        shared.pending.lock().take();

        let Some(path) = path else { return Ok(()) };
        if mode == UartMode::Disabled {
            return Ok(());
        }

        let auto = mode == UartMode::Auto;
        shared.auto_speed.store(auto, Ordering::SeqCst);
        // While probing speeds only checksum-clean sentences count.
        shared.receiver.set_skip_broken(auto);

        let (baud, timeout) = match mode.baud() {
            Some(baud) => (baud, mode.read_timeout()),
            // The sweep installs a real speed on its first pass.
            None => (4_800, LOOP_PAUSE),
        };

        let port = serialport::new(path, baud).timeout(timeout).open()?;
        *shared.pending.lock() = Some(OpenPort { port, timeout });

        tracing::debug!(path, mode = mode.key(), "uart device selected");
        Ok(())
    }
}

impl Transport for NmeaUart {
    fn start(&self, listener: Arc<dyn TransportListener>) {
        self.shared.receiver.set_listener(Some(listener));
    }

    fn close(&self) {
        self.shared.receiver.set_listener(None);
        self.shared.terminate.store(true, Ordering::SeqCst);
    }
}

impl Default for NmeaUart {
    fn default() -> NmeaUart {
        NmeaUart::new()
    }
}

impl Drop for NmeaUart {
    fn drop(&mut self) {
        self.shared.terminate.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
    }
}

fn reader_loop(shared: Arc<UartShared>) {
    let mut device: Option<OpenPort> = None;
    let mut speed = UartMode::Disabled;
    let mut sweep_timer = Instant::now();
    let mut byte = [0u8; 1];

    while !shared.terminate.load(Ordering::SeqCst) {
        // Reconfiguration: close the port and park until the caller is
        // done swapping devices.
        if shared.configure.load(Ordering::SeqCst) {
            device = None;
            speed = UartMode::Disabled;
            shared.started.store(false, Ordering::SeqCst);
            thread::sleep(LOOP_PAUSE);
            continue;
        }

        if device.is_none() {
            device = shared.pending.lock().take();
        }
        let Some(dev) = device.as_mut() else {
            thread::sleep(LOOP_PAUSE);
            continue;
        };

        // Auto mode: advance to the next standard speed every sweep
        // period. The timer is reset whenever valid NMEA arrives, which
        // pins the sweep to a working speed.
        if shared.auto_speed.load(Ordering::SeqCst)
            && (speed == UartMode::Disabled || sweep_timer.elapsed() > SWEEP_PERIOD)
        {
            speed = speed.next_speed();
            if let Err(err) = apply_speed(dev, speed) {
                tracing::debug!(speed = speed.key(), "uart speed change failed: {err}");
            }
            sweep_timer = Instant::now();
        }

        match dev.port.read(&mut byte) {
            Ok(count) if count > 0 => {
                let time = monotonic_us();
                if shared.receiver.submit(time, &byte[..count]) {
                    sweep_timer = Instant::now();
                }
            }
            // A zero-length read means the device went away.
            Ok(_) => {
                shared.receiver.io_error();
                thread::sleep(LOOP_PAUSE);
            }
            Err(err)
                if err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                shared.receiver.flush(dev.timeout.as_secs_f64());
            }
            Err(err) => {
                tracing::debug!("uart read failed: {err}");
                shared.receiver.io_error();
                thread::sleep(LOOP_PAUSE);
            }
        }
    }
}

fn apply_speed(dev: &mut OpenPort, speed: UartMode) -> Result<(), DriverError> {
    let Some(baud) = speed.baud() else {
        return Ok(());
    };

    dev.port.set_baud_rate(baud)?;
    dev.timeout = speed.read_timeout();
    dev.port.set_timeout(dev.timeout)?;
    dev.port.clear(ClearBuffer::Input)?;

    Ok(())
}
