//! Contracts between the driver, its transports and the host
//! application.

use std::sync::Arc;

use thiserror::Error;

/// Health of a driver instance, derived from data arrival timing and
/// I/O errors. A fresh instance starts in [`DeviceStatus::Error`] and is
/// promoted on the first received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Ok,
    Warning,
    Error,
}

impl DeviceStatus {
    /// Enum id used in the state schema.
    pub fn id(self) -> i64 {
        self as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Ok => "OK",
            DeviceStatus::Warning => "WARNING",
            DeviceStatus::Error => "ERROR",
        }
    }

    pub(crate) fn as_raw(self) -> i32 {
        self as i32
    }

    pub(crate) fn from_raw(raw: i32) -> DeviceStatus {
        match raw {
            0 => DeviceStatus::Ok,
            1 => DeviceStatus::Warning,
            _ => DeviceStatus::Error,
        }
    }
}

/// Severity of a `sensor-log` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Events a host application receives from a driver instance.
///
/// Callbacks arrive on driver-internal threads and must not block for
/// long; the driver never calls back while holding any of its locks.
pub trait SensorHost: Send + Sync + 'static {
    /// One complete block of NMEA sentences. `data` is one or more
    /// sentences each terminated with CR LF, followed by a terminating
    /// NUL; `time_us` is the monotonic time at which the `$` of the
    /// first sentence was observed.
    fn sensor_data(&self, device: &str, source: &str, time_us: i64, data: &[u8]);

    /// Human-readable driver message, sent on every status transition.
    fn sensor_log(&self, device: &str, time_us: i64, level: LogLevel, message: &str);

    /// The device status changed; the new value is readable through the
    /// `/state/<dev-id>/status` parameter.
    fn device_state(&self, device: &str);
}

/// Events a transport consumer observes: assembled blocks and the
/// out-of-band I/O error signal.
pub trait TransportListener: Send + Sync + 'static {
    /// A block left the sentence assembler. `block` is CR-LF framed and
    /// NUL terminated, `time_us` the start-of-block timestamp.
    fn on_block(&self, time_us: i64, block: &[u8]);

    /// Reading from the device failed in a way that is not a timeout.
    fn on_io_error(&self) {}
}

/// A bound data source: a serial port or a datagram socket feeding one
/// sentence assembler. The supervisor holds transports through this
/// interface; dropping a transport joins its threads.
pub trait Transport: Send + Sync {
    /// Routes assembled blocks and I/O errors to `listener`, replacing
    /// any previous listener.
    fn start(&self, listener: Arc<dyn TransportListener>);

    /// Detaches the listener and begins shutting the reader down.
    fn close(&self);
}

/// Errors surfaced synchronously from `connect`, `set_device` and
/// `set_address`. Background I/O problems are reported through the
/// status machinery instead.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unknown sensor uri `{0}`")]
    UnknownUri(String),

    #[error("invalid connection parameter `{0}`")]
    InvalidParam(String),

    #[error("invalid address `{0}`")]
    InvalidAddress(String),

    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),

    #[error("socket: {0}")]
    Io(#[from] std::io::Error),
}
