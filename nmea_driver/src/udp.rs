//! UDP transport.
//!
//! Owns one datagram socket bound to a local IPv4 address and feeds
//! every received datagram, as a whole, into a sentence assembler. The
//! assembler does the framing, so one datagram may carry several
//! sentences or a fragment of one. Unlike the UART transport the UDP
//! reader never flushes on idle; a block waits for the next epoch.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::device::{DriverError, Transport, TransportListener};
use crate::monotonic_us;
use crate::receiver::NmeaReceiver;

/// Pause between iterations when the reader has no socket, and the
/// receive timeout once it has one.
const LOOP_PAUSE: Duration = Duration::from_millis(100);

/// Pause while spinning in the reconfiguration handshake.
const HANDSHAKE_PAUSE: Duration = Duration::from_millis(10);

/// Kernel receive buffer: room for a burst of full datagrams.
const RECV_BUFFER_SIZE: usize = 64 * 4096;

/// Staging buffer for one datagram.
const DATAGRAM_CAPACITY: usize = 65_536;

/// Ports below this are treated as "no address selected".
const MIN_PORT: u16 = 1024;

/// Enumerates the local IPv4 addresses as dotted-quads.
pub fn list_ipv4_addresses() -> Vec<String> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => interfaces,
        Err(err) => {
            tracing::debug!("interface enumeration failed: {err}");
            return Vec::new();
        }
    };

    interfaces
        .into_iter()
        .filter_map(|(_, address)| match address {
            IpAddr::V4(v4) => Some(v4.to_string()),
            IpAddr::V6(_) => None,
        })
        .collect()
}

struct UdpShared {
    receiver: NmeaReceiver,

    started: AtomicBool,
    configure: AtomicBool,
    terminate: AtomicBool,

    /// Freshly bound socket handed from `set_address` to the reader.
    pending: Mutex<Option<UdpSocket>>,
}

/// NMEA receiver bound to a UDP socket. The reader thread starts with
/// the instance and idles until an address is selected.
pub struct NmeaUdp {
    shared: Arc<UdpShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl NmeaUdp {
    pub fn new() -> NmeaUdp {
        let shared = Arc::new(UdpShared {
            receiver: NmeaReceiver::new(),
            started: AtomicBool::new(true),
            configure: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            pending: Mutex::new(None),
        });

        let reader = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("udp-reader".into())
                .spawn(move || reader_loop(shared))
                .expect("failed to spawn the udp-reader thread")
        };

        NmeaUdp {
            shared,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Binds the receive socket. `address` is `"any"`, `"loopback"` or a
    /// dotted-quad; `None` or a port below 1024 park the transport.
    /// Safe to call repeatedly on a running instance.
    pub fn set_address(&self, address: Option<&str>, port: u16) -> Result<(), DriverError> {
        let shared = &self.shared;

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

        let result = Self::open_socket(shared, address, port);

        shared.started.store(true, Ordering::SeqCst);
        shared.configure.store(false, Ordering::SeqCst);

        result
    }

    fn open_socket(shared: &UdpShared, address: Option<&str>, port: u16) -> Result<(), DriverError> {
        shared.pending.lock().take();

        let Some(address) = address else { return Ok(()) };
        if port < MIN_PORT {
            return Ok(());
        }

        let ip = match address {
            "any" => Ipv4Addr::UNSPECIFIED,
            "loopback" => Ipv4Addr::LOCALHOST,
            other => other
                .parse::<Ipv4Addr>()
                .map_err(|_| DriverError::InvalidAddress(other.to_string()))?,
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        socket.bind(&SocketAddrV4::new(ip, port).into())?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(LOOP_PAUSE))?;
        *shared.pending.lock() = Some(socket);

        tracing::debug!(%ip, port, "udp socket bound");
        Ok(())
    }
}

impl Transport for NmeaUdp {
    fn start(&self, listener: Arc<dyn TransportListener>) {
        self.shared.receiver.set_listener(Some(listener));
    }

    fn close(&self) {
        self.shared.receiver.set_listener(None);
        self.shared.terminate.store(true, Ordering::SeqCst);
    }
}

impl Default for NmeaUdp {
    fn default() -> NmeaUdp {
        NmeaUdp::new()
    }
}

impl Drop for NmeaUdp {
    fn drop(&mut self) {
        self.shared.terminate.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
    }
}

fn reader_loop(shared: Arc<UdpShared>) {
    let mut socket: Option<UdpSocket> = None;
    let mut datagram = vec![0u8; DATAGRAM_CAPACITY];

    while !shared.terminate.load(Ordering::SeqCst) {
        if shared.configure.load(Ordering::SeqCst) {
            socket = None;
            shared.started.store(false, Ordering::SeqCst);
            thread::sleep(LOOP_PAUSE);
            continue;
        }

        if socket.is_none() {
            socket = shared.pending.lock().take();
        }
        let Some(bound) = socket.as_ref() else {
            thread::sleep(LOOP_PAUSE);
            continue;
        };

        match bound.recv(&mut datagram) {
            Ok(size) if size > 0 => {
                let time = monotonic_us();
                shared.receiver.submit(time, &datagram[..size]);
            }
            Ok(_) => {}
            // The bounded wait just drives the next terminate check.
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            // Failed datagrams are dropped.
            Err(err) => {
                tracing::trace!("udp receive failed: {err}");
            }
        }
    }
}
