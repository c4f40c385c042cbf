//! Sentence assembler.
//!
//! Turns an arbitrarily chunked byte stream into framed NMEA sentences,
//! verifies their checksums and groups sentences that share a decoded
//! navigation time into blocks. GGA, RMC, BWC and ZDA sentences carry
//! the time of the navigation solution; a change in that time marks the
//! boundary of an epoch, so a block normally trails the input by one
//! receive cycle. Sentences without a usable time are emitted on their
//! own so they are never stranded behind the grouping.
//!
//! Blocks are delivered on a dedicated emitter thread through the
//! [`TransportListener`] installed with [`NmeaReceiver::set_listener`].
//! Block buffers come from a bounded free-list; when all buffers are in
//! flight the input is still consumed but the finished block is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::device::TransportListener;

/// Maximum size of one block, including the terminating NUL.
pub const MAX_BLOCK_SIZE: usize = 4084;

/// Maximum length of one sentence between `$` and CR.
pub const MAX_SENTENCE_SIZE: usize = 253;

/// A sentence shorter than this between `$` and CR cannot be valid NMEA.
const MIN_SENTENCE_SIZE: usize = 10;

/// Block buffers in the free-list.
const POOL_BUFFERS: usize = 16;

/// Input silence after which a half-built sentence and block are stale.
const IDLE_RESET: Duration = Duration::from_secs(2);

/// The emitter wakes up this often to check the terminate flag.
const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// One assembled block travelling from the parser to the emitter.
struct BlockMessage {
    time: i64,
    size: usize,
    data: [u8; MAX_BLOCK_SIZE],
}

impl BlockMessage {
    fn empty() -> Box<BlockMessage> {
        Box::new(BlockMessage {
            time: 0,
            size: 0,
            data: [0; MAX_BLOCK_SIZE],
        })
    }
}

struct ParserState {
    /// When input last reached `submit`.
    last_rx: Instant,

    /// Monotonic µs of the `$` of the sentence in progress.
    sentence_time: i64,
    sentence: [u8; MAX_SENTENCE_SIZE],
    sentence_size: usize,

    /// Monotonic µs of the `$` of the first sentence in the block.
    block_time: i64,
    block: [u8; MAX_BLOCK_SIZE],
    block_size: usize,

    /// Last decoded HHMMSS[.fff] as milliseconds of day, 0 when none.
    nmea_time: i32,
}

impl ParserState {
    fn new() -> ParserState {
        ParserState {
            last_rx: Instant::now(),
            sentence_time: 0,
            sentence: [0; MAX_SENTENCE_SIZE],
            sentence_size: 0,
            block_time: 0,
            block: [0; MAX_BLOCK_SIZE],
            block_size: 0,
            nmea_time: 0,
        }
    }
}

struct ReceiverInner {
    terminate: AtomicBool,
    skip_broken: AtomicBool,
    listener: Mutex<Option<Arc<dyn TransportListener>>>,
    queue_rx: Receiver<Box<BlockMessage>>,
    pool: Mutex<Vec<Box<BlockMessage>>>,
}

/// Assembles NMEA sentences from raw bytes and emits time-aligned
/// blocks. One receiver serves one transport.
pub struct NmeaReceiver {
    inner: Arc<ReceiverInner>,
    queue_tx: Sender<Box<BlockMessage>>,
    state: Mutex<ParserState>,
    emitter: Mutex<Option<JoinHandle<()>>>,
}

impl NmeaReceiver {
    pub fn new() -> NmeaReceiver {
        let (queue_tx, queue_rx) = bounded(POOL_BUFFERS);

        let mut buffers = Vec::with_capacity(POOL_BUFFERS);
        for _ in 0..POOL_BUFFERS {
            buffers.push(BlockMessage::empty());
        }

        let inner = Arc::new(ReceiverInner {
            terminate: AtomicBool::new(false),
            skip_broken: AtomicBool::new(false),
            listener: Mutex::new(None),
            queue_rx,
            pool: Mutex::new(buffers),
        });

        let emitter = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("nmea-emitter".into())
                .spawn(move || emitter_loop(inner))
                .expect("failed to spawn the nmea-emitter thread")
        };

        NmeaReceiver {
            inner,
            queue_tx,
            state: Mutex::new(ParserState::new()),
            emitter: Mutex::new(Some(emitter)),
        }
    }

    /// Installs the consumer of assembled blocks. `None` detaches it.
    pub fn set_listener(&self, listener: Option<Arc<dyn TransportListener>>) {
        *self.inner.listener.lock() = listener;
    }

    /// Controls handling of sentences whose checksum does not verify:
    /// skipped entirely when `skip` is set, otherwise kept in the block
    /// without contributing to time extraction.
    pub fn set_skip_broken(&self, skip: bool) {
        self.inner.skip_broken.store(skip, Ordering::SeqCst);
    }

    /// Signals an unrecoverable read error to the listener.
    pub fn io_error(&self) {
        let listener = self.inner.listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_io_error();
        }
    }

    /// Feeds a chunk of received bytes. `time_us` is the monotonic
    /// timestamp of the chunk; the `$` of every sentence starting inside
    /// it is stamped with this value. Returns `true` if at least one
    /// valid NMEA sentence was completed during the call.
    pub fn submit(&self, time_us: i64, data: &[u8]) -> bool {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let mut good_nmea = false;

        // Stale input: abandon whatever was half-built.
        if st.last_rx.elapsed() > IDLE_RESET {
            st.sentence_size = 0;
            st.block_size = 0;
            st.block_time = 0;
        }

        let skip_broken = self.inner.skip_broken.load(Ordering::SeqCst);

        for &byte in data {
            if byte == b'$' {
                st.sentence_time = time_us;
            }

            // Between sentences everything except a fresh `$` is noise.
            if st.sentence_size == 0 && byte != b'$' {
                continue;
            }

            if byte != b'\r' {
                if st.sentence_size >= MAX_SENTENCE_SIZE {
                    st.sentence_size = 0;
                    continue;
                }
                let size = st.sentence_size;
                st.sentence[size] = byte;
                st.sentence_size = size + 1;
                continue;
            }

            // CR: the sentence is complete.
            if st.sentence_size < MIN_SENTENCE_SIZE {
                st.sentence_size = 0;
                continue;
            }

            let bad_crc = !checksum_verifies(&st.sentence[..st.sentence_size]);
            if skip_broken && bad_crc {
                st.sentence_size = 0;
                continue;
            }

            good_nmea = true;

            let mut send_block = false;

            // GGA, RMC, BWC and ZDA all carry the time field at byte
            // offset 7. A broken sentence never contributes a time.
            let tag = &st.sentence[3..6];
            if !bad_crc && (tag == b"GGA" || tag == b"RMC" || tag == b"BWC" || tag == b"ZDA") {
                let nmea_time = decode_nmea_time(&st.sentence[..st.sentence_size]);
                if st.nmea_time != 0 && st.nmea_time != nmea_time {
                    send_block = true;
                }
                st.nmea_time = nmea_time;
            }

            if st.block_size + st.sentence_size + 3 > MAX_BLOCK_SIZE {
                send_block = true;
            }

            // Without a decoded time there is no epoch to group by;
            // the sentence goes out on its own.
            if st.nmea_time == 0 {
                self.emit_sentence(st);
                st.block_size = 0;
                st.block_time = 0;
                st.sentence_size = 0;
                continue;
            }

            if send_block && st.block_size > 0 {
                self.emit_block(st);
                st.block_size = 0;
                st.block_time = 0;
            }

            if st.block_size == 0 {
                st.block_time = st.sentence_time;
            }
            let (start, size) = (st.block_size, st.sentence_size);
            st.block[start..start + size].copy_from_slice(&st.sentence[..size]);
            st.block[start + size] = b'\r';
            st.block[start + size + 1] = b'\n';
            st.block_size = start + size + 2;
            st.sentence_size = 0;
        }

        if !data.is_empty() {
            st.last_rx = Instant::now();
        }

        good_nmea
    }

    /// Emits the pending block if nothing has arrived for `idle_secs`
    /// seconds. Transports that poll with a read timeout call this on
    /// every empty read so a finished epoch is not held back waiting for
    /// the next one.
    pub fn flush(&self, idle_secs: f64) {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        if st.last_rx.elapsed().as_secs_f64() > idle_secs && st.block_size > 0 {
            if self.emit_block(st) {
                st.block_size = 0;
                st.block_time = 0;
            }
            st.last_rx = Instant::now();
        }
    }

    /// One sentence, bypassing the block: sentence + CR LF + NUL.
    fn emit_sentence(&self, st: &mut ParserState) {
        let message = self.inner.pool.lock().pop();
        let Some(mut message) = message else {
            tracing::debug!("block buffers exhausted, sentence dropped");
            return;
        };

        let size = st.sentence_size;
        message.data[..size].copy_from_slice(&st.sentence[..size]);
        message.data[size] = b'\r';
        message.data[size + 1] = b'\n';
        message.data[size + 2] = 0;
        message.size = size + 3;
        message.time = st.sentence_time;

        self.push(message);
    }

    /// The accumulated block plus the terminating NUL.
    fn emit_block(&self, st: &mut ParserState) -> bool {
        let message = self.inner.pool.lock().pop();
        let Some(mut message) = message else {
            tracing::debug!("block buffers exhausted, block dropped");
            return false;
        };

        let size = st.block_size;
        message.data[..size].copy_from_slice(&st.block[..size]);
        message.data[size] = 0;
        message.size = size + 1;
        message.time = st.block_time;

        self.push(message);
        true
    }

    fn push(&self, message: Box<BlockMessage>) {
        // The queue is as deep as the pool, so this only fails after
        // the emitter has shut down.
        if let Err(rejected) = self.queue_tx.try_send(message) {
            self.inner.pool.lock().push(rejected.into_inner());
        }
    }
}

impl Default for NmeaReceiver {
    fn default() -> NmeaReceiver {
        NmeaReceiver::new()
    }
}

impl Drop for NmeaReceiver {
    fn drop(&mut self) {
        self.inner.terminate.store(true, Ordering::SeqCst);
        if let Some(handle) = self.emitter.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Delivers queued blocks to the listener and recycles their buffers.
fn emitter_loop(inner: Arc<ReceiverInner>) {
    while !inner.terminate.load(Ordering::SeqCst) {
        let message = match inner.queue_rx.recv_timeout(POP_TIMEOUT) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let listener = inner.listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_block(message.time, &message.data[..message.size]);
        }

        inner.pool.lock().push(message);
    }
}

/// XOR of everything between `$` and `*` must match the trailing
/// two-digit hex checksum.
fn checksum_verifies(sentence: &[u8]) -> bool {
    let size = sentence.len();

    let mut crc = 0u8;
    for &byte in &sentence[1..size - 3] {
        crc ^= byte;
    }

    if sentence[size - 3] != b'*' {
        return false;
    }
    match (hex_value(sentence[size - 2]), hex_value(sentence[size - 1])) {
        (Some(high), Some(low)) => crc == (high << 4 | low),
        _ => false,
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

/// Decodes the HHMMSS or HHMMSS.fff field at byte offset 7 into
/// milliseconds of day. Returns 0 when the field is missing or
/// malformed; midnight therefore collapses into "no time".
fn decode_nmea_time(sentence: &[u8]) -> i32 {
    fn two_digits(bytes: &[u8]) -> Option<i32> {
        if bytes.len() == 2 && bytes[0].is_ascii_digit() && bytes[1].is_ascii_digit() {
            Some(((bytes[0] - b'0') as i32) * 10 + (bytes[1] - b'0') as i32)
        } else {
            None
        }
    }

    if sentence.len() < 13 {
        return 0;
    }

    let (Some(hour), Some(min), Some(sec)) = (
        two_digits(&sentence[7..9]),
        two_digits(&sentence[9..11]),
        two_digits(&sentence[11..13]),
    ) else {
        return 0;
    };

    let mut time = 1000 * (3600 * hour + 60 * min + sec);

    if sentence.get(13) == Some(&b'.') {
        let mut msec = 0i32;
        let mut digits = false;
        for &byte in &sentence[14..] {
            if !byte.is_ascii_digit() {
                break;
            }
            msec = msec.saturating_mul(10).saturating_add((byte - b'0') as i32);
            digits = true;
        }
        if digits {
            time = time.saturating_add(msec);
        }
    }

    time
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Captures blocks delivered by the emitter thread.
    #[derive(Default)]
    struct Collector {
        blocks: Mutex<Vec<(i64, Vec<u8>)>>,
    }

    impl TransportListener for Collector {
        fn on_block(&self, time_us: i64, block: &[u8]) {
            self.blocks.lock().push((time_us, block.to_vec()));
        }
    }

    impl Collector {
        fn wait_for(&self, count: usize) -> Vec<(i64, Vec<u8>)> {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                {
                    let blocks = self.blocks.lock();
                    if blocks.len() >= count {
                        return blocks.clone();
                    }
                }
                assert!(Instant::now() < deadline, "blocks did not arrive in time");
                thread::sleep(Duration::from_millis(10));
            }
        }

        fn settle(&self) -> Vec<(i64, Vec<u8>)> {
            thread::sleep(Duration::from_millis(200));
            self.blocks.lock().clone()
        }
    }

    fn sentence(body: &str) -> String {
        let crc = body.bytes().fold(0u8, |acc, byte| acc ^ byte);
        format!("${body}*{crc:02X}\r")
    }

    fn receiver() -> (NmeaReceiver, Arc<Collector>) {
        let receiver = NmeaReceiver::new();
        let collector = Arc::new(Collector::default());
        let listener: Arc<dyn TransportListener> = collector.clone();
        receiver.set_listener(Some(listener));
        (receiver, collector)
    }

    #[test]
    fn sentence_without_time_is_emitted_immediately() {
        let (rx, collector) = receiver();

        let text = sentence("GPTXT,01,01,02,HELLO");
        assert!(rx.submit(1_000, text.as_bytes()));

        let blocks = collector.wait_for(1);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].0, 1_000);

        let expected = format!("{}\n\0", text);
        assert_eq!(blocks[0].1, expected.as_bytes());
    }

    #[test]
    fn sentences_with_equal_time_form_one_block() {
        let (rx, collector) = receiver();

        let gga = sentence("GPGGA,120000,5530.12,N,03730.12,E,1,08,0.9,12.0,M,0.0,M,,");
        let rmc = sentence("GPRMC,120000,A,5530.12,N,03730.12,E,0.4,084.4,010126,003.1,W");
        assert!(rx.submit(2_000, gga.as_bytes()));
        assert!(rx.submit(3_000, rmc.as_bytes()));

        // Nothing leaves until the epoch closes; force it out.
        thread::sleep(Duration::from_millis(20));
        rx.flush(0.0);

        let blocks = collector.wait_for(1);
        assert_eq!(blocks.len(), 1);
        // The block carries the time of its first `$`.
        assert_eq!(blocks[0].0, 2_000);

        let expected = format!("{gga}\n{rmc}\n\0");
        assert_eq!(blocks[0].1, expected.as_bytes());
    }

    #[test]
    fn time_change_closes_the_block() {
        let (rx, collector) = receiver();

        let first = sentence("GPGGA,120000,5530.12,N,03730.12,E,1,08,0.9,12.0,M,0.0,M,,");
        let second = sentence("GPGGA,120001,5530.12,N,03730.12,E,1,08,0.9,12.0,M,0.0,M,,");
        rx.submit(10_000, first.as_bytes());
        rx.submit(20_000, second.as_bytes());

        let blocks = collector.wait_for(1);
        assert_eq!(blocks[0].0, 10_000);
        assert_eq!(blocks[0].1, format!("{first}\n\0").as_bytes());

        thread::sleep(Duration::from_millis(20));
        rx.flush(0.0);

        let blocks = collector.wait_for(2);
        assert_eq!(blocks[1].0, 20_000);
        assert_eq!(blocks[1].1, format!("{second}\n\0").as_bytes());
        assert!(blocks[1].0 > blocks[0].0);
    }

    #[test]
    fn skip_broken_discards_bad_checksums() {
        let (rx, collector) = receiver();
        rx.set_skip_broken(true);

        assert!(!rx.submit(1_000, b"$GPGGA,120000,XYZ*00\r"));

        let good = sentence("GPTXT,01,01,02,STILL HERE");
        assert!(rx.submit(2_000, good.as_bytes()));

        let blocks = collector.wait_for(1);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].1, format!("{good}\n\0").as_bytes());
    }

    #[test]
    fn broken_sentence_is_kept_without_skip() {
        let (rx, collector) = receiver();

        // Wrong checksum: the sentence is kept but contributes no time,
        // so it leaves as a standalone block.
        assert!(rx.submit(1_000, b"$GPGGA,120000,XYZ*00\r"));

        let blocks = collector.wait_for(1);
        assert_eq!(blocks[0].1, b"$GPGGA,120000,XYZ*00\r\n\0");
    }

    #[test]
    fn oversize_sentence_is_dropped() {
        let (rx, collector) = receiver();

        let mut oversize = String::from("$GPTXT,");
        oversize.push_str(&"A".repeat(400));
        oversize.push('\r');
        assert!(!rx.submit(1_000, oversize.as_bytes()));

        let good = sentence("GPTXT,01,01,02,AFTER");
        assert!(rx.submit(2_000, good.as_bytes()));

        let blocks = collector.wait_for(1);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].1, format!("{good}\n\0").as_bytes());
    }

    #[test]
    fn sentence_length_boundaries() {
        // 253 bytes between `$` and CR: accepted.
        let body = format!("GPTXT,{}", "A".repeat(243));
        let max = sentence(&body);
        assert_eq!(max.len() - 1, 253);

        let (rx, collector) = receiver();
        assert!(rx.submit(1_000, max.as_bytes()));
        assert_eq!(collector.wait_for(1).len(), 1);

        // 254 bytes: dropped.
        let body = format!("GPTXT,{}", "A".repeat(244));
        let over = sentence(&body);
        assert_eq!(over.len() - 1, 254);

        let (rx, collector) = receiver();
        assert!(!rx.submit(1_000, over.as_bytes()));
        assert!(collector.settle().is_empty());
    }

    #[test]
    fn short_sentence_is_dropped() {
        let (rx, collector) = receiver();

        assert!(!rx.submit(1_000, b"$GPX*00\r"));
        assert!(collector.settle().is_empty());
    }

    #[test]
    fn idle_input_resets_partial_state() {
        let (rx, collector) = receiver();

        // A partial sentence, then silence past the idle limit.
        rx.submit(1_000, b"$GPGGA,1200");
        thread::sleep(Duration::from_millis(2_100));

        let good = sentence("GPTXT,01,01,02,FRESH");
        assert!(rx.submit(2_000, good.as_bytes()));

        let blocks = collector.wait_for(1);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].1, format!("{good}\n\0").as_bytes());
    }

    #[test]
    fn chunked_input_reassembles() {
        let (rx, collector) = receiver();

        let text = sentence("GPTXT,01,01,02,PIECES");
        let bytes = text.as_bytes();
        let mut good = false;
        for (i, byte) in bytes.iter().enumerate() {
            good |= rx.submit(1_000 + i as i64, &[*byte]);
        }
        assert!(good);

        let blocks = collector.wait_for(1);
        // The `$` arrived with the first byte's timestamp.
        assert_eq!(blocks[0].0, 1_000);
    }

    #[test]
    fn lowercase_checksum_is_accepted() {
        let body = "GPTXT,01,01,02,CASE";
        let crc = body.bytes().fold(0u8, |acc, byte| acc ^ byte);
        let text = format!("${body}*{crc:02x}\r");

        let (rx, collector) = receiver();
        assert!(rx.submit(1_000, text.as_bytes()));
        assert_eq!(collector.wait_for(1).len(), 1);
    }

    #[test]
    fn free_list_stays_bounded() {
        let (rx, collector) = receiver();

        for i in 0..40 {
            let text = sentence(&format!("GPTXT,01,01,02,MSG{i:02}"));
            rx.submit(i, text.as_bytes());
        }

        collector.wait_for(1);
        thread::sleep(Duration::from_millis(300));
        assert!(rx.inner.pool.lock().len() <= POOL_BUFFERS);
    }

    #[test]
    fn drop_joins_the_emitter_quickly() {
        let (rx, _collector) = receiver();
        let started = Instant::now();
        drop(rx);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn decode_time_variants() {
        assert_eq!(decode_nmea_time(b"$GPGGA,120000"), 43_200_000);
        assert_eq!(decode_nmea_time(b"$GPGGA,120000.500"), 43_200_500);
        // Fractional digits are read as a plain integer of milliseconds.
        assert_eq!(decode_nmea_time(b"$GPGGA,120000.5"), 43_200_005);
        assert_eq!(decode_nmea_time(b"$GPGGA,235959"), 86_399_000);
        // Midnight is indistinguishable from "no time".
        assert_eq!(decode_nmea_time(b"$GPGGA,000000"), 0);
        assert_eq!(decode_nmea_time(b"$GPGGA,12"), 0);
        assert_eq!(decode_nmea_time(b"$GPGGA,12AB00"), 0);
    }

    #[test]
    fn replaying_a_block_reproduces_it() {
        let (rx, collector) = receiver();

        let gga = sentence("GPGGA,120000,5530.12,N,03730.12,E,1,08,0.9,12.0,M,0.0,M,,");
        let rmc = sentence("GPRMC,120000,A,5530.12,N,03730.12,E,0.4,084.4,010126,003.1,W");
        rx.submit(1_000, gga.as_bytes());
        rx.submit(1_500, rmc.as_bytes());
        thread::sleep(Duration::from_millis(20));
        rx.flush(0.0);

        let first = collector.wait_for(1)[0].1.clone();

        // Feed the emitted block (minus the NUL) into a fresh assembler.
        let (replay, replay_collector) = receiver();
        replay.submit(5_000, &first[..first.len() - 1]);
        thread::sleep(Duration::from_millis(20));
        replay.flush(0.0);

        let blocks = replay_collector.wait_for(1);
        assert_eq!(blocks[0].1, first);
    }
}
