// Copyright © 2020 the courier developers
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software
// and associated documentation files (the "Software"), to deal in the Software without
// restriction, including without limitation the rights to use, copy, modify, merge, publish,
// distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or
// substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING
// BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
// DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Per-connection counters, salts, sequence windows and the smoothed round-trip estimate.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration as StdDuration;
use std::time::Instant;

use chrono::Duration;

// EWMA weight of a new RTT sample.
const RTT_SAMPLE_WEIGHT: f64 = 0.1;

/// Statistics for one connection.
///
/// Counters and window fields are atomics so any thread can read them without taking a lock;
/// the owning `PacketManager` is the only writer for the windowed fields.
pub struct NetworkStatistics {
    packets_sent: AtomicU32,
    messages_sent: AtomicU32,
    reliable_messages_sent: AtomicU32,
    packets_received: AtomicU32,
    messages_received: AtomicU32,
    packets_lost: AtomicU32,
    bytes_sent: AtomicU32,
    bytes_received: AtomicU32,

    salt: AtomicU64,
    remote_salt: AtomicU64,

    last_received_sequence_nr: AtomicU32,
    received_sequence_bits: AtomicU32,
    last_received_ack_nr: AtomicU32,
    received_ack_bits: AtomicU32,
    last_received_reliable_uid: AtomicU32,

    ping_nanos: AtomicU64,
    timestamp_last_sent: Mutex<Option<Instant>>,
    timestamp_last_received: Mutex<Option<Instant>>,
}

fn random_salt() -> u64 {
    loop {
        let salt = rand::random::<u64>();
        if salt != 0 {
            return salt;
        }
    }
}

impl NetworkStatistics {
    pub fn new() -> NetworkStatistics {
        NetworkStatistics {
            packets_sent: AtomicU32::new(0),
            messages_sent: AtomicU32::new(0),
            reliable_messages_sent: AtomicU32::new(0),
            packets_received: AtomicU32::new(0),
            messages_received: AtomicU32::new(0),
            packets_lost: AtomicU32::new(0),
            bytes_sent: AtomicU32::new(0),
            bytes_received: AtomicU32::new(0),
            salt: AtomicU64::new(random_salt()),
            remote_salt: AtomicU64::new(0),
            last_received_sequence_nr: AtomicU32::new(0),
            received_sequence_bits: AtomicU32::new(0),
            last_received_ack_nr: AtomicU32::new(0),
            received_ack_bits: AtomicU32::new(0),
            last_received_reliable_uid: AtomicU32::new(0),
            ping_nanos: AtomicU64::new(0),
            timestamp_last_sent: Mutex::new(None),
            timestamp_last_received: Mutex::new(None),
        }
    }

    /// Number of datagrams sent.
    pub fn packets_sent(&self) -> u32 {
        self.packets_sent.load(Ordering::SeqCst)
    }

    /// Number of messages sent, retries included.
    pub fn messages_sent(&self) -> u32 {
        self.messages_sent.load(Ordering::SeqCst)
    }

    pub fn reliable_messages_sent(&self) -> u32 {
        self.reliable_messages_sent.load(Ordering::SeqCst)
    }

    /// Number of datagrams received.
    pub fn packets_received(&self) -> u32 {
        self.packets_received.load(Ordering::SeqCst)
    }

    pub fn messages_received(&self) -> u32 {
        self.messages_received.load(Ordering::SeqCst)
    }

    /// Number of datagrams presumed lost (aged out unacknowledged).
    pub fn packets_lost(&self) -> u32 {
        self.packets_lost.load(Ordering::SeqCst)
    }

    /// Fraction of sent datagrams presumed lost.
    pub fn packet_loss_rate(&self) -> f64 {
        let sent = self.packets_sent();
        if sent == 0 {
            return 0.0;
        }
        f64::from(self.packets_lost()) / f64::from(sent)
    }

    pub fn bytes_sent(&self) -> u32 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u32 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Smoothed round-trip time of acknowledged bundles.
    pub fn ping(&self) -> Duration {
        Duration::nanoseconds(self.ping_nanos.load(Ordering::SeqCst) as i64)
    }

    pub(crate) fn ping_std(&self) -> StdDuration {
        StdDuration::from_nanos(self.ping_nanos.load(Ordering::SeqCst))
    }

    /// The random salt identifying this side of the connection.
    pub fn salt(&self) -> u64 {
        self.salt.load(Ordering::SeqCst)
    }

    /// The peer's salt, or zero while it is still unknown.
    pub fn remote_salt(&self) -> u64 {
        self.remote_salt.load(Ordering::SeqCst)
    }

    pub fn timestamp_last_sent(&self) -> Option<Instant> {
        *self.timestamp_last_sent.lock().unwrap()
    }

    pub fn timestamp_last_received(&self) -> Option<Instant> {
        *self.timestamp_last_received.lock().unwrap()
    }

    pub fn last_received_sequence_nr(&self) -> u32 {
        self.last_received_sequence_nr.load(Ordering::SeqCst)
    }

    pub fn received_sequence_bits(&self) -> u32 {
        self.received_sequence_bits.load(Ordering::SeqCst)
    }

    pub fn last_received_ack_nr(&self) -> u32 {
        self.last_received_ack_nr.load(Ordering::SeqCst)
    }

    pub fn received_ack_bits(&self) -> u32 {
        self.received_ack_bits.load(Ordering::SeqCst)
    }

    /// Highest reliable uid delivered without gaps.
    pub fn last_received_reliable_uid(&self) -> u32 {
        self.last_received_reliable_uid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_remote_salt(&self, salt: u64) {
        self.remote_salt.store(salt, Ordering::SeqCst);
    }

    pub(crate) fn set_last_received_sequence_nr(&self, sequence: u32) {
        self.last_received_sequence_nr
            .store(sequence, Ordering::SeqCst);
    }

    pub(crate) fn set_received_sequence_bits(&self, bits: u32) {
        self.received_sequence_bits.store(bits, Ordering::SeqCst);
    }

    pub(crate) fn set_last_received_ack_nr(&self, ack: u32) {
        self.last_received_ack_nr.store(ack, Ordering::SeqCst);
    }

    pub(crate) fn set_received_ack_bits(&self, bits: u32) {
        self.received_ack_bits.store(bits, Ordering::SeqCst);
    }

    /// Registers one outbound datagram and returns its bundle uid (starting at 1).
    pub(crate) fn register_packet_sent(&self) -> u32 {
        *self.timestamp_last_sent.lock().unwrap() = Some(Instant::now());
        self.packets_sent.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Registers one outbound message and returns its uid (starting at 1).
    pub(crate) fn register_message_sent(&self) -> u32 {
        self.messages_sent.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Registers one outbound reliable message and returns its reliable uid (starting at 1).
    pub(crate) fn register_reliable_message_sent(&self) -> u32 {
        self.reliable_messages_sent.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn register_packet_received(&self, messages: u32, bytes: u32) {
        self.packets_received.fetch_add(1, Ordering::SeqCst);
        self.messages_received.fetch_add(messages, Ordering::SeqCst);
        self.bytes_received.fetch_add(bytes, Ordering::SeqCst);
        *self.timestamp_last_received.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn register_reliable_message_received(&self) {
        self.last_received_reliable_uid
            .fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn register_packet_loss(&self) {
        self.packets_lost.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn register_bytes_sent(&self, bytes: u32) {
        self.bytes_sent.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Folds one RTT sample into the smoothed ping estimate.
    pub(crate) fn register_rtt(&self, sample: StdDuration) {
        let sample_nanos = sample.as_nanos() as f64;
        let old_nanos = self.ping_nanos.load(Ordering::SeqCst) as f64;
        let smoothed =
            sample_nanos * RTT_SAMPLE_WEIGHT + old_nanos * (1.0 - RTT_SAMPLE_WEIGHT);
        self.ping_nanos.store(smoothed as u64, Ordering::SeqCst);
    }

    /// Zeroes every counter and window and rolls a fresh local salt.
    pub(crate) fn reset(&self) {
        self.packets_sent.store(0, Ordering::SeqCst);
        self.messages_sent.store(0, Ordering::SeqCst);
        self.reliable_messages_sent.store(0, Ordering::SeqCst);
        self.packets_received.store(0, Ordering::SeqCst);
        self.messages_received.store(0, Ordering::SeqCst);
        self.packets_lost.store(0, Ordering::SeqCst);
        self.bytes_sent.store(0, Ordering::SeqCst);
        self.bytes_received.store(0, Ordering::SeqCst);
        self.salt.store(random_salt(), Ordering::SeqCst);
        self.remote_salt.store(0, Ordering::SeqCst);
        self.last_received_sequence_nr.store(0, Ordering::SeqCst);
        self.received_sequence_bits.store(0, Ordering::SeqCst);
        self.last_received_ack_nr.store(0, Ordering::SeqCst);
        self.received_ack_bits.store(0, Ordering::SeqCst);
        self.last_received_reliable_uid.store(0, Ordering::SeqCst);
        self.ping_nanos.store(0, Ordering::SeqCst);
        *self.timestamp_last_sent.lock().unwrap() = None;
        *self.timestamp_last_received.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_message_uids_monotonic_from_one() {
        let stats = NetworkStatistics::new();
        assert_eq!(stats.register_message_sent(), 1);
        assert_eq!(stats.register_message_sent(), 2);
        assert_eq!(stats.register_reliable_message_sent(), 1);
        assert_eq!(stats.register_reliable_message_sent(), 2);
        assert_eq!(stats.messages_sent(), 2);
    }

    #[test]
    fn test_rtt_converges_within_50_samples() {
        let stats = NetworkStatistics::new();
        let sample = StdDuration::from_millis(100);

        for _ in 0..50 {
            stats.register_rtt(sample);
        }

        let ping = stats.ping_std();
        let error = if ping > sample {
            ping - sample
        } else {
            sample - ping
        };
        assert!(error < StdDuration::from_millis(5), "ping = {:?}", ping);
    }

    #[test]
    fn test_packet_loss_rate() {
        let stats = NetworkStatistics::new();
        assert_eq!(stats.packet_loss_rate(), 0.0);

        for _ in 0..4 {
            stats.register_packet_sent();
        }
        stats.register_packet_loss();
        assert_eq!(stats.packet_loss_rate(), 0.25);
    }

    #[test]
    fn test_reset_rerolls_salt() {
        let stats = NetworkStatistics::new();
        let salt = stats.salt();
        assert_ne!(salt, 0);

        stats.set_remote_salt(77);
        stats.register_packet_sent();
        stats.reset();

        assert_ne!(stats.salt(), salt);
        assert_eq!(stats.remote_salt(), 0);
        assert_eq!(stats.packets_sent(), 0);
        assert!(stats.timestamp_last_sent().is_none());
    }
}
