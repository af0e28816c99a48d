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

//! The per-connection reliability engine.
//!
//! Tracks reliable messages until they are acknowledged, retries them on a timer derived from
//! the smoothed RTT, buffers out-of-order arrivals until the gap fills, and ages out bundles
//! that were never acknowledged.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration as StdDuration;
use std::time::Instant;

use crate::net::pool::PacketPool;
use crate::net::stats::NetworkStatistics;
use crate::net::transceiver::sequence_greater_than;
use crate::net::transceiver::PacketTransceiver;
use crate::net::ControlType;
use crate::net::NetworkPacket;

use chrono::Duration;

/// Interval between sweeps of the in-flight bundle map.
const BUNDLE_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(1);

/// A bundle this many smoothed RTTs old is written off as lost.
const BUNDLE_AGE_RTT_MULTIPLIER: u32 = 100;

/// Lower bound on the bundle age-out so a near-zero ping cannot thrash the map.
const BUNDLE_AGE_FLOOR: StdDuration = StdDuration::from_millis(100);

/// Lower bound on the resend timer.
const RESEND_FLOOR: StdDuration = StdDuration::from_millis(5);

/// Notifications about the fate of a reliable message.
pub trait PacketListener: Send + Sync {
    fn on_packet_delivered(&self, _packet: &NetworkPacket) {}

    fn on_packet_resent(&self, _packet: &NetworkPacket, _retries: u32) {}

    fn on_packet_max_tries_reached(&self, _packet: &NetworkPacket, _retries: u32) {}
}

/// A reliable message waiting for its acknowledgment.
struct MessageInfo {
    packet: Arc<NetworkPacket>,
    listener: Option<Arc<dyn PacketListener>>,
    last_sent: Instant,
    retries: u32,
}

/// One transmitted datagram, tracked until it is acked or aged out.
struct Bundle {
    reliable_uids: Vec<u32>,
    sent_at: Instant,
}

/// State guarded by the send lock.
struct SendShared {
    waiting_for_ack: HashMap<u32, MessageInfo>,
    reorder: BTreeMap<u32, NetworkPacket>,
}

/// The reliability engine for one connection.
///
/// Lock discipline: the send lock (waiting-for-ack map and reorder buffer) is always taken
/// before the bundles lock when both are needed. The two send queues are double-buffered so
/// enqueuing never contends with a flush in progress.
pub struct PacketManager {
    pool: PacketPool,
    stats: NetworkStatistics,
    endpoint: Mutex<SocketAddr>,
    send: Mutex<SendShared>,
    queues: [Mutex<VecDeque<Arc<NetworkPacket>>>; 2],
    active_queue: AtomicUsize,
    bundles: Mutex<HashMap<u32, Bundle>>,
    sweep_timer: Mutex<StdDuration>,
    max_retries: u32,
    resend_rtt_multiplier: f32,
}

impl PacketManager {
    pub fn new(pool_size: usize, max_retries: u32, resend_rtt_multiplier: f32) -> PacketManager {
        PacketManager {
            pool: PacketPool::new(pool_size),
            stats: NetworkStatistics::new(),
            endpoint: Mutex::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
            send: Mutex::new(SendShared {
                waiting_for_ack: HashMap::new(),
                reorder: BTreeMap::new(),
            }),
            queues: [Mutex::new(VecDeque::new()), Mutex::new(VecDeque::new())],
            active_queue: AtomicUsize::new(0),
            bundles: Mutex::new(HashMap::new()),
            sweep_timer: Mutex::new(StdDuration::from_secs(0)),
            max_retries,
            resend_rtt_multiplier,
        }
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn statistics(&self) -> &NetworkStatistics {
        &self.stats
    }

    pub fn endpoint(&self) -> SocketAddr {
        *self.endpoint.lock().unwrap()
    }

    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.lock().unwrap() = endpoint;
    }

    fn push_active(&self, packet: Arc<NetworkPacket>) {
        let active = self.active_queue.load(Ordering::SeqCst);
        self.queues[active].lock().unwrap().push_back(packet);
    }

    /// Enqueues a reliable message and begins tracking it. Returns the message uid.
    ///
    /// The listener, if any, hears about delivery, resends and the final give-up.
    pub fn enqueue_reliable(
        &self,
        mut packet: NetworkPacket,
        listener: Option<Arc<dyn PacketListener>>,
    ) -> u32 {
        let uid = self.stats.register_message_sent();
        let reliable_uid = self.stats.register_reliable_message_sent();
        packet.set_uid(uid);
        packet.set_reliable_uid(reliable_uid);

        let packet = Arc::new(packet);
        {
            let mut send = self.send.lock().unwrap();
            send.waiting_for_ack.insert(
                reliable_uid,
                MessageInfo {
                    packet: Arc::clone(&packet),
                    listener,
                    last_sent: Instant::now(),
                    retries: 0,
                },
            );
        }
        self.push_active(packet);
        uid
    }

    /// Enqueues a fire-and-forget message. Returns the message uid.
    pub fn enqueue_unreliable(&self, mut packet: NetworkPacket) -> u32 {
        let uid = self.stats.register_message_sent();
        packet.set_uid(uid);
        packet.set_reliable_uid(0);
        self.push_active(Arc::new(packet));
        uid
    }

    /// Swaps the send queues and drains the filled one into datagrams.
    ///
    /// Every bundle that carried reliable messages is recorded for ack matching.
    pub fn flush(&self, transceiver: &PacketTransceiver) {
        let old = {
            let _send = self.send.lock().unwrap();
            let active = self.active_queue.load(Ordering::SeqCst);
            self.active_queue.store(1 - active, Ordering::SeqCst);
            active
        };

        let endpoint = self.endpoint();
        let mut queue = self.queues[old].lock().unwrap();

        while !queue.is_empty() {
            match transceiver.transmit(&self.pool, &mut queue, endpoint, &self.stats) {
                Ok(Some((bundle_uid, reliable_uids))) => {
                    if !reliable_uids.is_empty() {
                        self.bundles.lock().unwrap().insert(
                            bundle_uid,
                            Bundle {
                                reliable_uids,
                                sent_at: Instant::now(),
                            },
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("flush: transmit to {} failed: {}", endpoint, e);
                    break;
                }
            }
        }
    }

    /// Parses the transceiver's held datagram and routes its messages.
    ///
    /// Messages ready for the application land in `returned`, in reliable-uid order for the
    /// reliable ones; duplicates and bare acknowledgments are consumed. The caller hands
    /// `returned` back through `query_end` when it is done.
    pub fn query_begin(
        &self,
        transceiver: &PacketTransceiver,
        returned: &mut Vec<NetworkPacket>,
    ) -> bool {
        let mut messages = Vec::new();
        let mut acks = Vec::new();

        if !transceiver.receive_end(&self.pool, &mut messages, &mut acks, &self.stats) {
            return false;
        }

        returned.clear();
        self.handle_acks(&acks);
        self.route_received(messages, returned);
        true
    }

    /// Returns the packets handed out by `query_begin` to the pool.
    pub fn query_end(&self, returned: &mut Vec<NetworkPacket>) {
        self.pool.free_many(returned.drain(..));
    }

    fn route_received(&self, messages: Vec<NetworkPacket>, returned: &mut Vec<NetworkPacket>) {
        let mut to_free = Vec::new();
        let mut has_reliable = false;
        let mut advanced = false;

        {
            let mut send = self.send.lock().unwrap();

            for packet in messages {
                if !packet.is_reliable() {
                    if packet.type_id() == ControlType::NetworkAck as u16 {
                        to_free.push(packet);
                    } else {
                        returned.push(packet);
                    }
                    continue;
                }

                has_reliable = true;
                let expected = self.stats.last_received_reliable_uid().wrapping_add(1);

                if packet.reliable_uid() == expected {
                    self.stats.register_reliable_message_received();
                    returned.push(packet);
                    advanced = true;
                } else if sequence_greater_than(packet.reliable_uid(), expected) {
                    // arrived ahead of a gap, park it
                    if let Some(old) = send.reorder.insert(packet.reliable_uid(), packet) {
                        to_free.push(old);
                    }
                    advanced = true;
                } else {
                    // already delivered once
                    to_free.push(packet);
                }
            }

            if advanced {
                loop {
                    let next = self.stats.last_received_reliable_uid().wrapping_add(1);
                    match send.reorder.remove(&next) {
                        Some(packet) => {
                            self.stats.register_reliable_message_received();
                            returned.push(packet);
                        }
                        None => break,
                    }
                }
            }
        }

        self.pool.free_many(to_free);

        // Reliable traffic must be acknowledged promptly even if the application has nothing
        // to say; an empty send queue gets a bare ack message.
        if has_reliable {
            let active = self.active_queue.load(Ordering::SeqCst);
            let queue_empty = self.queues[active].lock().unwrap().is_empty();
            if queue_empty {
                match self
                    .pool
                    .request_free_with_type(ControlType::NetworkAck as u16)
                {
                    Ok(ack) => {
                        self.enqueue_unreliable(ack);
                    }
                    Err(e) => warn!("could not enqueue ack message: {}", e),
                }
            }
        }
    }

    /// Resolves acked bundle uids to reliable messages, notifies their listeners and frees
    /// them. One bundle per batch contributes an RTT sample.
    fn handle_acks(&self, acks: &[u32]) {
        if acks.is_empty() {
            return;
        }

        let mut acked_uids = Vec::new();
        let mut sampled_bundle: Option<Instant> = None;

        {
            let mut bundles = self.bundles.lock().unwrap();
            for ack in acks {
                if let Some(bundle) = bundles.remove(ack) {
                    acked_uids.extend_from_slice(&bundle.reliable_uids);
                    sampled_bundle = Some(bundle.sent_at);
                }
            }
        }

        if let Some(sent_at) = sampled_bundle {
            self.stats.register_rtt(sent_at.elapsed());
        }

        let mut delivered = Vec::new();
        {
            let mut send = self.send.lock().unwrap();
            for uid in acked_uids {
                if let Some(info) = send.waiting_for_ack.remove(&uid) {
                    delivered.push(info);
                }
            }
        }

        for info in delivered {
            if let Some(listener) = &info.listener {
                listener.on_packet_delivered(&info.packet);
            }
            self.pool.free_shared(info.packet);
        }
    }

    /// Advances the retry and loss timers.
    ///
    /// Once per second the bundle map is swept for datagrams old enough to count as lost;
    /// every call scans the waiting-for-ack map for messages due for a resend or out of tries.
    pub fn tick(&self, delta: Duration) {
        let delta = delta.to_std().unwrap_or_else(|_| StdDuration::from_secs(0));

        let sweep = {
            let mut timer = self.sweep_timer.lock().unwrap();
            *timer += delta;
            if *timer >= BUNDLE_SWEEP_INTERVAL {
                *timer -= BUNDLE_SWEEP_INTERVAL;
                true
            } else {
                false
            }
        };

        if sweep {
            self.delete_old_bundles();
        }

        self.resend_or_give_up();
    }

    fn delete_old_bundles(&self) {
        let mut max_age = self.stats.ping_std() * BUNDLE_AGE_RTT_MULTIPLIER;
        if max_age < BUNDLE_AGE_FLOOR {
            max_age = BUNDLE_AGE_FLOOR;
        }

        let now = Instant::now();
        let stats = &self.stats;

        self.bundles.lock().unwrap().retain(|_, bundle| {
            if now.duration_since(bundle.sent_at) > max_age {
                stats.register_packet_loss();
                false
            } else {
                true
            }
        });
    }

    fn resend_or_give_up(&self) {
        let ping = self.stats.ping_std();
        let mut threshold = StdDuration::from_nanos(
            (ping.as_nanos() as f64 * f64::from(self.resend_rtt_multiplier)) as u64,
        );
        if threshold < RESEND_FLOOR {
            threshold = RESEND_FLOOR;
        }

        let now = Instant::now();
        let mut resend = Vec::new();
        let mut give_up = Vec::new();

        {
            let mut send = self.send.lock().unwrap();
            let mut expired = Vec::new();

            for (uid, info) in send.waiting_for_ack.iter_mut() {
                if now.duration_since(info.last_sent) <= threshold {
                    continue;
                }

                info.retries += 1;
                if info.retries < self.max_retries {
                    info.last_sent = now;
                    resend.push((
                        Arc::clone(&info.packet),
                        info.listener.clone(),
                        info.retries,
                    ));
                } else {
                    expired.push(*uid);
                }
            }

            for uid in expired {
                if let Some(info) = send.waiting_for_ack.remove(&uid) {
                    give_up.push(info);
                }
            }
        }

        for (packet, listener, retries) in resend {
            self.push_active(Arc::clone(&packet));
            if let Some(listener) = listener {
                listener.on_packet_resent(&packet, retries);
            }
        }

        for info in give_up {
            if let Some(listener) = &info.listener {
                listener.on_packet_max_tries_reached(&info.packet, info.retries);
            }
            self.pool.free_shared(info.packet);
        }
    }

    /// Clears every queue, map and buffer, restores the pool and rolls fresh statistics.
    pub fn reset(&self) {
        {
            let mut send = self.send.lock().unwrap();
            let mut bundles = self.bundles.lock().unwrap();
            send.waiting_for_ack.clear();
            send.reorder.clear();
            bundles.clear();
        }

        for queue in &self.queues {
            queue.lock().unwrap().clear();
        }
        self.active_queue.store(0, Ordering::SeqCst);

        self.pool.reset();
        self.stats.reset();
        *self.sweep_timer.lock().unwrap() = StdDuration::from_secs(0);
    }

    /// Drops all in-flight tracking without touching the statistics.
    ///
    /// Called at teardown so listener handles (which may point back at the connection) are
    /// released even if messages never got their acks.
    pub(crate) fn release_in_flight(&self) {
        let infos: Vec<MessageInfo> = {
            let mut send = self.send.lock().unwrap();
            let infos = send.waiting_for_ack.drain().map(|(_, info)| info).collect();
            let reorder: Vec<NetworkPacket> =
                std::mem::replace(&mut send.reorder, BTreeMap::new())
                    .into_iter()
                    .map(|(_, p)| p)
                    .collect();
            self.pool.free_many(reorder);
            infos
        };

        for info in infos {
            self.pool.free_shared(info.packet);
        }

        self.bundles.lock().unwrap().clear();
        for queue in &self.queues {
            let drained: Vec<_> = queue.lock().unwrap().drain(..).collect();
            for packet in drained {
                self.pool.free_shared(packet);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::net::UdpSocket;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    struct RecordingListener {
        delivered: AtomicU32,
        resent: AtomicU32,
        gave_up: AtomicU32,
    }

    impl RecordingListener {
        fn new() -> Arc<RecordingListener> {
            Arc::new(RecordingListener {
                delivered: AtomicU32::new(0),
                resent: AtomicU32::new(0),
                gave_up: AtomicU32::new(0),
            })
        }
    }

    impl PacketListener for RecordingListener {
        fn on_packet_delivered(&self, _packet: &NetworkPacket) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }

        fn on_packet_resent(&self, _packet: &NetworkPacket, _retries: u32) {
            self.resent.fetch_add(1, Ordering::SeqCst);
        }

        fn on_packet_max_tries_reached(&self, _packet: &NetworkPacket, _retries: u32) {
            self.gave_up.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gen_manager_pair() -> (
        PacketManager,
        PacketTransceiver,
        PacketManager,
        PacketTransceiver,
    ) {
        let bind = || {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket
                .set_read_timeout(Some(StdDuration::from_millis(500)))
                .unwrap();
            PacketTransceiver::new(socket)
        };

        let ta = bind();
        let tb = bind();
        let a = PacketManager::new(32, 10, 2.0);
        let b = PacketManager::new(32, 10, 2.0);
        a.set_endpoint(tb.local_addr().unwrap());
        b.set_endpoint(ta.local_addr().unwrap());
        (a, ta, b, tb)
    }

    /// Builds a reliable packet the way a remote peer would have sent it.
    fn incoming_reliable(manager: &PacketManager, reliable_uid: u32) -> NetworkPacket {
        let mut packet = manager.pool().request_free_with_type(2000).unwrap();
        packet.set_uid(reliable_uid);
        packet.set_reliable_uid(reliable_uid);
        packet
    }

    #[test]
    fn test_reliable_ack_roundtrip() {
        let (a, ta, b, tb) = gen_manager_pair();
        let listener = RecordingListener::new();

        let mut packet = a.pool().request_free_with_type(2000).unwrap();
        packet.payload_mut().extend_from_slice(b"payload");
        a.enqueue_reliable(packet, Some(listener.clone()));
        a.flush(&ta);

        // B receives the message and automatically queues a bare ack
        tb.receive_begin().unwrap().unwrap();
        let mut returned = Vec::new();
        assert!(b.query_begin(&tb, &mut returned));
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].payload(), b"payload");
        b.query_end(&mut returned);
        b.flush(&tb);

        // A maps the ack back to the message
        ta.receive_begin().unwrap().unwrap();
        let mut returned = Vec::new();
        assert!(a.query_begin(&ta, &mut returned));
        assert!(returned.is_empty());
        a.query_end(&mut returned);

        assert_eq!(listener.delivered.load(Ordering::SeqCst), 1);
        assert!(a.send.lock().unwrap().waiting_for_ack.is_empty());
        assert!(a.bundles.lock().unwrap().is_empty());

        // steady state: every packet is back home
        assert_eq!(a.pool().free_count(), a.pool().capacity());
        assert_eq!(b.pool().free_count(), b.pool().capacity());
    }

    #[test]
    fn test_reorder_buffer_flush_order() {
        let (a, _ta, _b, _tb) = gen_manager_pair();

        let mut returned = Vec::new();
        a.route_received(vec![incoming_reliable(&a, 2)], &mut returned);
        assert!(returned.is_empty());

        a.route_received(vec![incoming_reliable(&a, 3)], &mut returned);
        assert!(returned.is_empty());

        a.route_received(vec![incoming_reliable(&a, 1)], &mut returned);
        let uids: Vec<u32> = returned.iter().map(|p| p.reliable_uid()).collect();
        assert_eq!(uids, vec![1, 2, 3]);

        assert!(a.send.lock().unwrap().reorder.is_empty());
        assert_eq!(a.statistics().last_received_reliable_uid(), 3);
        a.query_end(&mut returned);
    }

    #[test]
    fn test_duplicate_reliable_suppressed() {
        let (a, _ta, _b, _tb) = gen_manager_pair();

        let mut returned = Vec::new();
        a.route_received(vec![incoming_reliable(&a, 1)], &mut returned);
        assert_eq!(returned.len(), 1);
        a.query_end(&mut returned);

        a.route_received(vec![incoming_reliable(&a, 1)], &mut returned);
        assert!(returned.is_empty());
        assert_eq!(a.statistics().last_received_reliable_uid(), 1);

        // a duplicate parked in the reorder buffer is freed too
        a.route_received(vec![incoming_reliable(&a, 3)], &mut returned);
        a.route_received(vec![incoming_reliable(&a, 3)], &mut returned);
        assert!(returned.is_empty());
        assert_eq!(a.send.lock().unwrap().reorder.len(), 1);
    }

    #[test]
    fn test_ack_message_enqueued_for_reliable_traffic() {
        let (a, _ta, _b, _tb) = gen_manager_pair();

        let mut returned = Vec::new();
        a.route_received(vec![incoming_reliable(&a, 1)], &mut returned);
        a.query_end(&mut returned);

        let active = a.active_queue.load(Ordering::SeqCst);
        let queue = a.queues[active].lock().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].type_id(), ControlType::NetworkAck as u16);
        assert!(!queue[0].is_reliable());
    }

    #[test]
    fn test_ack_messages_are_not_tracked() {
        let (a, ta, _b, _tb) = gen_manager_pair();

        let ack = a
            .pool()
            .request_free_with_type(ControlType::NetworkAck as u16)
            .unwrap();
        a.enqueue_unreliable(ack);
        a.flush(&ta);

        assert!(a.bundles.lock().unwrap().is_empty());
        assert!(a.send.lock().unwrap().waiting_for_ack.is_empty());
    }

    #[test]
    fn test_resend_then_give_up() {
        let (a, ta, _b, _tb) = gen_manager_pair();
        let listener = RecordingListener::new();

        // nothing is listening on the far side, so the acks never come
        let packet = a.pool().request_free_with_type(2000).unwrap();
        a.enqueue_reliable(packet, Some(listener.clone()));
        a.flush(&ta);

        // ping starts at zero, so the resend threshold is the 5 ms floor
        for _ in 0..3 {
            thread::sleep(StdDuration::from_millis(10));
            a.tick(Duration::milliseconds(10));
            a.flush(&ta);
        }

        assert_eq!(listener.resent.load(Ordering::SeqCst), 3);
        assert_eq!(listener.gave_up.load(Ordering::SeqCst), 0);

        // 10 tries configured; burn through the rest
        for _ in 0..16 {
            thread::sleep(StdDuration::from_millis(10));
            a.tick(Duration::milliseconds(10));
        }

        assert_eq!(listener.gave_up.load(Ordering::SeqCst), 1);
        assert!(a.send.lock().unwrap().waiting_for_ack.is_empty());
    }

    #[test]
    fn test_old_bundles_counted_as_lost() {
        let (a, _ta, _b, _tb) = gen_manager_pair();

        a.bundles.lock().unwrap().insert(
            1,
            Bundle {
                reliable_uids: vec![1],
                sent_at: Instant::now() - StdDuration::from_millis(500),
            },
        );

        a.tick(Duration::seconds(1));

        assert!(a.bundles.lock().unwrap().is_empty());
        assert_eq!(a.statistics().packets_lost(), 1);
    }

    #[test]
    fn test_reset_restores_pool_and_queues() {
        let (a, _ta, _b, _tb) = gen_manager_pair();
        let endpoint = a.endpoint();

        let packet = a.pool().request_free_with_type(2000).unwrap();
        a.enqueue_reliable(packet, None);
        let packet = a.pool().request_free_with_type(2000).unwrap();
        a.enqueue_unreliable(packet);

        a.reset();

        assert_eq!(a.pool().free_count(), a.pool().capacity());
        assert!(a.send.lock().unwrap().waiting_for_ack.is_empty());
        assert_eq!(a.statistics().messages_sent(), 0);
        assert_eq!(a.queues[0].lock().unwrap().len(), 0);
        assert_eq!(a.queues[1].lock().unwrap().len(), 0);
        // the endpoint survives a reset
        assert_eq!(a.endpoint(), endpoint);
    }

    #[test]
    fn test_release_in_flight_returns_packets() {
        let (a, _ta, _b, _tb) = gen_manager_pair();
        let listener = RecordingListener::new();

        let packet = a.pool().request_free_with_type(2000).unwrap();
        a.enqueue_reliable(packet, Some(listener));

        a.release_in_flight();
        assert_eq!(a.pool().free_count(), a.pool().capacity());
    }
}
