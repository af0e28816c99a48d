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

//! The framing layer: bundles messages into datagrams and parses them back out.
//!
//! Datagram layout (little-endian):
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0      | 8    | local salt ⊕ remote salt (just the local salt until the peer is known) |
//! | 8      | 4    | bundle uid |
//! | 12     | 4    | last received sequence nr |
//! | 16     | 4    | received sequence bits |
//! | 20     | 2    | message count |
//! | 22     | 2    | reserved |

use std::collections::VecDeque;
use std::io::Cursor;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::net::UdpSocket;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::net::pool::PacketPool;
use crate::net::stats::NetworkStatistics;
use crate::net::NetError;
use crate::net::NetworkPacket;
use crate::net::DATAGRAM_HEADER_SIZE;
use crate::net::MAXIMUM_PACKET_SIZE;
use crate::net::MESSAGE_HEADER_SIZE;

use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;

/// `true` if `a` is ahead of `b` in wrapping 32-bit sequence space.
pub(crate) fn sequence_greater_than(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 > 0
}

/// A datagram that has been received and header-validated but not yet parsed into messages.
struct PendingDatagram {
    from: SocketAddr,
    salt_mask: u64,
    bundle_uid: u32,
    ack_nr: u32,
    ack_bits: u32,
    message_count: u16,
    messages: Vec<u8>,
}

/// Frames outbound messages into single datagrams and splits inbound datagrams back into
/// messages and acknowledgments.
///
/// The transceiver owns the socket. Reception is split in two phases so the caller can
/// demultiplex on the sender address before committing a connection's packet pool:
/// `receive_begin` blocks for one datagram, `receive_end` parses it against a connection.
pub struct PacketTransceiver {
    socket: UdpSocket,
    pending: Mutex<Option<PendingDatagram>>,
    receive_loss_ratio: AtomicU32,
    transmit_loss_ratio: AtomicU32,
}

impl PacketTransceiver {
    pub fn new(socket: UdpSocket) -> PacketTransceiver {
        PacketTransceiver {
            socket,
            pending: Mutex::new(None),
            receive_loss_ratio: AtomicU32::new(0f32.to_bits()),
            transmit_loss_ratio: AtomicU32::new(0f32.to_bits()),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.socket.local_addr()?)
    }

    /// Drops the given ratio of inbound datagrams before they are parsed.
    pub fn set_simulate_receiving_packet_loss(&self, ratio: f32) {
        self.receive_loss_ratio
            .store(ratio.to_bits(), Ordering::SeqCst);
    }

    /// Drops the given ratio of outbound datagrams after they are framed.
    pub fn set_simulate_transmitting_packet_loss(&self, ratio: f32) {
        self.transmit_loss_ratio
            .store(ratio.to_bits(), Ordering::SeqCst);
    }

    fn simulate_loss(ratio_bits: &AtomicU32) -> bool {
        let ratio = f32::from_bits(ratio_bits.load(Ordering::SeqCst));
        ratio > 0.0 && rand::random::<f32>() < ratio
    }

    /// Drains as many queued messages as fit into one datagram and sends it to `endpoint`.
    ///
    /// Returns the bundle uid and the reliable uids it carried, or `None` if the queue head had
    /// to be discarded. The caller keeps calling while the queue is non-empty; a message that
    /// does not fit stays at the head for the next datagram.
    pub fn transmit(
        &self,
        pool: &PacketPool,
        queue: &mut VecDeque<Arc<NetworkPacket>>,
        endpoint: SocketAddr,
        stats: &NetworkStatistics,
    ) -> Result<Option<(u32, Vec<u32>)>, NetError> {
        let mut body = Vec::with_capacity(MAXIMUM_PACKET_SIZE - DATAGRAM_HEADER_SIZE);
        let mut reliable_uids = Vec::new();
        let mut message_count: u16 = 0;

        while let Some(front) = queue.front() {
            if front.total_len() > MAXIMUM_PACKET_SIZE - DATAGRAM_HEADER_SIZE {
                error!("dropping oversized message: {}", front);
                let oversized = queue.pop_front().unwrap();
                pool.free_shared(oversized);
                continue;
            }

            if DATAGRAM_HEADER_SIZE + body.len() + front.total_len() > MAXIMUM_PACKET_SIZE {
                break;
            }

            let packet = queue.pop_front().unwrap();
            packet.serialize(&mut body)?;
            message_count += 1;

            if packet.is_reliable() {
                reliable_uids.push(packet.reliable_uid());
                // the waiting-for-ack map keeps its own handle until the ack arrives
            } else {
                pool.free_shared(packet);
            }
        }

        if message_count == 0 {
            return Ok(None);
        }

        let bundle_uid = stats.register_packet_sent();
        let salt_mask = stats.salt() ^ stats.remote_salt();

        let mut datagram = Vec::with_capacity(DATAGRAM_HEADER_SIZE + body.len());
        datagram.write_u64::<LittleEndian>(salt_mask)?;
        datagram.write_u32::<LittleEndian>(bundle_uid)?;
        datagram.write_u32::<LittleEndian>(stats.last_received_sequence_nr())?;
        datagram.write_u32::<LittleEndian>(stats.received_sequence_bits())?;
        datagram.write_u16::<LittleEndian>(message_count)?;
        datagram.write_u16::<LittleEndian>(0)?;
        datagram.extend_from_slice(&body);

        stats.register_bytes_sent(datagram.len() as u32);

        if Self::simulate_loss(&self.transmit_loss_ratio) {
            debug!("simulated loss of outbound bundle {}", bundle_uid);
        } else {
            self.socket.send_to(&datagram, endpoint)?;
        }

        Ok(Some((bundle_uid, reliable_uids)))
    }

    /// Blocks for one datagram, validates its header and returns the sender address.
    ///
    /// Returns `Ok(None)` on a read timeout, a simulated drop or a datagram too mangled to
    /// carry a header; the caller just loops. The datagram is held internally until
    /// `receive_end` or `discard_pending`.
    pub fn receive_begin(&self) -> Result<Option<SocketAddr>, NetError> {
        let mut buf = [0u8; MAXIMUM_PACKET_SIZE + 1];

        let (len, from) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut => return Ok(None),
                _ => return Err(NetError::from(e)),
            },
        };

        if Self::simulate_loss(&self.receive_loss_ratio) {
            debug!("simulated loss of inbound datagram from {}", from);
            return Ok(None);
        }

        if len < DATAGRAM_HEADER_SIZE || len > MAXIMUM_PACKET_SIZE {
            debug!("dropping datagram with bogus length {} from {}", len, from);
            return Ok(None);
        }

        let mut reader = Cursor::new(&buf[..len]);
        let salt_mask = reader.read_u64::<LittleEndian>()?;
        let bundle_uid = reader.read_u32::<LittleEndian>()?;
        let ack_nr = reader.read_u32::<LittleEndian>()?;
        let ack_bits = reader.read_u32::<LittleEndian>()?;
        let message_count = reader.read_u16::<LittleEndian>()?;
        let _reserved = reader.read_u16::<LittleEndian>()?;

        *self.pending.lock().unwrap() = Some(PendingDatagram {
            from,
            salt_mask,
            bundle_uid,
            ack_nr,
            ack_bits,
            message_count,
            messages: buf[DATAGRAM_HEADER_SIZE..len].to_vec(),
        });

        Ok(Some(from))
    }

    /// `true` if the held datagram contains a message of the given type.
    ///
    /// Used by the server to decide whether an unknown endpoint is actually asking to connect,
    /// without committing a packet pool to the parse.
    pub fn pending_contains_type(&self, type_id: u16) -> bool {
        let pending = self.pending.lock().unwrap();
        let pending = match pending.as_ref() {
            Some(p) => p,
            None => return false,
        };

        let mut offset = 0;
        while offset + MESSAGE_HEADER_SIZE <= pending.messages.len() {
            let record = &pending.messages[offset..];
            let total_len = u16::from(record[0]) as usize | (usize::from(record[1]) << 8);
            let msg_type = u16::from(record[2]) | (u16::from(record[3]) << 8);
            if msg_type == type_id {
                return true;
            }
            if total_len < MESSAGE_HEADER_SIZE {
                return false;
            }
            offset += total_len;
        }
        false
    }

    /// Throws away the held datagram without parsing it.
    pub fn discard_pending(&self) {
        *self.pending.lock().unwrap() = None;
    }

    /// Parses the held datagram against a connection's pool and statistics.
    ///
    /// Updates the receive window (dropping duplicate datagrams outright), stamps each message
    /// with the datagram's salt mask, and extracts the bundle uids the peer has acknowledged.
    /// Returns `false` if there was nothing to parse or the datagram was rejected.
    pub fn receive_end(
        &self,
        pool: &PacketPool,
        out_messages: &mut Vec<NetworkPacket>,
        out_acks: &mut Vec<u32>,
        stats: &NetworkStatistics,
    ) -> bool {
        let pending = match self.pending.lock().unwrap().take() {
            Some(p) => p,
            None => return false,
        };

        // Once both salts are known, the mask binds every datagram to this connection. A peer
        // that has not yet learned our salt sends just its own.
        let remote_salt = stats.remote_salt();
        if remote_salt != 0 {
            let expected = remote_salt ^ stats.salt();
            if pending.salt_mask != expected && pending.salt_mask != remote_salt {
                debug!("dropping forged datagram from {}", pending.from);
                return false;
            }
        }

        if !Self::update_receive_window(pending.bundle_uid, stats) {
            debug!(
                "dropping duplicate datagram {} from {}",
                pending.bundle_uid, pending.from
            );
            return false;
        }

        let mut reader = Cursor::new(pending.messages.as_slice());
        let mut parsed: u32 = 0;

        for _ in 0..pending.message_count {
            let mut packet = match pool.request_free() {
                Ok(packet) => packet,
                Err(_) => {
                    warn!("packet pool exhausted, dropping remainder of bundle");
                    break;
                }
            };

            match packet.deserialize_into(&mut reader) {
                Ok(()) => {
                    packet.set_header_salt(pending.salt_mask);
                    out_messages.push(packet);
                    parsed += 1;
                }
                Err(e) => {
                    debug!("malformed message in bundle: {}", e);
                    pool.free(packet);
                    break;
                }
            }
        }

        stats.register_packet_received(
            parsed,
            (DATAGRAM_HEADER_SIZE + pending.messages.len()) as u32,
        );

        Self::extract_acks(pending.ack_nr, pending.ack_bits, out_acks);
        stats.set_last_received_ack_nr(pending.ack_nr);
        stats.set_received_ack_bits(pending.ack_bits);

        true
    }

    /// Folds `sequence` into the receive window. Returns `false` for duplicates and datagrams
    /// older than the 32-bundle window.
    fn update_receive_window(sequence: u32, stats: &NetworkStatistics) -> bool {
        let last = stats.last_received_sequence_nr();
        let bits = stats.received_sequence_bits();

        if sequence == last {
            return false;
        }

        if sequence_greater_than(sequence, last) {
            let shift = sequence.wrapping_sub(last);
            let mut new_bits = if shift >= 32 { 0 } else { bits << shift };
            if last != 0 && shift <= 32 {
                new_bits |= 1 << (shift - 1);
            }
            stats.set_last_received_sequence_nr(sequence);
            stats.set_received_sequence_bits(new_bits);
            true
        } else {
            let distance = last.wrapping_sub(sequence);
            if distance > 32 {
                return false;
            }
            let mask = 1 << (distance - 1);
            if bits & mask != 0 {
                return false;
            }
            stats.set_received_sequence_bits(bits | mask);
            true
        }
    }

    /// Expands the peer's `(ack_nr, ack_bits)` receive window into individual bundle uids.
    fn extract_acks(ack_nr: u32, ack_bits: u32, out_acks: &mut Vec<u32>) {
        if ack_nr == 0 {
            return;
        }

        out_acks.push(ack_nr);
        for distance in 1..=32 {
            if ack_bits & (1 << (distance - 1)) != 0 {
                let uid = ack_nr.wrapping_sub(distance);
                if uid != 0 {
                    out_acks.push(uid);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    fn bind_loopback() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        socket
    }

    fn gen_transceiver_pair() -> (PacketTransceiver, PacketTransceiver) {
        (
            PacketTransceiver::new(bind_loopback()),
            PacketTransceiver::new(bind_loopback()),
        )
    }

    fn queue_message(
        pool: &PacketPool,
        queue: &mut VecDeque<Arc<NetworkPacket>>,
        uid: u32,
        reliable_uid: u32,
        payload: &[u8],
    ) {
        let mut packet = pool.request_free_with_type(2000).unwrap();
        packet.set_uid(uid);
        packet.set_reliable_uid(reliable_uid);
        packet.payload_mut().extend_from_slice(payload);
        queue.push_back(Arc::new(packet));
    }

    #[test]
    fn test_transmit_receive_roundtrip() {
        let (src, dst) = gen_transceiver_pair();
        let src_stats = NetworkStatistics::new();
        let dst_stats = NetworkStatistics::new();
        let src_pool = PacketPool::new(8);
        let dst_pool = PacketPool::new(8);

        let mut queue = VecDeque::new();
        queue_message(&src_pool, &mut queue, 1, 1, b"first");
        queue_message(&src_pool, &mut queue, 2, 0, b"second");

        let (bundle_uid, reliable_uids) = src
            .transmit(
                &src_pool,
                &mut queue,
                dst.local_addr().unwrap(),
                &src_stats,
            )
            .unwrap()
            .unwrap();
        assert_eq!(bundle_uid, 1);
        assert_eq!(reliable_uids, vec![1]);
        assert!(queue.is_empty());
        // the unreliable message went straight back to the pool
        assert_eq!(src_pool.free_count(), 7);

        let from = dst.receive_begin().unwrap().unwrap();
        assert_eq!(from, src.local_addr().unwrap());

        let mut messages = Vec::new();
        let mut acks = Vec::new();
        assert!(dst.receive_end(&dst_pool, &mut messages, &mut acks, &dst_stats));

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload(), b"first");
        assert_eq!(messages[0].reliable_uid(), 1);
        assert_eq!(messages[1].payload(), b"second");
        assert!(!messages[1].is_reliable());
        assert_eq!(messages[0].header_salt(), src_stats.salt());
        assert!(acks.is_empty());
        assert_eq!(dst_stats.packets_received(), 1);
        assert_eq!(dst_stats.messages_received(), 2);
        assert_eq!(dst_stats.last_received_sequence_nr(), 1);

        dst_pool.free_many(messages);
    }

    #[test]
    fn test_acks_extracted_from_reply() {
        let (src, dst) = gen_transceiver_pair();
        let src_stats = NetworkStatistics::new();
        let dst_stats = NetworkStatistics::new();
        let src_pool = PacketPool::new(8);
        let dst_pool = PacketPool::new(8);

        // src -> dst
        let mut queue = VecDeque::new();
        queue_message(&src_pool, &mut queue, 1, 1, b"ping");
        src.transmit(
            &src_pool,
            &mut queue,
            dst.local_addr().unwrap(),
            &src_stats,
        )
        .unwrap()
        .unwrap();

        dst.receive_begin().unwrap().unwrap();
        let mut messages = Vec::new();
        let mut acks = Vec::new();
        assert!(dst.receive_end(&dst_pool, &mut messages, &mut acks, &dst_stats));
        dst_pool.free_many(messages);

        // dst -> src carries the updated receive window, acking bundle 1
        let mut queue = VecDeque::new();
        queue_message(&dst_pool, &mut queue, 1, 0, b"pong");
        dst.transmit(
            &dst_pool,
            &mut queue,
            src.local_addr().unwrap(),
            &dst_stats,
        )
        .unwrap()
        .unwrap();

        src.receive_begin().unwrap().unwrap();
        let mut messages = Vec::new();
        let mut acks = Vec::new();
        assert!(src.receive_end(&src_pool, &mut messages, &mut acks, &src_stats));
        assert_eq!(acks, vec![1]);
        src_pool.free_many(messages);
    }

    /// Composes a raw datagram the way `transmit` would.
    fn compose_datagram(salt_mask: u64, bundle_uid: u32, payloads: &[&[u8]]) -> Vec<u8> {
        let mut datagram = Vec::new();
        datagram.write_u64::<LittleEndian>(salt_mask).unwrap();
        datagram.write_u32::<LittleEndian>(bundle_uid).unwrap();
        datagram.write_u32::<LittleEndian>(0).unwrap();
        datagram.write_u32::<LittleEndian>(0).unwrap();
        datagram
            .write_u16::<LittleEndian>(payloads.len() as u16)
            .unwrap();
        datagram.write_u16::<LittleEndian>(0).unwrap();

        for (i, payload) in payloads.iter().enumerate() {
            datagram
                .write_u16::<LittleEndian>((MESSAGE_HEADER_SIZE + payload.len()) as u16)
                .unwrap();
            datagram.write_u16::<LittleEndian>(2000).unwrap();
            datagram.write_u32::<LittleEndian>(i as u32 + 1).unwrap();
            datagram.write_u32::<LittleEndian>(0).unwrap();
            datagram.extend_from_slice(payload);
        }

        datagram
    }

    #[test]
    fn test_duplicate_datagram_dropped() {
        let receiver = PacketTransceiver::new(bind_loopback());
        let sender = bind_loopback();
        let stats = NetworkStatistics::new();
        let pool = PacketPool::new(8);

        let datagram = compose_datagram(0xABCD, 1, &[b"dup"]);
        for _ in 0..2 {
            sender
                .send_to(&datagram, receiver.local_addr().unwrap())
                .unwrap();
        }

        let mut messages = Vec::new();
        let mut acks = Vec::new();

        receiver.receive_begin().unwrap().unwrap();
        assert!(receiver.receive_end(&pool, &mut messages, &mut acks, &stats));
        assert_eq!(messages.len(), 1);
        pool.free_many(messages.drain(..));

        receiver.receive_begin().unwrap().unwrap();
        assert!(!receiver.receive_end(&pool, &mut messages, &mut acks, &stats));
        assert!(messages.is_empty());
        assert_eq!(stats.messages_received(), 1);
    }

    #[test]
    fn test_out_of_order_datagrams_fill_window() {
        let receiver = PacketTransceiver::new(bind_loopback());
        let sender = bind_loopback();
        let stats = NetworkStatistics::new();
        let pool = PacketPool::new(8);

        for &uid in &[2u32, 4, 3, 3] {
            let datagram = compose_datagram(0xABCD, uid, &[b"x"]);
            sender
                .send_to(&datagram, receiver.local_addr().unwrap())
                .unwrap();
        }

        let mut accepted = 0;
        for _ in 0..4 {
            receiver.receive_begin().unwrap().unwrap();
            let mut messages = Vec::new();
            let mut acks = Vec::new();
            if receiver.receive_end(&pool, &mut messages, &mut acks, &stats) {
                accepted += 1;
            }
            pool.free_many(messages);
        }

        // the second bundle 3 is a duplicate
        assert_eq!(accepted, 3);
        assert_eq!(stats.last_received_sequence_nr(), 4);
        // window marks bundles 2 and 3 (distance 2 and 1 behind 4)
        assert_eq!(stats.received_sequence_bits(), 0b11);
    }

    #[test]
    fn test_forged_salt_mask_dropped() {
        let receiver = PacketTransceiver::new(bind_loopback());
        let sender = bind_loopback();
        let stats = NetworkStatistics::new();
        stats.set_remote_salt(0x1111);
        let pool = PacketPool::new(8);

        let datagram = compose_datagram(0x2222, 1, &[b"forged"]);
        sender
            .send_to(&datagram, receiver.local_addr().unwrap())
            .unwrap();

        receiver.receive_begin().unwrap().unwrap();
        let mut messages = Vec::new();
        let mut acks = Vec::new();
        assert!(!receiver.receive_end(&pool, &mut messages, &mut acks, &stats));
        assert!(messages.is_empty());
    }

    #[test]
    fn test_pending_contains_type() {
        let receiver = PacketTransceiver::new(bind_loopback());
        let sender = bind_loopback();

        let datagram = compose_datagram(0, 1, &[b"a", b"b"]);
        sender
            .send_to(&datagram, receiver.local_addr().unwrap())
            .unwrap();

        receiver.receive_begin().unwrap().unwrap();
        assert!(receiver.pending_contains_type(2000));
        assert!(!receiver.pending_contains_type(1));

        receiver.discard_pending();
        assert!(!receiver.pending_contains_type(2000));
    }

    #[test]
    fn test_large_queue_splits_into_multiple_bundles() {
        let (src, dst) = gen_transceiver_pair();
        let src_stats = NetworkStatistics::new();
        let src_pool = PacketPool::new(8);

        let mut queue = VecDeque::new();
        for i in 0..4 {
            queue_message(&src_pool, &mut queue, i + 1, 0, &[0u8; 400]);
        }

        let endpoint = dst.local_addr().unwrap();
        let mut bundles = 0;
        while !queue.is_empty() {
            src.transmit(&src_pool, &mut queue, endpoint, &src_stats)
                .unwrap()
                .unwrap();
            bundles += 1;
        }

        // 400-byte messages fit two per kilobyte datagram
        assert_eq!(bundles, 2);
        assert_eq!(src_stats.packets_sent(), 2);
    }

    #[test]
    fn test_sequence_greater_than_wraparound() {
        assert!(sequence_greater_than(1, 0));
        assert!(sequence_greater_than(0, u32::max_value()));
        assert!(!sequence_greater_than(u32::max_value(), 0));
        assert!(sequence_greater_than(0x8000_0000, 1));
        assert!(!sequence_greater_than(1, 0x8000_0000));
    }
}
