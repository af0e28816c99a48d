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

//! A bounded free list of reusable message packets.

use std::sync::Arc;
use std::sync::Mutex;

use crate::net::NetError;
use crate::net::NetworkPacket;

/// Fixed-capacity pool of `NetworkPacket`s.
///
/// Every packet handed out by `request_free` must come back through `free`; a pool that runs dry
/// makes `request_free` fail with `NetError::OutOfPackets`, which callers surface as a dropped
/// send. Size the pool to cover the maximum in-flight count plus the reorder depth.
pub struct PacketPool {
    free: Mutex<Vec<NetworkPacket>>,
    capacity: usize,
}

impl PacketPool {
    pub fn new(capacity: usize) -> PacketPool {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(NetworkPacket::new());
        }

        PacketPool {
            free: Mutex::new(free),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of packets currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn request_free(&self) -> Result<NetworkPacket, NetError> {
        match self.free.lock().unwrap().pop() {
            Some(packet) => Ok(packet),
            None => Err(NetError::OutOfPackets),
        }
    }

    /// Requests a free packet already tagged with `type_id`.
    pub fn request_free_with_type(&self, type_id: u16) -> Result<NetworkPacket, NetError> {
        let mut packet = self.request_free()?;
        packet.set_type(type_id);
        Ok(packet)
    }

    /// Returns a packet to the free list, clearing its header but keeping its storage.
    pub fn free(&self, mut packet: NetworkPacket) {
        packet.reset();

        let mut free = self.free.lock().unwrap();
        if free.len() < self.capacity {
            free.push(packet);
        } else {
            debug!("PacketPool::free() called with a foreign packet, dropping it");
        }
    }

    pub fn free_many<I>(&self, packets: I)
    where
        I: IntoIterator<Item = NetworkPacket>,
    {
        for packet in packets {
            self.free(packet);
        }
    }

    /// Returns a shared packet once its last owner is done with it.
    ///
    /// If another clone of the handle is still alive (a resend copy racing an ack), the slot is
    /// replaced with fresh storage so the pool's accounting stays exact.
    pub(crate) fn free_shared(&self, packet: Arc<NetworkPacket>) {
        match Arc::try_unwrap(packet) {
            Ok(packet) => self.free(packet),
            Err(_) => self.free(NetworkPacket::new()),
        }
    }

    /// Rebuilds the free list to full capacity, abandoning any outstanding packets.
    pub fn reset(&self) {
        let mut free = self.free.lock().unwrap();
        free.clear();
        for _ in 0..self.capacity {
            free.push(NetworkPacket::new());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pool_exhaustion() {
        let pool = PacketPool::new(2);
        let a = pool.request_free().unwrap();
        let b = pool.request_free().unwrap();
        assert!(pool.request_free().is_err());

        pool.free(a);
        pool.free(b);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_pool_free_resets_header() {
        let pool = PacketPool::new(1);
        let mut packet = pool.request_free_with_type(2000).unwrap();
        packet.set_uid(9);
        packet.payload_mut().push(1);
        pool.free(packet);

        let packet = pool.request_free().unwrap();
        assert_eq!(packet.type_id(), 0);
        assert_eq!(packet.uid(), 0);
        assert!(packet.payload().is_empty());
    }

    #[test]
    fn test_pool_reset_restores_capacity() {
        let pool = PacketPool::new(4);
        let _leaked = pool.request_free().unwrap();
        let _leaked2 = pool.request_free().unwrap();
        assert_eq!(pool.free_count(), 2);

        pool.reset();
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_pool_free_shared_with_live_clone_keeps_accounting() {
        let pool = PacketPool::new(1);
        let packet = Arc::new(pool.request_free().unwrap());
        let clone = Arc::clone(&packet);

        pool.free_shared(packet);
        assert_eq!(pool.free_count(), 1);
        drop(clone);
    }
}
