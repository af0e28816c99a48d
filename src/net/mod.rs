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

//! Reliable, ordered message delivery on top of UDP datagrams.
//!
//! Messages are bundled into datagrams by the `PacketTransceiver`, tracked and retried by the
//! `PacketManager`, and driven by the two worker threads of a `ClientUdp` or `ServerUdp`.

pub mod challenge;
pub mod client;
pub mod codec;
pub mod manager;
pub mod pool;
pub mod server;
pub mod stats;
pub mod transceiver;
pub mod worker;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use failure::Fail;

pub use self::client::ClientConfig;
pub use self::client::ClientUdp;
pub use self::codec::PacketDecoder;
pub use self::codec::PacketEncoder;
pub use self::manager::PacketListener;
pub use self::manager::PacketManager;
pub use self::pool::PacketPool;
pub use self::server::RemoteClient;
pub use self::server::ServerConfig;
pub use self::server::ServerHandler;
pub use self::server::ServerUdp;
pub use self::stats::NetworkStatistics;
pub use self::transceiver::PacketTransceiver;

/// Hard upper bound on the size of one outbound datagram, header included.
pub const MAXIMUM_PACKET_SIZE: usize = 1024;

/// Fixed size of the datagram header written by the transceiver.
pub const DATAGRAM_HEADER_SIZE: usize = 24;

/// Fixed per-message framing overhead (length, type, uid, reliable uid).
pub const MESSAGE_HEADER_SIZE: usize = 12;

/// Largest payload that still fits a datagram carrying a single message.
pub const MAX_PAYLOAD: usize = MAXIMUM_PACKET_SIZE - DATAGRAM_HEADER_SIZE - MESSAGE_HEADER_SIZE;

/// First message type id available to application code; lower values are reserved.
pub const USER_TYPE_START: u16 = 1024;

#[derive(Debug, Fail)]
pub enum NetError {
    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] io::Error),
    #[fail(display = "Packet pool exhausted")]
    OutOfPackets,
    #[fail(display = "Not connected")]
    NotConnected,
    #[fail(display = "Failed to bind socket: {}", _0)]
    SocketBindFailed(#[cause] io::Error),
    #[fail(display = "Malformed packet: {}", _0)]
    MalformedPacket(String),
    #[fail(display = "Payload exceeds maximum size")]
    PayloadTooLarge,
}

impl NetError {
    pub fn malformed<S>(msg: S) -> NetError
    where
        S: AsRef<str>,
    {
        NetError::MalformedPacket(msg.as_ref().to_owned())
    }
}

impl From<io::Error> for NetError {
    fn from(error: io::Error) -> Self {
        NetError::Io(error)
    }
}

/// Message type ids reserved for connection management.
#[derive(Copy, Clone, Debug, Eq, FromPrimitive, PartialEq)]
pub enum ControlType {
    Connect = 1,
    Challenge = 2,
    Accepted = 3,
    Disconnect = 4,
    ServerFull = 5,
    NetworkAck = 6,
}

/// Lifecycle of one side of a connection.
///
/// The terminal `Disconnected` state is reachable from every other state, either through an
/// explicit disconnect or through the retry watchdog giving up.
#[derive(Copy, Clone, Debug, Eq, FromPrimitive, PartialEq)]
pub enum ClientState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

/// A single application message.
///
/// Packets are owned by the `PacketPool` they were requested from and must be returned to it;
/// while in flight they belong to exactly one queue, map or callback at a time.
pub struct NetworkPacket {
    type_id: u16,
    uid: u32,
    reliable_uid: u32,
    header_salt: u64,
    payload: Vec<u8>,
}

impl NetworkPacket {
    pub(crate) fn new() -> NetworkPacket {
        NetworkPacket {
            type_id: 0,
            uid: 0,
            reliable_uid: 0,
            header_salt: 0,
            payload: Vec::with_capacity(MAX_PAYLOAD),
        }
    }

    pub fn type_id(&self) -> u16 {
        self.type_id
    }

    pub fn set_type(&mut self, type_id: u16) {
        self.type_id = type_id;
    }

    /// Per-direction id assigned when the message is enqueued.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Non-zero iff this message is delivered reliably.
    pub fn reliable_uid(&self) -> u32 {
        self.reliable_uid
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable_uid != 0
    }

    /// Salt mask of the datagram this message arrived in (zero on outbound packets).
    pub fn header_salt(&self) -> u64 {
        self.header_salt
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn set_uid(&mut self, uid: u32) {
        self.uid = uid;
    }

    pub(crate) fn set_reliable_uid(&mut self, reliable_uid: u32) {
        self.reliable_uid = reliable_uid;
    }

    pub(crate) fn set_header_salt(&mut self, salt: u64) {
        self.header_salt = salt;
    }

    pub(crate) fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    /// Total on-wire size of this message, framing included.
    pub fn total_len(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.payload.len()
    }

    /// Clears the header and payload but keeps the payload's storage.
    pub(crate) fn reset(&mut self) {
        self.type_id = 0;
        self.uid = 0;
        self.reliable_uid = 0;
        self.header_salt = 0;
        self.payload.clear();
    }

    pub fn serialize<W>(&self, writer: &mut W) -> Result<(), NetError>
    where
        W: WriteBytesExt,
    {
        writer.write_u16::<LittleEndian>(self.total_len() as u16)?;
        writer.write_u16::<LittleEndian>(self.type_id)?;
        writer.write_u32::<LittleEndian>(self.uid)?;
        writer.write_u32::<LittleEndian>(self.reliable_uid)?;
        writer.write_all(&self.payload)?;
        Ok(())
    }

    /// Parses one length-prefixed message from `reader` into this packet.
    pub fn deserialize_into<R>(&mut self, reader: &mut R) -> Result<(), NetError>
    where
        R: ReadBytesExt,
    {
        let total_len = reader.read_u16::<LittleEndian>()? as usize;

        if total_len < MESSAGE_HEADER_SIZE {
            return Err(NetError::malformed(format!(
                "message length {} shorter than framing",
                total_len
            )));
        }

        let payload_len = total_len - MESSAGE_HEADER_SIZE;
        if payload_len > MAX_PAYLOAD {
            return Err(NetError::malformed(format!(
                "message length {} exceeds maximum",
                total_len
            )));
        }

        self.type_id = reader.read_u16::<LittleEndian>()?;
        self.uid = reader.read_u32::<LittleEndian>()?;
        self.reliable_uid = reader.read_u32::<LittleEndian>()?;
        self.header_salt = 0;
        self.payload.resize(payload_len, 0);
        reader.read_exact(&mut self.payload)?;

        Ok(())
    }
}

impl fmt::Display for NetworkPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "NetworkPacket[type={} uid={} reliable_uid={} payload={}B]",
            self.type_id,
            self.uid,
            self.reliable_uid,
            self.payload.len()
        )
    }
}

impl fmt::Debug for NetworkPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One side of an established connection, as seen by handler callbacks.
///
/// Implemented by `ClientUdp`'s internals and by `RemoteClient` so the same handler code can
/// serve both ends.
pub trait Connection: Send + Sync {
    fn state(&self) -> ClientState;

    fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    fn endpoint(&self) -> SocketAddr;

    fn statistics(&self) -> &NetworkStatistics;

    /// Borrows a free packet from the connection's pool, tagged with `type_id`.
    fn get_free_packet(&self, type_id: u16) -> Result<NetworkPacket, NetError>;

    /// Enqueues a reliable message; returns its uid.
    fn send_reliable(
        &self,
        packet: NetworkPacket,
        listener: Option<Arc<dyn PacketListener>>,
    ) -> Result<u32, NetError>;

    /// Enqueues a fire-and-forget message; returns its uid.
    fn send_unreliable(&self, packet: NetworkPacket) -> Result<u32, NetError>;

    /// Requests an orderly teardown. Safe to call from handler callbacks.
    fn disconnect(&self);
}

/// Callbacks pushed from a connection's receiver thread.
///
/// One handler serves one connection: a client owns one, a server creates one per accepted
/// remote through its `ServerHandler`.
pub trait ClientHandler: Send + Sync {
    fn on_connecting(&self, _client: &dyn Connection) {}

    fn on_connected(&self, _client: &dyn Connection) {}

    fn on_disconnecting(&self, _client: &dyn Connection) {}

    fn on_disconnected(&self, _client: &dyn Connection) {}

    /// The remote end rejected the connection because it is at capacity.
    fn on_server_full(&self, _client: &dyn Connection) {}

    fn on_packet_received(&self, client: &dyn Connection, packet: &NetworkPacket);
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::BufReader;

    #[test]
    fn test_network_packet_serialize_deserialize_eq() {
        let mut src = NetworkPacket::new();
        src.set_type(USER_TYPE_START + 7);
        src.set_uid(42);
        src.set_reliable_uid(3);
        src.payload_mut().extend_from_slice(b"test message");

        let mut bytes = Vec::new();
        src.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), src.total_len());

        let mut reader = BufReader::new(bytes.as_slice());
        let mut dst = NetworkPacket::new();
        dst.deserialize_into(&mut reader).unwrap();

        assert_eq!(dst.type_id(), USER_TYPE_START + 7);
        assert_eq!(dst.uid(), 42);
        assert_eq!(dst.reliable_uid(), 3);
        assert_eq!(dst.payload(), b"test message");
    }

    #[test]
    fn test_network_packet_deserialize_short_length_fails() {
        // length field below the framing size is invalid
        let bytes: [u8; 12] = [4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut reader = BufReader::new(&bytes[..]);
        let mut dst = NetworkPacket::new();
        assert!(dst.deserialize_into(&mut reader).is_err());
    }

    #[test]
    fn test_network_packet_deserialize_truncated_payload_fails() {
        let mut src = NetworkPacket::new();
        src.set_type(1);
        src.payload_mut().extend_from_slice(&[0xAB; 16]);

        let mut bytes = Vec::new();
        src.serialize(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 4);

        let mut reader = BufReader::new(bytes.as_slice());
        let mut dst = NetworkPacket::new();
        assert!(dst.deserialize_into(&mut reader).is_err());
    }

    #[test]
    fn test_network_packet_reset_keeps_storage() {
        let mut packet = NetworkPacket::new();
        packet.set_type(2000);
        packet.payload_mut().extend_from_slice(&[1, 2, 3]);

        let cap = packet.payload_mut().capacity();
        packet.reset();

        assert_eq!(packet.type_id(), 0);
        assert_eq!(packet.reliable_uid(), 0);
        assert!(packet.payload().is_empty());
        assert_eq!(packet.payload_mut().capacity(), cap);
    }
}
