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

//! The connecting side of a connection.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::net::UdpSocket;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration as StdDuration;
use std::time::Instant;

use crate::net::challenge;
use crate::net::codec::PacketDecoder;
use crate::net::codec::PacketEncoder;
use crate::net::manager::PacketListener;
use crate::net::manager::PacketManager;
use crate::net::stats::NetworkStatistics;
use crate::net::transceiver::PacketTransceiver;
use crate::net::worker::NetWorker;
use crate::net::worker::WorkerShared;
use crate::net::ClientHandler;
use crate::net::ClientState;
use crate::net::Connection;
use crate::net::ControlType;
use crate::net::NetError;
use crate::net::NetworkPacket;

use chrono::Duration;
use num::FromPrimitive;

#[derive(Clone)]
pub struct ClientConfig {
    /// Number of preallocated packets; bounds in-flight sends plus the reorder depth.
    pub pool_size: usize,
    /// Resends before a reliable message is written off and the connection dropped.
    pub max_retries: u32,
    /// A reliable message is resent after this many smoothed RTTs without an ack.
    pub resend_rtt_multiplier: f32,
    /// Cadence of the transmitter thread.
    pub transmit_interval: Duration,
    /// Socket read timeout; bounds how long termination can go unnoticed.
    pub receive_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            pool_size: 512,
            max_retries: 10,
            resend_rtt_multiplier: 2.0,
            transmit_interval: Duration::milliseconds(10),
            receive_timeout: Duration::milliseconds(100),
        }
    }
}

pub(crate) struct ClientInner {
    manager: PacketManager,
    transceiver: PacketTransceiver,
    handler: Arc<dyn ClientHandler>,
    state: AtomicU8,
    send_disconnect: AtomicBool,
    shared: Arc<WorkerShared>,
}

/// A connection initiator.
///
/// `connect` binds a socket, fires the salted handshake and spawns the two worker threads;
/// the handler hears about every state change from the receiver thread. Dropping the client
/// disconnects it.
pub struct ClientUdp {
    inner: Arc<ClientInner>,
    worker: Mutex<Option<NetWorker>>,
}

impl ClientUdp {
    pub fn connect<A>(
        remote: A,
        handler: Arc<dyn ClientHandler>,
        config: ClientConfig,
    ) -> Result<ClientUdp, NetError>
    where
        A: ToSocketAddrs,
    {
        let remote = remote
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| NetError::malformed("remote address did not resolve"))?;

        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(NetError::SocketBindFailed)?;
        socket.set_read_timeout(Some(
            config
                .receive_timeout
                .to_std()
                .unwrap_or_else(|_| StdDuration::from_millis(100)),
        ))?;

        let manager = PacketManager::new(
            config.pool_size,
            config.max_retries,
            config.resend_rtt_multiplier,
        );

        let inner = Arc::new(ClientInner {
            manager,
            transceiver: PacketTransceiver::new(socket),
            handler,
            state: AtomicU8::new(ClientState::Connecting as u8),
            send_disconnect: AtomicBool::new(true),
            shared: WorkerShared::new(),
        });

        info!("[client] connecting to {}", remote);
        inner.manager.reset();
        inner.manager.set_endpoint(remote);
        inner.handler.on_connecting(&*inner);
        ClientInner::send_connect_request(&inner);

        let interval = config
            .transmit_interval
            .to_std()
            .unwrap_or_else(|_| StdDuration::from_millis(10));
        let recv_inner = Arc::clone(&inner);
        let trans_inner = Arc::clone(&inner);
        let term_inner = Arc::clone(&inner);

        let worker = NetWorker::start(
            "client",
            Arc::clone(&inner.shared),
            move || recv_inner.run_receiver(),
            move || trans_inner.run_transmitter(interval),
            move || term_inner.finish_disconnect(),
        )?;

        Ok(ClientUdp {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.inner.manager.endpoint()
    }

    pub fn statistics(&self) -> &NetworkStatistics {
        self.inner.manager.statistics()
    }

    pub fn get_free_packet(&self, type_id: u16) -> Result<NetworkPacket, NetError> {
        Connection::get_free_packet(&*self.inner, type_id)
    }

    pub fn send_reliable(
        &self,
        packet: NetworkPacket,
        listener: Option<Arc<dyn PacketListener>>,
    ) -> Result<u32, NetError> {
        Connection::send_reliable(&*self.inner, packet, listener)
    }

    pub fn send_unreliable(&self, packet: NetworkPacket) -> Result<u32, NetError> {
        Connection::send_unreliable(&*self.inner, packet)
    }

    pub fn set_simulate_receiving_packet_loss(&self, ratio: f32) {
        self.inner
            .transceiver
            .set_simulate_receiving_packet_loss(ratio);
    }

    pub fn set_simulate_transmitting_packet_loss(&self, ratio: f32) {
        self.inner
            .transceiver
            .set_simulate_transmitting_packet_loss(ratio);
    }

    /// Tears the connection down and waits for both workers to exit.
    pub fn disconnect(&self) {
        self.inner.begin_disconnect();
        if let Some(mut worker) = self.worker.lock().unwrap().take() {
            worker.terminate_and_join();
        }
    }
}

impl Drop for ClientUdp {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ClientInner {
    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
            .unwrap_or(ClientState::Disconnected)
    }

    fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    fn send_connect_request(this: &Arc<ClientInner>) {
        match this
            .manager
            .pool()
            .request_free_with_type(ControlType::Connect as u16)
        {
            Ok(packet) => {
                let listener = Arc::clone(this) as Arc<dyn PacketListener>;
                this.manager.enqueue_reliable(packet, Some(listener));
                this.transmit_packets();
            }
            Err(e) => error!("[client] could not enqueue connect request: {}", e),
        }
    }

    fn send_disconnect_request(&self) {
        match self
            .manager
            .pool()
            .request_free_with_type(ControlType::Disconnect as u16)
        {
            Ok(packet) => {
                self.manager.enqueue_reliable(packet, None);
                self.transmit_packets();
            }
            Err(e) => warn!("[client] could not enqueue disconnect request: {}", e),
        }
    }

    fn transmit_packets(&self) {
        self.manager.flush(&self.transceiver);
    }

    fn run_receiver(self: Arc<Self>) {
        while !self.shared.should_terminate() {
            match self.transceiver.receive_begin() {
                Ok(Some(from)) => {
                    if from != self.manager.endpoint() {
                        debug!("[client] dropping datagram from stranger {}", from);
                        self.transceiver.discard_pending();
                        continue;
                    }

                    let mut returned = Vec::new();
                    if self.manager.query_begin(&self.transceiver, &mut returned) {
                        for packet in &returned {
                            ClientInner::handle_received_packet(&self, packet);
                        }
                        self.manager.query_end(&mut returned);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if !self.shared.should_terminate() {
                        warn!("[client] receive error: {}", e);
                    }
                }
            }
        }
    }

    fn run_transmitter(self: Arc<Self>, interval: StdDuration) {
        let mut last_tick = Instant::now();

        while !self.shared.should_terminate() {
            self.transmit_packets();

            let now = Instant::now();
            let delta = now.duration_since(last_tick);
            last_tick = now;
            self.manager
                .tick(Duration::from_std(delta).unwrap_or_else(|_| Duration::zero()));

            thread::sleep(interval);
        }
    }

    fn handle_received_packet(this: &Arc<ClientInner>, packet: &NetworkPacket) {
        match ControlType::from_u16(packet.type_id()) {
            Some(ControlType::Challenge) => {
                let server_salt = match PacketDecoder::new(packet).read_u64() {
                    Ok(salt) => salt,
                    Err(e) => {
                        debug!("[client] bad challenge: {}", e);
                        return;
                    }
                };

                let stats = this.manager.statistics();
                stats.set_remote_salt(server_salt);
                let answer = challenge::compute(stats.salt(), server_salt);

                match this
                    .manager
                    .pool()
                    .request_free_with_type(ControlType::Challenge as u16)
                {
                    Ok(mut response) => {
                        if PacketEncoder::new(&mut response).write_u64(answer).is_ok() {
                            let listener = Arc::clone(this) as Arc<dyn PacketListener>;
                            this.manager.enqueue_reliable(response, Some(listener));
                        }
                    }
                    Err(e) => warn!("[client] could not answer challenge: {}", e),
                }
            }

            Some(ControlType::Accepted) => {
                if this
                    .state
                    .compare_exchange(
                        ClientState::Connecting as u8,
                        ClientState::Connected as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    info!("[client] connected to {}", this.manager.endpoint());
                    this.handler.on_connected(&**this);
                }
            }

            Some(ControlType::Disconnect) => {
                this.send_disconnect.store(false, Ordering::SeqCst);
                this.begin_disconnect();
            }

            Some(ControlType::ServerFull) => {
                warn!("[client] server is full");
                this.send_disconnect.store(false, Ordering::SeqCst);
                this.handler.on_server_full(&**this);
                this.begin_disconnect();
            }

            Some(ControlType::Connect) | Some(ControlType::NetworkAck) => {
                debug!("[client] unexpected control message: {}", packet);
            }

            None => this.handler.on_packet_received(&**this, packet),
        }
    }

    /// First half of the teardown: announce it, maybe send DISCONNECT, raise the flag.
    ///
    /// Runs at most once; later callers (or a disconnect racing the retry watchdog) fall
    /// through. The second half runs when the last worker exits.
    fn begin_disconnect(&self) {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current == ClientState::Disconnecting as u8
                || current == ClientState::Disconnected as u8
            {
                return;
            }
            match self.state.compare_exchange(
                current,
                ClientState::Disconnecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        warn!("[client] disconnecting from {}", self.manager.endpoint());
        self.handler.on_disconnecting(self);

        if self.send_disconnect.load(Ordering::SeqCst) {
            self.send_disconnect_request();
        } else {
            // get any final acknowledgments out before the workers stop
            self.transmit_packets();
        }

        self.shared.request_termination();
    }

    /// Second half of the teardown, run by whichever worker exits last.
    fn finish_disconnect(&self) {
        self.manager.release_in_flight();
        self.state
            .store(ClientState::Disconnected as u8, Ordering::SeqCst);
        info!("[client] disconnected");
        self.handler.on_disconnected(self);
    }
}

impl Connection for ClientInner {
    fn state(&self) -> ClientState {
        ClientInner::state(self)
    }

    fn endpoint(&self) -> SocketAddr {
        self.manager.endpoint()
    }

    fn statistics(&self) -> &NetworkStatistics {
        self.manager.statistics()
    }

    fn get_free_packet(&self, type_id: u16) -> Result<NetworkPacket, NetError> {
        self.manager.pool().request_free_with_type(type_id)
    }

    fn send_reliable(
        &self,
        packet: NetworkPacket,
        listener: Option<Arc<dyn PacketListener>>,
    ) -> Result<u32, NetError> {
        if !self.is_connected() {
            warn!("[client] can not send before a connection has been established");
            self.manager.pool().free(packet);
            return Err(NetError::NotConnected);
        }
        Ok(self.manager.enqueue_reliable(packet, listener))
    }

    fn send_unreliable(&self, packet: NetworkPacket) -> Result<u32, NetError> {
        if !self.is_connected() {
            warn!("[client] can not send before a connection has been established");
            self.manager.pool().free(packet);
            return Err(NetError::NotConnected);
        }
        Ok(self.manager.enqueue_unreliable(packet))
    }

    fn disconnect(&self) {
        self.begin_disconnect();
    }
}

impl PacketListener for ClientInner {
    fn on_packet_delivered(&self, packet: &NetworkPacket) {
        debug!("[client] delivered {}", packet);
    }

    fn on_packet_resent(&self, packet: &NetworkPacket, retries: u32) {
        debug!("[client] resent ({}) {}", retries, packet);
    }

    fn on_packet_max_tries_reached(&self, packet: &NetworkPacket, retries: u32) {
        warn!("[client] gave up on {} after {} tries", packet, retries);
        self.begin_disconnect();
    }
}
