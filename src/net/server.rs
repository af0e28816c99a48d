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

//! The accepting side: one socket, one pair of worker threads, one `RemoteClient` per peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::net::UdpSocket;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
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
pub struct ServerConfig {
    /// Maximum number of simultaneously accepted remotes.
    pub capacity: usize,
    /// Packet pool size of each remote.
    pub pool_size: usize,
    /// Resends before a reliable message is written off and the remote dropped.
    pub max_retries: u32,
    /// A reliable message is resent after this many smoothed RTTs without an ack.
    pub resend_rtt_multiplier: f32,
    /// Cadence of the transmitter thread, which also drives per-remote ticks.
    pub transmit_interval: Duration,
    /// Socket read timeout; bounds how long termination can go unnoticed.
    pub receive_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            capacity: 64,
            pool_size: 512,
            max_retries: 10,
            resend_rtt_multiplier: 2.0,
            transmit_interval: Duration::milliseconds(10),
            receive_timeout: Duration::milliseconds(100),
        }
    }
}

/// Creates the per-remote handler sinks.
pub trait ServerHandler: Send + Sync {
    fn make_handler(&self, endpoint: &SocketAddr) -> Arc<dyn ClientHandler>;
}

struct ServerInner {
    transceiver: PacketTransceiver,
    handler: Arc<dyn ServerHandler>,
    clients: Mutex<HashMap<SocketAddr, Arc<RemoteClient>>>,
    release_queue: Mutex<Vec<SocketAddr>>,
    shared: Arc<WorkerShared>,
    config: ServerConfig,
}

/// A connection acceptor.
///
/// `bind` starts the two worker threads immediately. Unknown endpoints only get a remote if
/// their datagram asks to connect; everyone else is ignored. Dropping the server stops it.
pub struct ServerUdp {
    inner: Arc<ServerInner>,
    worker: Mutex<Option<NetWorker>>,
}

impl ServerUdp {
    pub fn bind<A>(
        addr: A,
        handler: Arc<dyn ServerHandler>,
        config: ServerConfig,
    ) -> Result<ServerUdp, NetError>
    where
        A: ToSocketAddrs,
    {
        let socket = UdpSocket::bind(addr).map_err(NetError::SocketBindFailed)?;
        socket.set_read_timeout(Some(
            config
                .receive_timeout
                .to_std()
                .unwrap_or_else(|_| StdDuration::from_millis(100)),
        ))?;

        let interval = config
            .transmit_interval
            .to_std()
            .unwrap_or_else(|_| StdDuration::from_millis(10));

        let inner = Arc::new(ServerInner {
            transceiver: PacketTransceiver::new(socket),
            handler,
            clients: Mutex::new(HashMap::new()),
            release_queue: Mutex::new(Vec::new()),
            shared: WorkerShared::new(),
            config,
        });

        info!("[server] listening on {}", inner.transceiver.local_addr()?);

        let recv_inner = Arc::clone(&inner);
        let trans_inner = Arc::clone(&inner);
        let term_inner = Arc::clone(&inner);

        let worker = NetWorker::start(
            "server",
            Arc::clone(&inner.shared),
            move || recv_inner.run_receiver(),
            move || trans_inner.run_transmitter(interval),
            move || term_inner.finish_shutdown(),
        )?;

        Ok(ServerUdp {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.inner.transceiver.local_addr()
    }

    /// Number of remotes currently in the accept table.
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().unwrap().len()
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

    /// Disconnects every remote and stops the worker threads.
    pub fn stop(&self) {
        info!("[server] stopping");

        let remotes: Vec<Arc<RemoteClient>> = self
            .inner
            .clients
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for remote in &remotes {
            remote.begin_disconnect();
        }

        if let Some(mut worker) = self.worker.lock().unwrap().take() {
            worker.terminate_and_join();
        }
    }
}

impl Drop for ServerUdp {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ServerInner {
    fn run_receiver(self: Arc<Self>) {
        while !self.shared.should_terminate() {
            match self.transceiver.receive_begin() {
                Ok(Some(from)) => ServerInner::dispatch_datagram(&self, from),
                Ok(None) => {}
                Err(e) => {
                    if !self.shared.should_terminate() {
                        warn!("[server] receive error: {}", e);
                    }
                }
            }
        }
    }

    fn run_transmitter(self: Arc<Self>, interval: StdDuration) {
        let mut last_tick = Instant::now();

        while !self.shared.should_terminate() {
            let now = Instant::now();
            let delta =
                Duration::from_std(now.duration_since(last_tick)).unwrap_or_else(|_| Duration::zero());
            last_tick = now;

            // iterate over a snapshot so handler callbacks never run under the table lock
            let remotes: Vec<Arc<RemoteClient>> =
                self.clients.lock().unwrap().values().cloned().collect();
            for remote in &remotes {
                remote.manager.tick(delta);
                remote.manager.flush(&self.transceiver);
            }

            self.drain_release_queue();
            thread::sleep(interval);
        }
    }

    fn dispatch_datagram(this: &Arc<ServerInner>, from: SocketAddr) {
        let known = this.clients.lock().unwrap().get(&from).cloned();

        let remote = match known {
            Some(remote) => remote,
            None => {
                if !this
                    .transceiver
                    .pending_contains_type(ControlType::Connect as u16)
                {
                    debug!("[server] ignoring datagram from unknown endpoint {}", from);
                    this.transceiver.discard_pending();
                    return;
                }
                ServerInner::accept_remote(this, from)
            }
        };

        RemoteClient::on_data_received(&remote, &this.transceiver);
    }

    fn accept_remote(this: &Arc<ServerInner>, from: SocketAddr) -> Arc<RemoteClient> {
        let rejected = this.clients.lock().unwrap().len() >= this.config.capacity;

        if rejected {
            info!("[server] at capacity, rejecting {}", from);
        } else {
            info!("[server] new remote {}", from);
        }

        let remote = Arc::new(RemoteClient {
            manager: PacketManager::new(
                this.config.pool_size,
                this.config.max_retries,
                this.config.resend_rtt_multiplier,
            ),
            handler: this.handler.make_handler(&from),
            state: AtomicU8::new(ClientState::Disconnected as u8),
            send_disconnect: AtomicBool::new(true),
            rejected: AtomicBool::new(rejected),
            announced: AtomicBool::new(false),
            released: AtomicBool::new(false),
            server: Arc::downgrade(this),
        });
        remote.manager.set_endpoint(from);

        this.clients
            .lock()
            .unwrap()
            .insert(from, Arc::clone(&remote));
        remote
    }

    fn drain_release_queue(&self) {
        let released: Vec<SocketAddr> = self.release_queue.lock().unwrap().drain(..).collect();

        for endpoint in released {
            // drop the table lock before the terminal callback runs
            let remote = self.clients.lock().unwrap().remove(&endpoint);
            if let Some(remote) = remote {
                remote.finish_disconnect();
            }
        }
    }

    /// Runs after both workers exited: every remaining remote reaches its terminal state.
    fn finish_shutdown(&self) {
        let remotes: Vec<Arc<RemoteClient>> = {
            let mut clients = self.clients.lock().unwrap();
            clients.drain().map(|(_, remote)| remote).collect()
        };

        for remote in remotes {
            remote.finish_disconnect();
        }

        info!("[server] stopped");
    }
}

/// The server-side half of one accepted connection.
///
/// Shares the server's socket but owns its packet manager, statistics and handler. The same
/// send API as the client side, so handler code is symmetric.
pub struct RemoteClient {
    manager: PacketManager,
    handler: Arc<dyn ClientHandler>,
    state: AtomicU8,
    send_disconnect: AtomicBool,
    rejected: AtomicBool,
    announced: AtomicBool,
    released: AtomicBool,
    server: Weak<ServerInner>,
}

impl RemoteClient {
    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
            .unwrap_or(ClientState::Disconnected)
    }

    fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    fn flush_now(&self) {
        if let Some(server) = self.server.upgrade() {
            self.manager.flush(&server.transceiver);
        }
    }

    fn on_data_received(this: &Arc<RemoteClient>, transceiver: &PacketTransceiver) {
        let mut returned = Vec::new();
        if this.manager.query_begin(transceiver, &mut returned) {
            for packet in &returned {
                RemoteClient::handle_received_packet(this, packet);
            }
            this.manager.query_end(&mut returned);
        }
    }

    fn handle_received_packet(this: &Arc<RemoteClient>, packet: &NetworkPacket) {
        match ControlType::from_u16(packet.type_id()) {
            Some(ControlType::Connect) => RemoteClient::handle_connect(this, packet),
            Some(ControlType::Challenge) => RemoteClient::handle_challenge_answer(this, packet),

            Some(ControlType::Disconnect) => {
                this.send_disconnect.store(false, Ordering::SeqCst);
                this.begin_disconnect();
            }

            Some(ControlType::Accepted)
            | Some(ControlType::ServerFull)
            | Some(ControlType::NetworkAck) => {
                debug!("[server] unexpected control message: {}", packet);
            }

            None => {
                if this.is_connected() {
                    this.handler.on_packet_received(&**this, packet);
                } else {
                    debug!(
                        "[server] dropping message from half-open remote {}",
                        this.manager.endpoint()
                    );
                }
            }
        }
    }

    /// First contact: learn the initiator's salt and challenge it (or turn it away).
    fn handle_connect(this: &Arc<RemoteClient>, packet: &NetworkPacket) {
        let stats = this.manager.statistics();
        if stats.remote_salt() == 0 {
            // a CONNECT datagram's salt mask is the initiator's bare salt
            stats.set_remote_salt(packet.header_salt());
        }

        if this
            .state
            .compare_exchange(
                ClientState::Disconnected as u8,
                ClientState::Connecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if this.rejected.load(Ordering::SeqCst) {
            match this
                .manager
                .pool()
                .request_free_with_type(ControlType::ServerFull as u16)
            {
                Ok(reply) => {
                    let listener = Arc::clone(this) as Arc<dyn PacketListener>;
                    this.manager.enqueue_reliable(reply, Some(listener));
                    this.flush_now();
                }
                Err(e) => warn!("[server] could not send server-full reply: {}", e),
            }
            return;
        }

        this.announced.store(true, Ordering::SeqCst);
        this.handler.on_connecting(&**this);

        match this
            .manager
            .pool()
            .request_free_with_type(ControlType::Challenge as u16)
        {
            Ok(mut reply) => {
                if PacketEncoder::new(&mut reply).write_u64(stats.salt()).is_ok() {
                    let listener = Arc::clone(this) as Arc<dyn PacketListener>;
                    this.manager.enqueue_reliable(reply, Some(listener));
                    this.flush_now();
                }
            }
            Err(e) => warn!("[server] could not send challenge: {}", e),
        }
    }

    /// Verifies the mixed-salt answer; a match completes the handshake.
    fn handle_challenge_answer(this: &Arc<RemoteClient>, packet: &NetworkPacket) {
        let answer = match PacketDecoder::new(packet).read_u64() {
            Ok(answer) => answer,
            Err(e) => {
                debug!("[server] bad challenge answer: {}", e);
                return;
            }
        };

        let stats = this.manager.statistics();
        let expected = challenge::compute(stats.remote_salt(), stats.salt());
        if answer != expected {
            warn!(
                "[server] wrong challenge answer from {}",
                this.manager.endpoint()
            );
            return;
        }

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
            match this
                .manager
                .pool()
                .request_free_with_type(ControlType::Accepted as u16)
            {
                Ok(reply) => {
                    let listener = Arc::clone(this) as Arc<dyn PacketListener>;
                    this.manager.enqueue_reliable(reply, Some(listener));
                    this.flush_now();
                }
                Err(e) => warn!("[server] could not send accept: {}", e),
            }

            info!("[server] remote {} connected", this.manager.endpoint());
            this.handler.on_connected(&**this);
        }
    }

    /// First half of the teardown; the release queue finishes the job on the next tick.
    fn begin_disconnect(&self) {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current == ClientState::Disconnecting as u8 {
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

        if self.announced.load(Ordering::SeqCst) {
            info!(
                "[server] remote {} disconnecting",
                self.manager.endpoint()
            );
            self.handler.on_disconnecting(self);
        }

        if self.send_disconnect.load(Ordering::SeqCst) {
            match self
                .manager
                .pool()
                .request_free_with_type(ControlType::Disconnect as u16)
            {
                Ok(packet) => {
                    self.manager.enqueue_reliable(packet, None);
                    self.flush_now();
                }
                Err(e) => warn!("[server] could not send disconnect: {}", e),
            }
        }

        self.schedule_release();
    }

    fn schedule_release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(server) = self.server.upgrade() {
            server
                .release_queue
                .lock()
                .unwrap()
                .push(self.manager.endpoint());
        }
    }

    /// Terminal transition, run off the release queue (never mid-callback).
    fn finish_disconnect(&self) {
        self.manager.release_in_flight();
        self.state
            .store(ClientState::Disconnected as u8, Ordering::SeqCst);

        if self.announced.load(Ordering::SeqCst) {
            info!(
                "[server] remote {} disconnected",
                self.manager.endpoint()
            );
            self.handler.on_disconnected(self);
        }
    }
}

impl Connection for RemoteClient {
    fn state(&self) -> ClientState {
        RemoteClient::state(self)
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
            warn!("[server] can not send before a connection has been established");
            self.manager.pool().free(packet);
            return Err(NetError::NotConnected);
        }
        Ok(self.manager.enqueue_reliable(packet, listener))
    }

    fn send_unreliable(&self, packet: NetworkPacket) -> Result<u32, NetError> {
        if !self.is_connected() {
            warn!("[server] can not send before a connection has been established");
            self.manager.pool().free(packet);
            return Err(NetError::NotConnected);
        }
        Ok(self.manager.enqueue_unreliable(packet))
    }

    fn disconnect(&self) {
        self.begin_disconnect();
    }
}

impl PacketListener for RemoteClient {
    fn on_packet_delivered(&self, packet: &NetworkPacket) {
        debug!("[server] delivered {}", packet);

        // a rejected remote is done once its SERVER_FULL reply got through
        if packet.type_id() == ControlType::ServerFull as u16 {
            self.send_disconnect.store(false, Ordering::SeqCst);
            self.begin_disconnect();
        }
    }

    fn on_packet_resent(&self, packet: &NetworkPacket, retries: u32) {
        debug!("[server] resent ({}) {}", retries, packet);
    }

    fn on_packet_max_tries_reached(&self, packet: &NetworkPacket, retries: u32) {
        warn!(
            "[server] gave up on {} after {} tries, dropping {}",
            packet,
            retries,
            self.manager.endpoint()
        );
        self.begin_disconnect();
    }
}
