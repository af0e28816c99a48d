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

extern crate courier;
extern crate docopt;
extern crate env_logger;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

use std::process::exit;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use courier::net::ClientConfig;
use courier::net::ClientHandler;
use courier::net::ClientUdp;
use courier::net::Connection;
use courier::net::NetworkPacket;
use courier::net::PacketDecoder;
use courier::net::PacketEncoder;
use courier::net::PacketListener;

use docopt::Docopt;

const USAGE: &'static str = "
Usage: echo-client <server> [--count N] [--loss RATIO]
       echo-client (-h | --help)

Options:
    --count N      Number of reliable messages to send [default: 100].
    --loss RATIO   Simulated packet loss in each direction [default: 0].
    -h, --help     Show this message.
";

#[derive(Deserialize)]
struct Args {
    arg_server: String,
    flag_count: u32,
    flag_loss: f32,
}

const ECHO_TYPE: u16 = courier::net::USER_TYPE_START;

struct EchoClientHandler {
    echoes: AtomicU32,
}

impl ClientHandler for EchoClientHandler {
    fn on_connected(&self, client: &dyn Connection) {
        info!("connected to {}", client.endpoint());
    }

    fn on_disconnected(&self, _client: &dyn Connection) {
        info!("disconnected");
    }

    fn on_server_full(&self, _client: &dyn Connection) {
        println!("Server is full, try again later");
    }

    fn on_packet_received(&self, _client: &dyn Connection, packet: &NetworkPacket) {
        match PacketDecoder::new(packet).read_u32() {
            Ok(value) => {
                debug!("echo {}", value);
                self.echoes.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => warn!("bad echo payload: {}", e),
        }
    }
}

struct DeliveryCounter {
    delivered: AtomicU32,
}

impl PacketListener for DeliveryCounter {
    fn on_packet_delivered(&self, _packet: &NetworkPacket) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }

    fn on_packet_resent(&self, packet: &NetworkPacket, retries: u32) {
        debug!("resent ({}) {}", retries, packet);
    }

    fn on_packet_max_tries_reached(&self, packet: &NetworkPacket, retries: u32) {
        warn!("gave up on {} after {} tries", packet, retries);
    }
}

fn main() {
    env_logger::init();

    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let handler = Arc::new(EchoClientHandler {
        echoes: AtomicU32::new(0),
    });

    let client = match ClientUdp::connect(
        args.arg_server.as_str(),
        Arc::clone(&handler) as Arc<dyn ClientHandler>,
        ClientConfig::default(),
    ) {
        Ok(client) => client,
        Err(why) => {
            println!("Couldn't connect to {}: {}", args.arg_server, why);
            exit(1);
        }
    };

    // the handshake is driven by the worker threads; wait for it to settle
    let deadline = Instant::now() + Duration::from_secs(5);
    while !client.is_connected() {
        if Instant::now() > deadline {
            println!("Connection to {} timed out", args.arg_server);
            exit(1);
        }
        thread::sleep(Duration::from_millis(10));
    }

    client.set_simulate_transmitting_packet_loss(args.flag_loss);
    client.set_simulate_receiving_packet_loss(args.flag_loss);

    let counter = Arc::new(DeliveryCounter {
        delivered: AtomicU32::new(0),
    });

    for i in 0..args.flag_count {
        let mut packet = match client.get_free_packet(ECHO_TYPE) {
            Ok(packet) => packet,
            Err(why) => {
                warn!("send {} failed: {}", i, why);
                continue;
            }
        };

        if PacketEncoder::new(&mut packet).write_u32(i).is_ok() {
            if let Err(why) =
                client.send_reliable(packet, Some(Arc::clone(&counter) as Arc<dyn PacketListener>))
            {
                warn!("send {} failed: {}", i, why);
            }
        }
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    while handler.echoes.load(Ordering::SeqCst) < args.flag_count {
        if Instant::now() > deadline {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    let stats = client.statistics();
    println!(
        "{} sent, {} delivered, {} echoed back",
        args.flag_count,
        counter.delivered.load(Ordering::SeqCst),
        handler.echoes.load(Ordering::SeqCst)
    );
    println!(
        "ping {:.2} ms, {} datagrams out, {} in, loss rate {:.1}%",
        stats.ping().num_nanoseconds().unwrap_or(0) as f64 / 1_000_000.0,
        stats.packets_sent(),
        stats.packets_received(),
        stats.packet_loss_rate() * 100.0
    );

    client.disconnect();
}
