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

use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use courier::net::ClientHandler;
use courier::net::Connection;
use courier::net::NetworkPacket;
use courier::net::ServerConfig;
use courier::net::ServerHandler;
use courier::net::ServerUdp;

use docopt::Docopt;

const USAGE: &'static str = "
Usage: echo-server [--addr ADDR] [--capacity N]
       echo-server (-h | --help)

Options:
    --addr ADDR    Address to listen on [default: 127.0.0.1:26000].
    --capacity N   Maximum number of simultaneous clients [default: 16].
    -h, --help     Show this message.
";

#[derive(Deserialize)]
struct Args {
    flag_addr: String,
    flag_capacity: usize,
}

struct EchoHandler;

impl ClientHandler for EchoHandler {
    fn on_connected(&self, client: &dyn Connection) {
        info!("client {} connected", client.endpoint());
    }

    fn on_disconnected(&self, client: &dyn Connection) {
        info!(
            "client {} disconnected (loss rate {:.1}%)",
            client.endpoint(),
            client.statistics().packet_loss_rate() * 100.0
        );
    }

    fn on_packet_received(&self, client: &dyn Connection, packet: &NetworkPacket) {
        let mut reply = match client.get_free_packet(packet.type_id()) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("could not echo to {}: {}", client.endpoint(), e);
                return;
            }
        };

        let mut encoder = courier::net::PacketEncoder::new(&mut reply);
        if let Err(e) = encoder.write_bytes(packet.payload()) {
            warn!("could not echo to {}: {}", client.endpoint(), e);
            return;
        }

        if let Err(e) = client.send_reliable(reply, None) {
            warn!("could not echo to {}: {}", client.endpoint(), e);
        }
    }
}

struct EchoServerHandler;

impl ServerHandler for EchoServerHandler {
    fn make_handler(&self, _endpoint: &SocketAddr) -> Arc<dyn ClientHandler> {
        Arc::new(EchoHandler)
    }
}

fn main() {
    env_logger::init();

    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let config = ServerConfig {
        capacity: args.flag_capacity,
        ..Default::default()
    };

    let server = match ServerUdp::bind(&args.flag_addr, Arc::new(EchoServerHandler), config) {
        Ok(server) => server,
        Err(why) => {
            println!("Couldn't start server on {}: {}", args.flag_addr, why);
            exit(1);
        }
    };

    loop {
        thread::sleep(Duration::from_secs(10));
        info!("{} client(s) connected", server.client_count());
    }
}
