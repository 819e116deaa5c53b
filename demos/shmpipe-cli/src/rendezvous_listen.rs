//! Listens for shmpipe rendezvous handshakes and prints each pairing,
//! mirroring the original `test/waiter.c`/`test/ping_server.c` tools.

use clap::Parser;
use shmpipe_proto::rendezvous::Mode;
use shmpipe_rendezvous::{Listener, Offer};
use tracing::info;

#[derive(Parser)]
struct Args {
    #[arg(long, default_value = "0.0.0.0:7732")]
    bind: String,
    #[arg(long)]
    grant_ref: u32,
    #[arg(long)]
    domid: u32,
    #[arg(long, default_value_t = 4)]
    pages: u8,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let offer = Offer {
        grant_ref: args.grant_ref,
        domid: args.domid,
        mode: Mode::WriterOffers,
        page_count: args.pages,
    };

    let listener = Listener::bind(&args.bind, offer, move |paired| {
        info!(
            addr = %paired.addr,
            grant_ref = paired.peer.grant_ref,
            domid = paired.peer.domid,
            "paired with client"
        );
        println!(
            "paired addr={} grant_ref={} domid={} pages={}",
            paired.addr, paired.peer.grant_ref, paired.peer.domid, paired.peer.page_count
        );
    })?;

    info!(addr = %listener.local_addr()?, "listening for rendezvous handshakes");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
