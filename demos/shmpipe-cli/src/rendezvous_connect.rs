//! Runs the client side of a shmpipe rendezvous handshake, mirroring the
//! original `test/ping_client.c`.

use std::time::Duration;

use clap::Parser;
use shmpipe_proto::rendezvous::Mode;
use shmpipe_rendezvous::{connect, Offer};
use tracing::info;

#[derive(Parser)]
struct Args {
    #[arg(long)]
    server: String,
    #[arg(long)]
    domid: u32,
    #[arg(long)]
    grant_ref: u32,
    #[arg(long, default_value_t = 4)]
    pages: u8,
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,
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

    let paired = connect(
        args.server.parse()?,
        args.domid,
        offer,
        Duration::from_secs(args.timeout_secs),
    )?;

    info!(
        grant_ref = paired.peer.grant_ref,
        domid = paired.peer.domid,
        "paired with server"
    );
    println!(
        "paired grant_ref={} domid={} pages={}",
        paired.peer.grant_ref, paired.peer.domid, paired.peer.page_count
    );
    Ok(())
}
