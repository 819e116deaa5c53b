//! Reads stdin and writes it into a shmpipe ring backed by a real
//! `/dev/shmpipeN` device, mirroring the original `test/pipe_writer.c`.
//!
//! Grant setup is printed to stdout so an operator can hand the grant
//! reference and domain id to the peer's `pipe-reader` out of band (or via
//! `rendezvous-connect`/`rendezvous-listen`, which automate that exchange).

use std::io::Read;
use std::sync::atomic::Ordering;

use clap::Parser;
use shmpipe::linux_device::DeviceNode;
use shmpipe_proto::{MetaPage, SideFlags};
use tracing::info;

#[derive(Parser)]
struct Args {
    #[arg(long)]
    device: String,
    #[arg(long, default_value_t = 4)]
    pages: u8,
    #[arg(long)]
    distant_domid: u16,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut node = DeviceNode::open(&args.device)?;
    let (grant_ref, local_domid) = node.init_offerer(args.pages, args.distant_domid)?;
    println!("grant_ref={grant_ref} local_domid={local_domid}");
    let base = node.mmap_region(args.pages + 1)?;

    let meta = unsafe { &*(base as *const MetaPage) };
    let buf_len = (args.pages as usize + 1) * shmpipe_proto::PAGE_SIZE - MetaPage::BUFFER_OFFSET;
    let ring = unsafe { core::slice::from_raw_parts_mut(base.add(MetaPage::BUFFER_OFFSET), buf_len) };
    let cap = buf_len as u32;

    let mut stdin = std::io::stdin().lock();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stdin.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        let mut sent = 0;
        while sent < n {
            let write_pos = meta.ring.write_pos.load(Ordering::Relaxed);
            let read_pos = meta.ring.read_pos.load(Ordering::Acquire);
            let free = shmpipe::ring::free_to_write(write_pos, read_pos, cap);
            if free == 0 {
                let reader_sleeping = SideFlags::from_bits_truncate(
                    meta.ring.reader_flags.load(Ordering::Acquire),
                )
                .contains(SideFlags::SLEEPING);
                // The full adaptive handshake lives in PipeHandle; this
                // reference tool just spins, since it talks to the device
                // node directly rather than through a PipeHandle.
                if reader_sleeping {
                    node.ssig()?;
                }
                std::hint::spin_loop();
                continue;
            }
            let want = core::cmp::min(free as usize, n - sent);
            shmpipe::ring::copy_into_ring(ring, write_pos, &chunk[sent..sent + want]);
            meta.ring.write_pos.store(
                shmpipe::ring::advance(write_pos, want as u32, cap),
                Ordering::Release,
            );
            sent += want;
        }
        node.ssig()?;
    }
    info!("stdin closed, pipe-writer exiting");
    Ok(())
}
