//! Reads a shmpipe ring backed by a real `/dev/shmpipeN` device and writes
//! the bytes to stdout, mirroring the original `test/pipe_reader.c`.

use std::io::Write;
use std::sync::atomic::Ordering;

use clap::Parser;
use shmpipe::linux_device::DeviceNode;
use shmpipe_proto::{InitReceiverReq, MetaPage};

#[derive(Parser)]
struct Args {
    #[arg(long)]
    device: String,
    #[arg(long, default_value_t = 4)]
    pages: u8,
    #[arg(long)]
    distant_domid: u16,
    #[arg(long)]
    grant_ref: u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut node = DeviceNode::open(&args.device)?;
    let req = InitReceiverReq {
        pages: args.pages,
        distant_domid: args.distant_domid,
        grant_ref: args.grant_ref,
    };
    node.init_receiver(&req)?;
    let base = node.mmap_region(args.pages + 1)?;
    let meta = unsafe { &*(base as *const MetaPage) };
    let buf_len = (args.pages as usize + 1) * shmpipe_proto::PAGE_SIZE - MetaPage::BUFFER_OFFSET;
    let ring = unsafe { core::slice::from_raw_parts(base.add(MetaPage::BUFFER_OFFSET), buf_len) };
    let cap = buf_len as u32;

    let mut stdout = std::io::stdout().lock();
    let mut chunk = [0u8; 4096];
    loop {
        let write_pos = meta.ring.write_pos.load(Ordering::Acquire);
        let read_pos = meta.ring.read_pos.load(Ordering::Relaxed);
        let available = shmpipe::ring::used_bytes(write_pos, read_pos, cap);
        if available == 0 {
            std::hint::spin_loop();
            continue;
        }
        let want = core::cmp::min(available as usize, chunk.len());
        shmpipe::ring::copy_from_ring(ring, read_pos, &mut chunk[..want]);
        meta.ring.read_pos.store(
            shmpipe::ring::advance(read_pos, want as u32, cap),
            Ordering::Release,
        );
        stdout.write_all(&chunk[..want])?;
        node.ssig()?;
    }
}
