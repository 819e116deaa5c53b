use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use shmpipe_proto::rendezvous::{
    ClientHelloBody, GrantBody, Header, MessageKind, Mode, MAX_DATAGRAM_LEN, MIN_GRANT_LEN,
    MIN_HELLO_LEN, VERSION,
};

use crate::error::{RendezvousError, Result};
use crate::Offer;

#[derive(Debug, Clone, Copy)]
pub struct Paired {
    pub addr: SocketAddr,
    pub peer: Offer,
}

#[derive(Default)]
pub struct Metrics {
    sessions_opened: AtomicU64,
    sessions_paired: AtomicU64,
    sessions_reset: AtomicU64,
    datagrams_dropped: AtomicU64,
}

impl Metrics {
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }
    pub fn sessions_paired(&self) -> u64 {
        self.sessions_paired.load(Ordering::Relaxed)
    }
    pub fn sessions_reset(&self) -> u64 {
        self.sessions_reset.load(Ordering::Relaxed)
    }
    pub fn datagrams_dropped(&self) -> u64 {
        self.datagrams_dropped.load(Ordering::Relaxed)
    }
}

struct HalfOpen {
    client_domid: u32,
    opened_at: Instant,
}

/// Listener loop state: one background thread owns the socket and the
/// half-open table, matching spec.md §5's "parallel OS threads" model
/// rather than an async runtime.
pub struct Listener {
    socket: UdpSocket,
    local_addr: SocketAddr,
    metrics: Arc<Metrics>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        offer: Offer,
        mut on_paired: impl FnMut(Paired) + Send + 'static,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        let local_addr = socket.local_addr()?;
        let metrics = Arc::new(Metrics::default());
        let stop = Arc::new(AtomicBool::new(false));

        let loop_socket = socket.try_clone()?;
        let loop_metrics = metrics.clone();
        let loop_stop = stop.clone();
        let thread = std::thread::spawn(move || {
            let mut half_open: HashMap<SocketAddr, HalfOpen> = HashMap::new();
            let mut buf = [0u8; 64];
            while !loop_stop.load(Ordering::Relaxed) {
                let (n, from) = match loop_socket.recv_from(&mut buf) {
                    Ok(v) => v,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(_) => continue,
                };
                handle_datagram(
                    &buf[..n],
                    from,
                    &loop_socket,
                    &mut half_open,
                    offer,
                    &loop_metrics,
                    &mut on_paired,
                );
            }
        });

        Ok(Self {
            socket,
            local_addr,
            metrics,
            stop,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_datagram(
    bytes: &[u8],
    from: SocketAddr,
    socket: &UdpSocket,
    half_open: &mut HashMap<SocketAddr, HalfOpen>,
    offer: Offer,
    metrics: &Metrics,
    on_paired: &mut impl FnMut(Paired),
) {
    if bytes.len() < core::mem::size_of::<Header>() || bytes.len() > MAX_DATAGRAM_LEN {
        metrics.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let version = bytes[0];
    let kind = MessageKind::from_u8(bytes[1]);
    if version != VERSION {
        debug!(?from, version, "rendezvous: version mismatch, dropping");
        metrics.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let Some(kind) = kind else {
        metrics.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    };

    match kind {
        MessageKind::ClientHello => {
            if bytes.len() < MIN_HELLO_LEN {
                metrics.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let domid = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
            // A repeat HELLO from the same address drops the prior
            // half-open entry and starts fresh (spec.md §9 documented
            // decision, not a bug).
            half_open.insert(
                from,
                HalfOpen {
                    client_domid: domid,
                    opened_at: Instant::now(),
                },
            );
            metrics.sessions_opened.fetch_add(1, Ordering::Relaxed);
            info!(?from, domid, "rendezvous: session opened");
            let _ = send_grant(socket, from, MessageKind::ServerGrant, offer);
        }
        MessageKind::ClientGrant => {
            if bytes.len() < MIN_GRANT_LEN {
                metrics.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let Some(entry) = half_open.remove(&from) else {
                // No HELLO preceded this: reset rather than silently drop,
                // so a confused/restarted client notices immediately.
                metrics.sessions_reset.fetch_add(1, Ordering::Relaxed);
                let _ = send_header(socket, from, MessageKind::ServerReset);
                return;
            };
            let peer = parse_grant(bytes);
            metrics.sessions_paired.fetch_add(1, Ordering::Relaxed);
            info!(?from, client_domid = entry.client_domid, "rendezvous: paired");
            on_paired(Paired { addr: from, peer });
        }
        MessageKind::ClientReset => {
            half_open.remove(&from);
            metrics.sessions_reset.fetch_add(1, Ordering::Relaxed);
        }
        MessageKind::ServerGrant | MessageKind::ServerReset => {
            // Server-only messages arriving at a listener are protocol
            // noise; drop rather than reply to avoid an amplification loop.
            metrics.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn parse_grant(bytes: &[u8]) -> Offer {
    let grant_ref = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let domid = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let mode = Mode::from_u8(bytes[12]).unwrap_or(Mode::WriterOffers);
    let page_count = bytes[13];
    Offer {
        grant_ref,
        domid,
        mode,
        page_count,
    }
}

fn encode_grant(kind: MessageKind, offer: Offer) -> [u8; MIN_GRANT_LEN] {
    let mut out = [0u8; MIN_GRANT_LEN];
    let header = Header::new(kind);
    out[0] = header.version;
    out[1] = header.message;
    let body = GrantBody {
        grant_ref: offer.grant_ref,
        domid: offer.domid,
        mode: offer.mode as u8,
        page_count: offer.page_count,
    };
    out[4..8].copy_from_slice(&body.grant_ref.to_le_bytes());
    out[8..12].copy_from_slice(&body.domid.to_le_bytes());
    out[12] = body.mode;
    out[13] = body.page_count;
    out
}

pub(crate) fn send_grant(
    socket: &UdpSocket,
    to: SocketAddr,
    kind: MessageKind,
    offer: Offer,
) -> Result<()> {
    let datagram = encode_grant(kind, offer);
    socket.send_to(&datagram, to)?;
    Ok(())
}

fn send_header(socket: &UdpSocket, to: SocketAddr, kind: MessageKind) -> Result<()> {
    let header = Header::new(kind);
    let bytes = [header.version, header.message, 0, 0];
    socket.send_to(&bytes, to)?;
    Ok(())
}

pub(crate) fn send_hello(socket: &UdpSocket, to: SocketAddr, domid: u32) -> Result<()> {
    let mut out = [0u8; MIN_HELLO_LEN];
    let header = Header::new(MessageKind::ClientHello);
    out[0] = header.version;
    out[1] = header.message;
    let body = ClientHelloBody { domid };
    out[4..8].copy_from_slice(&body.domid.to_le_bytes());
    socket.send_to(&out, to)?;
    Ok(())
}

/// Run the client side of the handshake: send CLIENT_HELLO, wait for
/// SERVER_GRANT, reply with CLIENT_GRANT, and return the server's offer.
pub fn connect(
    server: SocketAddr,
    local_domid: u32,
    offer: Offer,
    timeout: Duration,
) -> Result<Paired> {
    let socket = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_read_timeout(Some(timeout))?;
    send_hello(&socket, server, local_domid)?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 64];
    loop {
        if Instant::now() >= deadline {
            return Err(RendezvousError::Timeout);
        }
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(RendezvousError::Timeout)
            }
            Err(e) => return Err(e.into()),
        };
        if from != server || n < MIN_GRANT_LEN || buf[0] != VERSION {
            continue;
        }
        match MessageKind::from_u8(buf[1]) {
            Some(MessageKind::ServerGrant) => {
                let peer = parse_grant(&buf[..n]);
                send_grant(&socket, server, MessageKind::ClientGrant, offer)?;
                return Ok(Paired {
                    addr: server,
                    peer,
                });
            }
            Some(MessageKind::ServerReset) => return Err(RendezvousError::Reset),
            _ => continue,
        }
    }
}
