//! UDP rendezvous handshake (spec.md §4.3): exchanges a grant reference and
//! domain id between two hosts before either side opens the actual
//! shmpipe. CLIENT_HELLO -> SERVER_GRANT -> CLIENT_GRANT, with
//! SERVER_RESET/CLIENT_RESET tearing a session down early.

pub mod error;
mod session;

pub use error::{RendezvousError, Result};
pub use session::{connect, Listener, Paired};

use shmpipe_proto::rendezvous::Mode;

/// One side's offer, carried in `SERVER_GRANT`/`CLIENT_GRANT`.
#[derive(Debug, Clone, Copy)]
pub struct Offer {
    pub grant_ref: u32,
    pub domid: u32,
    pub mode: Mode,
    pub page_count: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::sync::mpsc;
    use std::time::Duration;

    fn local_offer() -> Offer {
        Offer {
            grant_ref: 42,
            domid: 7,
            mode: Mode::WriterOffers,
            page_count: 2,
        }
    }

    #[test]
    fn listener_pairs_with_connecting_client() {
        let (tx, rx) = mpsc::channel();
        let listener = Listener::bind("127.0.0.1:0", local_offer(), move |paired| {
            tx.send(paired).unwrap();
        })
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let client_offer = Offer {
            grant_ref: 99,
            domid: 8,
            mode: Mode::WriterOffers,
            page_count: 2,
        };
        let paired = session::connect(addr, 8, client_offer, Duration::from_secs(2)).unwrap();
        assert_eq!(paired.peer.grant_ref, 42);

        let server_side = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(server_side.peer.grant_ref, 99);
        listener.shutdown();
    }

    #[test]
    fn bad_version_datagram_is_dropped_and_ignored() {
        let listener = Listener::bind("127.0.0.1:0", local_offer(), |_| {}).unwrap();
        let addr = listener.local_addr().unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.send_to(&[9, 1, 0, 0], addr).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(listener.metrics().datagrams_dropped(), 1);
        listener.shutdown();
    }

    #[test]
    fn duplicate_hello_restarts_the_session() {
        let listener = Listener::bind("127.0.0.1:0", local_offer(), |_| {}).unwrap();
        let addr = listener.local_addr().unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        session::send_hello(&sock, addr, 11).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        session::send_hello(&sock, addr, 11).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(listener.metrics().sessions_opened(), 2);
        listener.shutdown();
    }

    #[test]
    fn client_grant_without_hello_is_reset() {
        let listener = Listener::bind("127.0.0.1:0", local_offer(), |_| {}).unwrap();
        let addr = listener.local_addr().unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        session::send_grant(
            &sock,
            addr,
            shmpipe_proto::rendezvous::MessageKind::ClientGrant,
            local_offer(),
        )
        .unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = sock.recv_from(&mut buf).unwrap();
        assert_eq!(
            buf[1],
            shmpipe_proto::rendezvous::MessageKind::ServerReset as u8
        );
        assert!(n >= 4);
        listener.shutdown();
    }
}
