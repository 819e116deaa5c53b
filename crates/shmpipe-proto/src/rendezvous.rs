//! UDP rendezvous wire format (spec.md §4.3, §6).
//!
//! Fixed, little-endian-on-the-wire, packed messages. These are plain data
//! only — the listener/client state machines live in `shmpipe-rendezvous`.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const VERSION: u8 = 1;
pub const MAX_DATAGRAM_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    ClientHello = 1,
    ServerGrant = 2,
    ClientGrant = 3,
    ServerReset = 4,
    ClientReset = 5,
}

impl MessageKind {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ClientHello),
            2 => Some(Self::ServerGrant),
            3 => Some(Self::ClientGrant),
            4 => Some(Self::ServerReset),
            5 => Some(Self::ClientReset),
            _ => None,
        }
    }
}

/// The 4-byte header prefixing every datagram.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Header {
    pub version: u8,
    pub message: u8,
    pub reserved: u16,
}

impl Header {
    pub fn new(message: MessageKind) -> Self {
        Self {
            version: VERSION,
            message: message as u8,
            reserved: 0,
        }
    }
}

/// Body of `CLIENT_HELLO`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ClientHelloBody {
    pub domid: u32,
}

/// The grant direction a `Grant` offer is made for (spec.md §9 Open
/// Question: receiver-offers is symmetric to writer-offers with the grant
/// direction reversed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    WriterOffers = 1,
    ReaderOffers = 2,
}

impl Mode {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::WriterOffers),
            2 => Some(Self::ReaderOffers),
            _ => None,
        }
    }
}

/// Body shared by `SERVER_GRANT` and `CLIENT_GRANT`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct GrantBody {
    pub grant_ref: u32,
    pub domid: u32,
    pub mode: u8,
    pub page_count: u8,
}

/// Smallest complete body any message carries, used to reject truncated
/// datagrams early (spec.md §6: "messages below the declared body size
/// are ignored").
pub const MIN_HELLO_LEN: usize = core::mem::size_of::<Header>() + core::mem::size_of::<ClientHelloBody>();
pub const MIN_GRANT_LEN: usize = core::mem::size_of::<Header>() + core::mem::size_of::<GrantBody>();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagrams_fit_budget() {
        assert!(MIN_GRANT_LEN <= MAX_DATAGRAM_LEN);
        assert!(MIN_HELLO_LEN <= MAX_DATAGRAM_LEN);
    }
}
