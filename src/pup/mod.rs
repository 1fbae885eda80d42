//! PUP packet values as seen by the BSP layer.
//!
//! Framing, checksums and routing belong to the transport below; this module
//! only models the fields BSP reads and writes. See [`router`] for the traits
//! the transport implements.

mod router;

pub use router::{PupRouter, SequentialSocketAllocator, SocketAllocator};

use crate::error::Error;
use std::fmt;

/// Largest payload a single PUP may carry.
pub const MAX_PUP_DATA: usize = 532;

/// Size of an encoded [`PupPort`].
pub const PORT_SIZE: usize = 6;

// ============================================================================
// Packet Types
// ============================================================================

/// The closed set of PUP types the BSP layer handles.
///
/// Conversion from a raw code goes through [`TryFrom<u8>`], so anything that
/// reaches the dispatcher is one of these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PupType {
    Error,
    /// Rendezvous request (and its reply).
    Rfc,
    Abort,
    End,
    EndReply,
    Data,
    /// Data requesting an acknowledgment.
    AData,
    Ack,
    Mark,
    Interrupt,
    InterruptReply,
    /// Mark requesting an acknowledgment.
    AMark,
}

impl PupType {
    /// Standard numeric code of this type.
    pub fn code(self) -> u8 {
        match self {
            PupType::Error => 4,
            PupType::Rfc => 8,
            PupType::Abort => 9,
            PupType::End => 10,
            PupType::EndReply => 11,
            PupType::Data => 16,
            PupType::AData => 17,
            PupType::Ack => 18,
            PupType::Mark => 19,
            PupType::Interrupt => 20,
            PupType::InterruptReply => 21,
            PupType::AMark => 22,
        }
    }

    /// True for the types that carry stream positions (data and marks).
    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            PupType::Data | PupType::AData | PupType::Mark | PupType::AMark
        )
    }

    /// True for the variants that ask the receiver for an acknowledgment.
    pub fn wants_ack(self) -> bool {
        matches!(self, PupType::AData | PupType::AMark)
    }
}

impl TryFrom<u8> for PupType {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Error> {
        Ok(match code {
            4 => PupType::Error,
            8 => PupType::Rfc,
            9 => PupType::Abort,
            10 => PupType::End,
            11 => PupType::EndReply,
            16 => PupType::Data,
            17 => PupType::AData,
            18 => PupType::Ack,
            19 => PupType::Mark,
            20 => PupType::Interrupt,
            21 => PupType::InterruptReply,
            22 => PupType::AMark,
            other => return Err(Error::UnknownPupType(other)),
        })
    }
}

impl fmt::Display for PupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ============================================================================
// Addresses
// ============================================================================

/// A network/host pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HostAddress {
    pub network: u8,
    pub host: u8,
}

impl HostAddress {
    pub fn new(network: u8, host: u8) -> Self {
        Self { network, host }
    }
}

/// A full PUP address: network, host and 32-bit socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PupPort {
    pub network: u8,
    pub host: u8,
    pub socket: u32,
}

impl PupPort {
    pub fn new(network: u8, host: u8, socket: u32) -> Self {
        Self {
            network,
            host,
            socket,
        }
    }

    pub fn from_host(host: HostAddress, socket: u32) -> Self {
        Self::new(host.network, host.host, socket)
    }

    pub fn host_address(&self) -> HostAddress {
        HostAddress::new(self.network, self.host)
    }

    /// Encodes the port as network, host, then the socket big-endian.
    pub fn to_bytes(&self) -> [u8; PORT_SIZE] {
        let socket = self.socket.to_be_bytes();
        [
            self.network,
            self.host,
            socket[0],
            socket[1],
            socket[2],
            socket[3],
        ]
    }

    /// Decodes a port from the start of `buf`; `None` if it is too short.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < PORT_SIZE {
            return None;
        }
        let socket = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        Some(Self::new(buf[0], buf[1], socket))
    }
}

impl fmt::Display for PupPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:o}#{:o}#{:o}", self.network, self.host, self.socket)
    }
}

// ============================================================================
// Packet
// ============================================================================

/// One PUP as handed to and from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pup {
    pub pup_type: PupType,
    /// Correlation id; for data and marks, the stream position.
    pub id: u32,
    pub destination: PupPort,
    pub source: PupPort,
    pub contents: Vec<u8>,
}

impl Pup {
    pub fn new(
        pup_type: PupType,
        id: u32,
        destination: PupPort,
        source: PupPort,
        contents: Vec<u8>,
    ) -> Self {
        Self {
            pup_type,
            id,
            destination,
            source,
            contents,
        }
    }

    /// Renders the payload as text for log lines (abort and error messages).
    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents).into_owned()
    }
}
