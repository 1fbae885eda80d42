use crate::error::Error;

/// Size of an encoded [`BspAck`].
pub const ACK_SIZE: usize = 6;

/// Flow-control limits carried in an acknowledgment.
///
/// Encoded as three big-endian 16-bit words in the order max bytes, max
/// packets, bytes sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BspAck {
    /// Largest payload the sender of the ack accepts in one packet.
    pub max_bytes: u16,
    /// Number of packets the sender of the ack accepts outstanding.
    pub max_pups: u16,
    /// Bytes received in the current window and not yet consumed.
    pub bytes_sent: u16,
}

impl BspAck {
    pub fn new(max_bytes: u16, max_pups: u16, bytes_sent: u16) -> Self {
        Self {
            max_bytes,
            max_pups,
            bytes_sent,
        }
    }

    pub fn to_bytes(&self) -> [u8; ACK_SIZE] {
        let max_bytes = self.max_bytes.to_be_bytes();
        let max_pups = self.max_pups.to_be_bytes();
        let bytes_sent = self.bytes_sent.to_be_bytes();
        [
            max_bytes[0],
            max_bytes[1],
            max_pups[0],
            max_pups[1],
            bytes_sent[0],
            bytes_sent[1],
        ]
    }

    /// Decodes the record from the start of an ack payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < ACK_SIZE {
            return Err(Error::MalformedAck { len: buf.len() });
        }
        Ok(Self {
            max_bytes: u16::from_be_bytes([buf[0], buf[1]]),
            max_pups: u16::from_be_bytes([buf[2], buf[3]]),
            bytes_sent: u16::from_be_bytes([buf[4], buf[5]]),
        })
    }
}
