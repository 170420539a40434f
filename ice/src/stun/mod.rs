//! STUN ([RFC 5389](https://www.rfc-editor.org/rfc/rfc5389)) messages and
//! transactions, plus the demultiplexing of datagrams received on a socket
//! shared by STUN, TURN channel data and media.

use std::time::Duration;

use bytes::Buf;
use rand::RngCore;

mod message;
mod transaction;

pub use message::{Class, ErrorCode, Method, StunMessage};
pub use transaction::StunTransaction;

/// The fixed magic cookie carried by every STUN message.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Size of the fixed STUN header.
pub const HEADER_SIZE: usize = 20;

/// Size of a transaction id.
pub const ID_SIZE: usize = 12;

/// Initial retransmission interval of a transaction, doubled on each try.
pub const RTO_INTERVAL: Duration = Duration::from_millis(500);

/// Number of retransmissions before a transaction times out.
pub const RTO_MAX: u32 = 7;

/// Value of the SOFTWARE attribute on our requests.
pub(crate) const SOFTWARE: &str = concat!("xmpp-ice ", env!("CARGO_PKG_VERSION"));

/// 96-bit STUN transaction id.
pub type TransactionId = [u8; ID_SIZE];

/// A fresh random transaction id.
pub fn random_id() -> TransactionId {
    let mut id = [0u8; ID_SIZE];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// If `buffer` looks like a STUN message, returns its message type and
/// transaction id without decoding the attributes.
///
/// Checks the size, the length field and the magic cookie.
pub fn peek_type(buffer: &[u8]) -> Option<(u16, TransactionId)> {
    if buffer.len() < HEADER_SIZE {
        return None;
    }
    let mut header = &buffer[..HEADER_SIZE];
    let message_type = header.get_u16();
    let length = header.get_u16() as usize;
    let cookie = header.get_u32();
    if message_type & 0xc000 != 0
        || cookie != MAGIC_COOKIE
        || length != buffer.len() - HEADER_SIZE
    {
        return None;
    }
    let mut id = [0u8; ID_SIZE];
    header.copy_to_slice(&mut id);
    Some((message_type, id))
}

/// What a datagram received on a shared socket contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram<'a> {
    /// TURN channel data (RFC 5766, section 11.4)
    ChannelData {
        /// Channel number, at least 0x4000
        channel: u16,
        /// Payload, without the 4-byte header
        data: &'a [u8],
    },
    /// A STUN message
    Stun {
        /// Message type
        message_type: u16,
        /// Transaction id
        id: TransactionId,
    },
    /// Anything else, presumably media
    Other(&'a [u8]),
}

/// Classify a received datagram.
///
/// Channel data is recognised before STUN: its first two bits are 01 while a
/// STUN message starts with 00.
pub fn demux(buffer: &[u8]) -> Datagram<'_> {
    if buffer.len() >= 4 && buffer[0] & 0xc0 == 0x40 {
        let mut header = &buffer[..4];
        let channel = header.get_u16();
        let length = header.get_u16() as usize;
        if length <= buffer.len() - 4 {
            return Datagram::ChannelData {
                channel,
                data: &buffer[4..4 + length],
            };
        }
        return Datagram::Other(buffer);
    }
    match peek_type(buffer) {
        Some((message_type, id)) => Datagram::Stun { message_type, id },
        None => Datagram::Other(buffer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_data_before_stun() {
        let datagram = [0x40, 0x00, 0x00, 0x03, b'a', b'b', b'c', 0x00];
        assert_eq!(
            demux(&datagram),
            Datagram::ChannelData {
                channel: 0x4000,
                data: b"abc"
            }
        );
    }

    #[test]
    fn stun_header() {
        let mut datagram = vec![0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42];
        datagram.extend_from_slice(&[7; ID_SIZE]);
        assert_eq!(
            demux(&datagram),
            Datagram::Stun {
                message_type: 0x0001,
                id: [7; ID_SIZE]
            }
        );

        // Wrong cookie.
        datagram[4] = 0;
        assert_eq!(demux(&datagram), Datagram::Other(&datagram));
    }

    #[test]
    fn rtp_is_other() {
        let rtp = [0x80, 0x60, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 1];
        assert!(matches!(demux(&rtp), Datagram::Other(_)));
        assert!(matches!(demux(&[]), Datagram::Other(_)));
    }

    #[test]
    fn truncated_channel_data() {
        let datagram = [0x40, 0x01, 0x00, 0x10, 1, 2];
        assert!(matches!(demux(&datagram), Datagram::Other(_)));
    }
}
