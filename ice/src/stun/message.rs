use core::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::{TransactionId, HEADER_SIZE, ID_SIZE, MAGIC_COOKIE};
use crate::error::StunError;

type HmacSha1 = Hmac<Sha1>;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// XORed into the CRC-32 of FINGERPRINT, "STUN" in ASCII.
const FINGERPRINT_XOR: u32 = 0x5354_554e;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Attribute types.
mod attr {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const CHANGE_REQUEST: u16 = 0x0003;
    pub const SOURCE_ADDRESS: u16 = 0x0004;
    pub const CHANGED_ADDRESS: u16 = 0x0005;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const CHANNEL_NUMBER: u16 = 0x000c;
    pub const LIFETIME: u16 = 0x000d;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const DATA: u16 = 0x0013;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const EVEN_PORT: u16 = 0x0018;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const RESERVATION_TOKEN: u16 = 0x0022;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
    pub const ICE_CONTROLLED: u16 = 0x8029;
    pub const ICE_CONTROLLING: u16 = 0x802a;
    pub const OTHER_ADDRESS: u16 = 0x802c;
}

/// STUN and TURN methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Binding, used by STUN and ICE
    Binding,
    /// Shared secret (obsolete)
    SharedSecret,
    /// TURN allocation
    Allocate,
    /// TURN allocation refresh
    Refresh,
    /// TURN send indication
    Send,
    /// TURN data indication
    Data,
    /// TURN permission
    CreatePermission,
    /// TURN channel binding
    ChannelBind,
    /// Any other method
    Other(u16),
}

impl Method {
    fn code(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::SharedSecret => 0x002,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
            Method::Send => 0x006,
            Method::Data => 0x007,
            Method::CreatePermission => 0x008,
            Method::ChannelBind => 0x009,
            Method::Other(code) => code,
        }
    }

    fn from_type(message_type: u16) -> Method {
        match message_type & 0x3eef {
            0x001 => Method::Binding,
            0x002 => Method::SharedSecret,
            0x003 => Method::Allocate,
            0x004 => Method::Refresh,
            0x006 => Method::Send,
            0x007 => Method::Data,
            0x008 => Method::CreatePermission,
            0x009 => Method::ChannelBind,
            code => Method::Other(code),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Method::Binding => write!(fmt, "Binding"),
            Method::SharedSecret => write!(fmt, "Shared Secret"),
            Method::Allocate => write!(fmt, "Allocate"),
            Method::Refresh => write!(fmt, "Refresh"),
            Method::Send => write!(fmt, "Send"),
            Method::Data => write!(fmt, "Data"),
            Method::CreatePermission => write!(fmt, "CreatePermission"),
            Method::ChannelBind => write!(fmt, "ChannelBind"),
            Method::Other(code) => write!(fmt, "Unknown(0x{:03x})", code),
        }
    }
}

/// STUN message classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// Request, expecting a response or an error
    Request,
    /// Indication, no answer expected
    Indication,
    /// Success response
    Response,
    /// Error response
    Error,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0x000,
            Class::Indication => 0x010,
            Class::Response => 0x100,
            Class::Error => 0x110,
        }
    }

    /// Class encoded in a message type.
    pub fn from_type(message_type: u16) -> Class {
        match message_type & 0x0110 {
            0x000 => Class::Request,
            0x010 => Class::Indication,
            0x100 => Class::Response,
            _ => Class::Error,
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Class::Request => write!(fmt, "Request"),
            Class::Indication => write!(fmt, "Indication"),
            Class::Response => write!(fmt, "Response"),
            Class::Error => write!(fmt, "Error"),
        }
    }
}

/// Content of an ERROR-CODE attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    /// Numeric code, e.g. 401
    pub code: u16,
    /// Reason phrase
    pub reason: String,
}

impl ErrorCode {
    /// The long-term credentials are missing or stale.
    pub const UNAUTHORIZED: u16 = 401;
    /// Synthesized when a transaction got no answer.
    pub const TIMED_OUT: u16 = 408;
    /// Both agents claim the same ICE role.
    pub const ROLE_CONFLICT: u16 = 487;

    /// Build an error code.
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        ErrorCode {
            code,
            reason: reason.into(),
        }
    }
}

/// A STUN message, with the attributes this crate knows about.
///
/// Address attributes are only encoded when set. The XOR-ed ones are
/// obfuscated with the magic cookie and the transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    message_type: u16,
    /// Magic cookie, [`MAGIC_COOKIE`] unless decoded from a RFC 3489 peer
    pub cookie: u32,
    /// Transaction id
    pub id: TransactionId,
    /// MAPPED-ADDRESS
    pub mapped_address: Option<SocketAddr>,
    /// SOURCE-ADDRESS
    pub source_address: Option<SocketAddr>,
    /// CHANGED-ADDRESS
    pub changed_address: Option<SocketAddr>,
    /// OTHER-ADDRESS
    pub other_address: Option<SocketAddr>,
    /// XOR-MAPPED-ADDRESS
    pub xor_mapped_address: Option<SocketAddr>,
    /// XOR-PEER-ADDRESS
    pub xor_peer_address: Option<SocketAddr>,
    /// XOR-RELAYED-ADDRESS
    pub xor_relayed_address: Option<SocketAddr>,
    /// CHANGE-REQUEST flags
    pub change_request: Option<u32>,
    /// ERROR-CODE
    pub error: Option<ErrorCode>,
    /// PRIORITY
    pub priority: Option<u32>,
    /// USE-CANDIDATE
    pub use_candidate: bool,
    /// CHANNEL-NUMBER
    pub channel_number: Option<u16>,
    /// DATA
    pub data: Option<Vec<u8>>,
    /// LIFETIME, in seconds
    pub lifetime: Option<u32>,
    /// NONCE
    pub nonce: Option<Vec<u8>>,
    /// REALM
    pub realm: Option<String>,
    /// REQUESTED-TRANSPORT protocol number, 17 for UDP
    pub requested_transport: Option<u8>,
    /// RESERVATION-TOKEN
    pub reservation_token: Option<[u8; 8]>,
    /// EVEN-PORT reservation flag
    pub even_port: Option<bool>,
    /// SOFTWARE
    pub software: Option<String>,
    /// USERNAME
    pub username: Option<String>,
    /// ICE-CONTROLLING tie-breaker
    pub ice_controlling: Option<u64>,
    /// ICE-CONTROLLED tie-breaker
    pub ice_controlled: Option<u64>,
}

impl StunMessage {
    /// An empty message.
    pub fn new(method: Method, class: Class, id: TransactionId) -> Self {
        StunMessage {
            message_type: method.code() | class.bits(),
            cookie: MAGIC_COOKIE,
            id,
            mapped_address: None,
            source_address: None,
            changed_address: None,
            other_address: None,
            xor_mapped_address: None,
            xor_peer_address: None,
            xor_relayed_address: None,
            change_request: None,
            error: None,
            priority: None,
            use_candidate: false,
            channel_number: None,
            data: None,
            lifetime: None,
            nonce: None,
            realm: None,
            requested_transport: None,
            reservation_token: None,
            even_port: None,
            software: None,
            username: None,
            ice_controlling: None,
            ice_controlled: None,
        }
    }

    /// Raw message type.
    pub fn message_type(&self) -> u16 {
        self.message_type
    }

    /// Method of the message.
    pub fn method(&self) -> Method {
        Method::from_type(self.message_type)
    }

    /// Class of the message.
    pub fn class(&self) -> Class {
        Class::from_type(self.message_type)
    }

    /// Change the class, keeping the method.
    pub fn set_class(&mut self, class: Class) {
        self.message_type = (self.message_type & !0x0110) | class.bits();
    }

    /// Encode the message.
    ///
    /// With a non-empty `key`, MESSAGE-INTEGRITY is added as the HMAC-SHA1
    /// of everything before it. FINGERPRINT comes last when asked for.
    pub fn encode(&self, key: Option<&[u8]>, fingerprint: bool) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u16(self.message_type);
        buf.put_u16(0);
        buf.put_u32(self.cookie);
        buf.put_slice(&self.id);

        let addresses = [
            (attr::MAPPED_ADDRESS, self.mapped_address, false),
            (attr::SOURCE_ADDRESS, self.source_address, false),
            (attr::CHANGED_ADDRESS, self.changed_address, false),
            (attr::OTHER_ADDRESS, self.other_address, false),
            (attr::XOR_MAPPED_ADDRESS, self.xor_mapped_address, true),
            (attr::XOR_PEER_ADDRESS, self.xor_peer_address, true),
            (attr::XOR_RELAYED_ADDRESS, self.xor_relayed_address, true),
        ];
        if let Some(flags) = self.change_request {
            put_u32(&mut buf, attr::CHANGE_REQUEST, flags);
        }
        for (kind, address, xor) in addresses {
            if let Some(address) = address {
                put_address(&mut buf, kind, address, xor.then_some(&self.id));
            }
        }
        if let Some(error) = &self.error {
            let reason = error.reason.as_bytes();
            let mut value = Vec::with_capacity(4 + reason.len());
            value.extend_from_slice(&[0, 0, (error.code / 100) as u8, (error.code % 100) as u8]);
            value.extend_from_slice(reason);
            put_bytes(&mut buf, attr::ERROR_CODE, &value);
        }
        if let Some(priority) = self.priority {
            put_u32(&mut buf, attr::PRIORITY, priority);
        }
        if self.use_candidate {
            buf.put_u16(attr::USE_CANDIDATE);
            buf.put_u16(0);
        }
        if let Some(channel) = self.channel_number {
            put_u32(&mut buf, attr::CHANNEL_NUMBER, u32::from(channel) << 16);
        }
        if let Some(data) = &self.data {
            put_bytes(&mut buf, attr::DATA, data);
        }
        if let Some(lifetime) = self.lifetime {
            put_u32(&mut buf, attr::LIFETIME, lifetime);
        }
        if let Some(nonce) = &self.nonce {
            put_bytes(&mut buf, attr::NONCE, nonce);
        }
        if let Some(realm) = &self.realm {
            put_bytes(&mut buf, attr::REALM, realm.as_bytes());
        }
        if let Some(protocol) = self.requested_transport {
            put_u32(&mut buf, attr::REQUESTED_TRANSPORT, u32::from(protocol) << 24);
        }
        if let Some(token) = &self.reservation_token {
            put_bytes(&mut buf, attr::RESERVATION_TOKEN, token);
        }
        if let Some(reserve) = self.even_port {
            put_bytes(&mut buf, attr::EVEN_PORT, &[if reserve { 0x80 } else { 0 }]);
        }
        if let Some(software) = &self.software {
            put_bytes(&mut buf, attr::SOFTWARE, software.as_bytes());
        }
        if let Some(username) = &self.username {
            put_bytes(&mut buf, attr::USERNAME, username.as_bytes());
        }
        if let Some(tie_breaker) = self.ice_controlling {
            put_bytes(&mut buf, attr::ICE_CONTROLLING, &tie_breaker.to_be_bytes());
        } else if let Some(tie_breaker) = self.ice_controlled {
            put_bytes(&mut buf, attr::ICE_CONTROLLED, &tie_breaker.to_be_bytes());
        }

        let body = buf.len() - HEADER_SIZE;
        set_length(&mut buf, body);

        if let Some(key) = key.filter(|key| !key.is_empty()) {
            let length = buf.len() - HEADER_SIZE + 24;
            set_length(&mut buf, length);
            let integrity = hmac_sha1(key, &buf);
            buf.put_u16(attr::MESSAGE_INTEGRITY);
            buf.put_u16(integrity.len() as u16);
            buf.put_slice(&integrity);
        }

        if fingerprint {
            let length = buf.len() - HEADER_SIZE + 8;
            set_length(&mut buf, length);
            let crc = CRC32.checksum(&buf) ^ FINGERPRINT_XOR;
            put_u32(&mut buf, attr::FINGERPRINT, crc);
        }

        buf.to_vec()
    }

    /// Decode a message, verifying MESSAGE-INTEGRITY against `key` when one
    /// is given, and FINGERPRINT when present.
    ///
    /// Only FINGERPRINT is honoured after MESSAGE-INTEGRITY, and nothing is
    /// read after FINGERPRINT. Unknown attributes are skipped.
    pub fn decode(buffer: &[u8], key: Option<&[u8]>) -> Result<StunMessage, StunError> {
        if buffer.len() < HEADER_SIZE {
            return Err(StunError::Truncated);
        }
        let mut header = &buffer[..HEADER_SIZE];
        let message_type = header.get_u16();
        let length = header.get_u16() as usize;
        let cookie = header.get_u32();
        let mut id = [0u8; ID_SIZE];
        header.copy_to_slice(&mut id);
        if length != buffer.len() - HEADER_SIZE {
            return Err(StunError::LengthMismatch {
                declared: length,
                actual: buffer.len() - HEADER_SIZE,
            });
        }

        let mut message = StunMessage::new(Method::Binding, Class::Request, id);
        message.message_type = message_type;
        message.cookie = cookie;

        let key = key.filter(|key| !key.is_empty());
        let mut offset = HEADER_SIZE;
        let mut after_integrity = false;
        while offset < buffer.len() {
            let mut tlv = &buffer[offset..];
            if tlv.len() < 4 {
                return Err(StunError::Truncated);
            }
            let kind = tlv.get_u16();
            let size = tlv.get_u16() as usize;
            if tlv.len() < size {
                return Err(StunError::Truncated);
            }
            let value = &tlv[..size];
            let next = (offset + 4 + ((size + 3) & !3)).min(buffer.len());

            if after_integrity && kind != attr::FINGERPRINT {
                log::warn!(
                    "Skipping attribute 0x{:04x} after MESSAGE-INTEGRITY",
                    kind
                );
                offset = next;
                continue;
            }

            match kind {
                attr::MESSAGE_INTEGRITY => {
                    if size != 20 {
                        return Err(StunError::BadAttribute { attr: kind });
                    }
                    if let Some(key) = key {
                        let mut copy = buffer[..offset].to_vec();
                        set_length(&mut copy, offset - HEADER_SIZE + 24);
                        let mut mac = new_hmac(key);
                        mac.update(&copy);
                        mac.verify_slice(value)
                            .map_err(|_| StunError::BadIntegrity)?;
                    }
                    after_integrity = true;
                }
                attr::FINGERPRINT => {
                    let received = read_u32(kind, value)?;
                    let mut copy = buffer[..offset].to_vec();
                    set_length(&mut copy, offset - HEADER_SIZE + 8);
                    if received != CRC32.checksum(&copy) ^ FINGERPRINT_XOR {
                        return Err(StunError::BadFingerprint);
                    }
                    return Ok(message);
                }
                _ => message.read_attribute(kind, value)?,
            }
            offset = next;
        }
        Ok(message)
    }

    fn read_attribute(&mut self, kind: u16, value: &[u8]) -> Result<(), StunError> {
        let id = self.id;
        let address = |xor: bool| {
            read_address(value, xor.then_some(&id)).ok_or(StunError::BadAddress { attr: kind })
        };
        match kind {
            attr::MAPPED_ADDRESS => self.mapped_address = Some(address(false)?),
            attr::SOURCE_ADDRESS => self.source_address = Some(address(false)?),
            attr::CHANGED_ADDRESS => self.changed_address = Some(address(false)?),
            attr::OTHER_ADDRESS => self.other_address = Some(address(false)?),
            attr::XOR_MAPPED_ADDRESS => self.xor_mapped_address = Some(address(true)?),
            attr::XOR_PEER_ADDRESS => self.xor_peer_address = Some(address(true)?),
            attr::XOR_RELAYED_ADDRESS => self.xor_relayed_address = Some(address(true)?),
            attr::CHANGE_REQUEST => self.change_request = Some(read_u32(kind, value)?),
            attr::ERROR_CODE => {
                if value.len() < 4 {
                    return Err(StunError::BadAttribute { attr: kind });
                }
                let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                self.error = Some(ErrorCode { code, reason });
            }
            attr::PRIORITY => self.priority = Some(read_u32(kind, value)?),
            attr::USE_CANDIDATE => {
                if !value.is_empty() {
                    return Err(StunError::BadAttribute { attr: kind });
                }
                self.use_candidate = true;
            }
            attr::CHANNEL_NUMBER => {
                self.channel_number = Some((read_u32(kind, value)? >> 16) as u16);
            }
            attr::DATA => self.data = Some(value.to_vec()),
            attr::LIFETIME => self.lifetime = Some(read_u32(kind, value)?),
            attr::NONCE => self.nonce = Some(value.to_vec()),
            attr::REALM => self.realm = Some(String::from_utf8_lossy(value).into_owned()),
            attr::REQUESTED_TRANSPORT => {
                self.requested_transport = Some((read_u32(kind, value)? >> 24) as u8);
            }
            attr::RESERVATION_TOKEN => {
                let token = value
                    .try_into()
                    .map_err(|_| StunError::BadAttribute { attr: kind })?;
                self.reservation_token = Some(token);
            }
            attr::EVEN_PORT => {
                let [flags] = value else {
                    return Err(StunError::BadAttribute { attr: kind });
                };
                self.even_port = Some(flags & 0x80 != 0);
            }
            attr::SOFTWARE => self.software = Some(String::from_utf8_lossy(value).into_owned()),
            attr::USERNAME => self.username = Some(String::from_utf8_lossy(value).into_owned()),
            attr::ICE_CONTROLLING => self.ice_controlling = Some(read_u64(kind, value)?),
            attr::ICE_CONTROLLED => self.ice_controlled = Some(read_u64(kind, value)?),
            _ => log::warn!("Skipping unknown attribute 0x{:04x}", kind),
        }
        Ok(())
    }
}

impl fmt::Display for StunMessage {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            " type {} {} (0x{:04x})\n * id ",
            self.method(),
            self.class(),
            self.message_type
        )?;
        for byte in &self.id {
            write!(fmt, "{:02x}", byte)?;
        }
        if let Some(username) = &self.username {
            write!(fmt, "\n * USERNAME {}", username)?;
        }
        if let Some(error) = &self.error {
            write!(fmt, "\n * ERROR-CODE {} {}", error.code, error.reason)?;
        }
        if let Some(software) = &self.software {
            write!(fmt, "\n * SOFTWARE {}", software)?;
        }
        if let Some(realm) = &self.realm {
            write!(fmt, "\n * REALM {}", realm)?;
        }
        if let Some(lifetime) = self.lifetime {
            write!(fmt, "\n * LIFETIME {}", lifetime)?;
        }
        if let Some(channel) = self.channel_number {
            write!(fmt, "\n * CHANNEL-NUMBER 0x{:04x}", channel)?;
        }
        if let Some(data) = &self.data {
            write!(fmt, "\n * DATA {} bytes", data.len())?;
        }
        let addresses = [
            ("MAPPED-ADDRESS", self.mapped_address),
            ("SOURCE-ADDRESS", self.source_address),
            ("CHANGED-ADDRESS", self.changed_address),
            ("OTHER-ADDRESS", self.other_address),
            ("XOR-MAPPED-ADDRESS", self.xor_mapped_address),
            ("XOR-PEER-ADDRESS", self.xor_peer_address),
            ("XOR-RELAYED-ADDRESS", self.xor_relayed_address),
        ];
        for (name, address) in addresses {
            if let Some(address) = address {
                write!(fmt, "\n * {} {}", name, address)?;
            }
        }
        if let Some(priority) = self.priority {
            write!(fmt, "\n * PRIORITY {}", priority)?;
        }
        if self.use_candidate {
            write!(fmt, "\n * USE-CANDIDATE")?;
        }
        if let Some(tie_breaker) = self.ice_controlling {
            write!(fmt, "\n * ICE-CONTROLLING {:016x}", tie_breaker)?;
        }
        if let Some(tie_breaker) = self.ice_controlled {
            write!(fmt, "\n * ICE-CONTROLLED {:016x}", tie_breaker)?;
        }
        Ok(())
    }
}

fn new_hmac(key: &[u8]) -> HmacSha1 {
    HmacSha1::new_from_slice(key).expect("HMAC can take key of any size")
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = new_hmac(key);
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn set_length(buffer: &mut [u8], length: usize) {
    buffer[2..4].copy_from_slice(&(length as u16).to_be_bytes());
}

fn put_u32(buf: &mut BytesMut, kind: u16, value: u32) {
    buf.put_u16(kind);
    buf.put_u16(4);
    buf.put_u32(value);
}

fn put_bytes(buf: &mut BytesMut, kind: u16, value: &[u8]) {
    buf.put_u16(kind);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    buf.put_bytes(0, (4 - value.len() % 4) % 4);
}

fn xor_pad(id: &TransactionId) -> [u8; 16] {
    let mut pad = [0u8; 16];
    pad[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    pad[4..].copy_from_slice(id);
    pad
}

fn put_address(buf: &mut BytesMut, kind: u16, address: SocketAddr, xor: Option<&TransactionId>) {
    let mut port = address.port();
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    buf.put_u16(kind);
    match address.ip() {
        IpAddr::V4(ip) => {
            buf.put_u16(8);
            buf.put_u8(0);
            buf.put_u8(FAMILY_IPV4);
            buf.put_u16(port);
            let mut raw = u32::from(ip);
            if xor.is_some() {
                raw ^= MAGIC_COOKIE;
            }
            buf.put_u32(raw);
        }
        IpAddr::V6(ip) => {
            buf.put_u16(20);
            buf.put_u8(0);
            buf.put_u8(FAMILY_IPV6);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if let Some(id) = xor {
                for (octet, pad) in octets.iter_mut().zip(xor_pad(id)) {
                    *octet ^= pad;
                }
            }
            buf.put_slice(&octets);
        }
    }
}

fn read_address(mut value: &[u8], xor: Option<&TransactionId>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    value.advance(1);
    let family = value.get_u8();
    let mut port = value.get_u16();
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    let ip = match family {
        FAMILY_IPV4 if value.len() == 4 => {
            let mut raw = value.get_u32();
            if xor.is_some() {
                raw ^= MAGIC_COOKIE;
            }
            IpAddr::V4(Ipv4Addr::from(raw))
        }
        FAMILY_IPV6 if value.len() == 16 => {
            let mut octets = [0u8; 16];
            value.copy_to_slice(&mut octets);
            if let Some(id) = xor {
                for (octet, pad) in octets.iter_mut().zip(xor_pad(id)) {
                    *octet ^= pad;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

fn read_u32(kind: u16, value: &[u8]) -> Result<u32, StunError> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| StunError::BadAttribute { attr: kind })?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(kind: u16, value: &[u8]) -> Result<u64, StunError> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| StunError::BadAttribute { attr: kind })?;
    Ok(u64::from_be_bytes(bytes))
}
