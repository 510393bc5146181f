use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::{
    config::{NODE_NETWORK, NODE_WITNESS, PROTOCOL_VERSION, USER_AGENT},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::get_current_time_in_seconds,
};

// Longest user agent a node accepts in a version message
pub const MAX_USER_AGENT_LENGTH: usize = 256;

/// Network address as carried by the version handshake (no timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
    pub services: u64,
    // IPv6 or IPv4-mapped IPv6
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn new(address: SocketAddr, services: u64) -> Self {
        let ip = match address.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            services,
            ip,
            port: address.port(),
        }
    }

    pub fn unspecified() -> Self {
        Self {
            services: 0,
            ip: [0; 16],
            port: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl Serializer for NetAddress {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.services);
        writer.write_bytes(&self.ip);
        // Port is the one big-endian field of the protocol
        writer.write_u16_be(self.port);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            services: reader.read_u64()?,
            ip: reader.read_bytes::<16>()?,
            port: reader.read_u16_be()?,
        })
    }

    fn size(&self) -> usize {
        26
    }
}

/// First message sent on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    /// Version message announced by the emulated peer.
    pub fn new(receiver: SocketAddr, nonce: u64, start_height: i32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK | NODE_WITNESS,
            timestamp: get_current_time_in_seconds() as i64,
            receiver: NetAddress::new(receiver, NODE_NETWORK | NODE_WITNESS),
            sender: NetAddress::unspecified(),
            nonce,
            user_agent: USER_AGENT.to_string(),
            start_height,
            relay: true,
        }
    }

    pub fn with_services(mut self, services: u64) -> Self {
        self.services = services;
        self
    }

    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }
}

impl Serializer for VersionMessage {
    fn write(&self, writer: &mut Writer) {
        writer.write_i32(self.version);
        writer.write_u64(self.services);
        writer.write_i64(self.timestamp);
        self.receiver.write(writer);
        self.sender.write(writer);
        writer.write_u64(self.nonce);
        writer.write_var_string(&self.user_agent);
        writer.write_i32(self.start_height);
        writer.write_bool(self.relay);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let version = reader.read_i32()?;
        let services = reader.read_u64()?;
        let timestamp = reader.read_i64()?;
        let receiver = NetAddress::read(reader)?;
        let sender = NetAddress::read(reader)?;
        let nonce = reader.read_u64()?;
        let user_agent = reader.read_var_string()?;
        if user_agent.len() > MAX_USER_AGENT_LENGTH {
            return Err(ReaderError::SizeTooLarge(user_agent.len() as u64));
        }
        let start_height = reader.read_i32()?;
        // Relay flag is optional for old peers
        let relay = if reader.size() > 0 {
            reader.read_bool()?
        } else {
            true
        };

        Ok(Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_address_ipv4_mapping() {
        let address: SocketAddr = "127.0.0.1:18444".parse().unwrap();
        let net = NetAddress::new(address, NODE_NETWORK);
        assert_eq!(&net.ip[10..12], &[0xff, 0xff]);
        assert_eq!(net.socket_addr(), address);
        let bytes = net.to_bytes();
        // Big-endian port
        assert_eq!(&bytes[24..], &[0x48, 0x2c]);
    }

    #[test]
    fn test_version_without_relay_flag() {
        let message = VersionMessage::new("127.0.0.1:18444".parse().unwrap(), 7, 0);
        let mut bytes = message.to_bytes();
        bytes.pop();
        let decoded = VersionMessage::from_bytes(&bytes).unwrap();
        assert!(decoded.relay);
        assert_eq!(decoded.nonce, 7);
    }
}
