//! Normalized pool keys derived from destination addresses.

use std::fmt;
use vrpc_protocol::Address;

/// Pool key for a destination: the decimal context id for VSOCK or the IP
/// literal for TCP, plus the port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectKey {
    pub uri: String,
    pub port: u32,
}

impl From<&Address> for ConnectKey {
    fn from(addr: &Address) -> Self {
        match addr {
            Address::Vsock { context_id, port } => Self {
                uri: context_id.to_string(),
                port: *port,
            },
            Address::Tcp { ip, port } => Self {
                uri: ip.clone(),
                port: *port,
            },
        }
    }
}

impl fmt::Display for ConnectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uri, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_vsock() {
        let key = ConnectKey::from(&Address::vsock(3, 9000));
        assert_eq!(key.uri, "3");
        assert_eq!(key.port, 9000);
    }

    #[test]
    fn test_key_from_tcp() {
        let key = ConnectKey::from(&Address::tcp("127.0.0.1", 7070));
        assert_eq!(key.uri, "127.0.0.1");
        assert_eq!(key.port, 7070);
    }

    #[test]
    fn test_key_equality_is_componentwise() {
        let a = ConnectKey::from(&Address::tcp("10.0.0.1", 80));
        let b = ConnectKey::from(&Address::tcp("10.0.0.1", 80));
        let c = ConnectKey::from(&Address::tcp("10.0.0.1", 81));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
