use serde::{Deserialize, Serialize};

use super::proxy::Protocol;

/// A tenant. Only the fields the runtime core consumes are modeled; account
/// management lives in the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub http_protocol: bool,
    pub https_protocol: bool,
    pub socks4_protocol: bool,
    pub socks5_protocol: bool,
    pub timeout_ms: u16,
    pub retries: u8,
    pub use_https_for_socks: bool,
}

impl User {
    /// Check preferences snapshot carried through the proxy queue
    pub fn check_prefs(&self) -> CheckUser {
        CheckUser {
            id: self.id,
            http: self.http_protocol,
            https: self.https_protocol,
            socks4: self.socks4_protocol,
            socks5: self.socks5_protocol,
            timeout_ms: self.timeout_ms,
            retries: self.retries,
            use_https_for_socks: self.use_https_for_socks,
        }
    }
}

/// Per-user check preferences serialized into queue records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckUser {
    pub id: i64,
    pub http: bool,
    pub https: bool,
    pub socks4: bool,
    pub socks5: bool,
    pub timeout_ms: u16,
    pub retries: u8,
    pub use_https_for_socks: bool,
}

impl CheckUser {
    /// Protocols this user wants checked
    pub fn enabled_protocols(&self) -> Vec<Protocol> {
        let mut protocols = Vec::with_capacity(4);
        if self.http {
            protocols.push(Protocol::Http);
        }
        if self.https {
            protocols.push(Protocol::Https);
        }
        if self.socks4 {
            protocols.push(Protocol::Socks4);
        }
        if self.socks5 {
            protocols.push(Protocol::Socks5);
        }
        protocols
    }

    pub fn protocol_enabled(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Http => self.http,
            Protocol::Https => self.https,
            Protocol::Socks4 => self.socks4,
            Protocol::Socks5 => self.socks5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_protocols() {
        let user = CheckUser {
            id: 1,
            http: true,
            https: false,
            socks4: false,
            socks5: true,
            timeout_ms: 7500,
            retries: 2,
            use_https_for_socks: true,
        };

        assert_eq!(
            user.enabled_protocols(),
            vec![Protocol::Http, Protocol::Socks5]
        );
        assert!(user.protocol_enabled(Protocol::Http));
        assert!(!user.protocol_enabled(Protocol::Https));
    }

    #[test]
    fn test_check_prefs_snapshot() {
        let user = User {
            id: 7,
            email: "tenant@example.com".to_string(),
            http_protocol: false,
            https_protocol: true,
            socks4_protocol: true,
            socks5_protocol: false,
            timeout_ms: 5000,
            retries: 1,
            use_https_for_socks: false,
        };

        let prefs = user.check_prefs();
        assert_eq!(prefs.id, 7);
        assert!(prefs.https);
        assert!(prefs.socks4);
        assert!(!prefs.use_https_for_socks);
        assert_eq!(prefs.timeout_ms, 5000);
    }
}
