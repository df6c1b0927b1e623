use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::user::CheckUser;

/// Upstream proxy protocol with its stable statistic id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl Protocol {
    /// All protocols, in statistic-id order
    pub const ALL: [Protocol; 4] = [
        Protocol::Http,
        Protocol::Https,
        Protocol::Socks4,
        Protocol::Socks5,
    ];

    /// Stable integer id used in statistic rows
    pub fn id(&self) -> i32 {
        match self {
            Protocol::Http => 1,
            Protocol::Https => 2,
            Protocol::Socks4 => 3,
            Protocol::Socks5 => 4,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(Protocol::Http),
            2 => Some(Protocol::Https),
            3 => Some(Protocol::Socks4),
            4 => Some(Protocol::Socks5),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            "socks4" | "socks4a" => Some(Protocol::Socks4),
            "socks5" => Some(Protocol::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, Protocol::Socks4 | Protocol::Socks5)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scheme used for the judge request during a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestScheme {
    Http,
    Https,
}

impl RequestScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestScheme::Http => "http",
            RequestScheme::Https => "https",
        }
    }

    /// Scheme to probe a protocol with. SOCKS protocols tunnel a plain or
    /// TLS judge request depending on the owning users' preference.
    pub fn for_protocol(protocol: Protocol, use_https_for_socks: bool) -> Self {
        match protocol {
            Protocol::Http => RequestScheme::Http,
            Protocol::Https => RequestScheme::Https,
            Protocol::Socks4 | Protocol::Socks5 => {
                if use_https_for_socks {
                    RequestScheme::Https
                } else {
                    RequestScheme::Http
                }
            }
        }
    }
}

impl std::fmt::Display for RequestScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Guess of the network a proxy terminates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatedType {
    Datacenter,
    Residential,
    Isp,
    #[default]
    Unknown,
}

impl EstimatedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimatedType::Datacenter => "datacenter",
            EstimatedType::Residential => "residential",
            EstimatedType::Isp => "isp",
            EstimatedType::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "datacenter" => EstimatedType::Datacenter,
            "residential" => EstimatedType::Residential,
            "isp" => EstimatedType::Isp,
            _ => EstimatedType::Unknown,
        }
    }
}

/// An upstream proxy. Identity is immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub id: i64,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub estimated_type: EstimatedType,
}

impl Proxy {
    /// `ip:port` form used for dialing
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn has_auth(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// Deduplication hash: SHA-256 over the lowercased identity tuple.
    ///
    /// Case differences in username/password would not distinguish real
    /// proxies, so the tuple is lowercased before hashing.
    pub fn dedup_hash(&self) -> [u8; 32] {
        let identity = format!(
            "{}|{}|{}|{}",
            self.ip, self.port, self.username, self.password
        )
        .to_lowercase();
        Sha256::digest(identity.as_bytes()).into()
    }

    /// Hex form of the dedup hash, used as the queue member key
    pub fn hash_hex(&self) -> String {
        let hash = self.dedup_hash();
        let mut out = String::with_capacity(64);
        for byte in hash {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

/// A proxy record as carried through the check queue, together with the
/// check preferences of its owning users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedProxy {
    #[serde(flatten)]
    pub proxy: Proxy,
    #[serde(default)]
    pub users: Vec<CheckUser>,
}

impl QueuedProxy {
    /// Largest timeout across owning users, in milliseconds
    pub fn max_timeout_ms(&self) -> u64 {
        self.users.iter().map(|u| u.timeout_ms as u64).max().unwrap_or(7500)
    }

    /// Largest retry count across owning users
    pub fn max_retries(&self) -> u8 {
        self.users.iter().map(|u| u.retries).max().unwrap_or(0)
    }
}

/// Parse a free-text proxy list into proxies.
///
/// Accepted line formats: `ip:port`, `user:pass@ip:port` and
/// `ip:port:user:pass`. Octets with leading zeros are repaired
/// (`010.1.1.1` parses as `10.1.1.1`); anything else is skipped.
pub fn parse_proxy_list(text: &str) -> Vec<Proxy> {
    let mut proxies = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let (mut username, mut password, host_part) = match line.rsplit_once('@') {
            Some((creds, host)) => match creds.split_once(':') {
                Some((user, pass)) => (user.trim().to_string(), pass.trim().to_string(), host),
                None => (String::new(), String::new(), host),
            },
            None => (String::new(), String::new(), line),
        };

        let fields: Vec<&str> = host_part.split(':').collect();
        if fields.len() < 2 {
            continue;
        }

        let ip = match normalize_ipv4(fields[0].trim()) {
            Some(ip) => ip,
            None => continue,
        };

        let port: u16 = match fields[1].trim().parse() {
            Ok(p) if p >= 1 => p,
            _ => continue,
        };

        // ip:port:user:pass form, only when no @-credentials were given
        if username.is_empty() && password.is_empty() && fields.len() >= 4 {
            username = fields[2].trim().to_string();
            password = fields[3..].join(":").trim().to_string();
        }

        proxies.push(Proxy {
            id: 0,
            ip,
            port,
            username,
            password,
            country: String::new(),
            estimated_type: EstimatedType::Unknown,
        });
    }

    proxies
}

fn normalize_ipv4(raw: &str) -> Option<String> {
    let mut octets = [0u8; 4];
    let mut parts = raw.split('.');

    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 {
            return None;
        }
        *octet = part.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }

    Some(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]).to_string())
}
