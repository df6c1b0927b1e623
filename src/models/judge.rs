use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::error::{MagpieError, Result};

use super::proxy::RequestScheme;

/// A judge endpoint: a URL whose response body echoes request headers.
///
/// The resolved IP is cached so checker transports can pin it when dialing,
/// keeping DNS anomalies from masking proxy failures.
#[derive(Debug)]
pub struct Judge {
    pub id: i64,
    pub url: Url,
    hostname: String,
    resolved_ip: RwLock<Option<IpAddr>>,
}

impl Judge {
    pub fn new(id: i64, full_string: &str) -> Result<Self> {
        let url = Url::parse(full_string)
            .map_err(|e| MagpieError::InvalidRequest(format!("invalid judge URL: {}", e)))?;

        let hostname = url
            .host_str()
            .ok_or_else(|| MagpieError::InvalidRequest("judge URL has no host".into()))?
            .to_string();

        Ok(Self {
            id,
            url,
            hostname,
            resolved_ip: RwLock::new(None),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Scheme the judge is probed with
    pub fn scheme(&self) -> RequestScheme {
        if self.url.scheme().eq_ignore_ascii_case("https") {
            RequestScheme::Https
        } else {
            RequestScheme::Http
        }
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// Request path including the query string
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    /// The cached resolved IP, if any
    pub fn ip(&self) -> Option<IpAddr> {
        *self.resolved_ip.read()
    }

    /// Resolve and cache the judge's IP. Called during setup and when the
    /// judge set changes; lookups between refreshes use the cached value.
    pub async fn update_ip(&self) -> Result<IpAddr> {
        let addr = format!("{}:{}", self.hostname, self.port());
        let resolved = tokio::net::lookup_host(&addr)
            .await?
            .next()
            .ok_or_else(|| {
                MagpieError::Internal(format!("judge hostname {} did not resolve", self.hostname))
            })?;

        debug!(judge_id = self.id, ip = %resolved.ip(), "Resolved judge IP");
        *self.resolved_ip.write() = Some(resolved.ip());
        Ok(resolved.ip())
    }

    /// Host:port to dial, preferring the pinned IP
    pub fn dial_addr(&self) -> String {
        match self.ip() {
            Some(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port()),
            Some(IpAddr::V4(ip)) => format!("{}:{}", ip, self.port()),
            None => format!("{}:{}", self.hostname, self.port()),
        }
    }
}

/// A judge paired with the per-user regex its responses are matched against
#[derive(Debug, Clone)]
pub struct JudgeEntry {
    pub judge: Arc<Judge>,
    pub regex: Regex,
}

impl JudgeEntry {
    pub fn new(judge: Arc<Judge>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| MagpieError::InvalidRequest(format!("invalid judge regex: {}", e)))?;
        Ok(Self { judge, regex })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_judge_parsing() {
        let judge = Judge::new(1, "http://judge.example.com/azenv.php").unwrap();
        assert_eq!(judge.hostname(), "judge.example.com");
        assert_eq!(judge.scheme(), RequestScheme::Http);
        assert_eq!(judge.port(), 80);
        assert_eq!(judge.path_and_query(), "/azenv.php");
        assert!(judge.ip().is_none());
    }

    #[test]
    fn test_judge_https_with_port_and_query() {
        let judge = Judge::new(2, "https://judge.example.com:8443/env?full=1").unwrap();
        assert_eq!(judge.scheme(), RequestScheme::Https);
        assert_eq!(judge.port(), 8443);
        assert_eq!(judge.path_and_query(), "/env?full=1");
    }

    #[test]
    fn test_judge_invalid_url() {
        assert!(Judge::new(3, "not a url").is_err());
        assert!(Judge::new(4, "mailto:nobody@example.com").is_err());
    }

    #[test]
    fn test_dial_addr_prefers_pinned_ip() {
        let judge = Judge::new(5, "http://judge.example.com/").unwrap();
        assert_eq!(judge.dial_addr(), "judge.example.com:80");

        *judge.resolved_ip.write() = Some("203.0.113.7".parse().unwrap());
        assert_eq!(judge.dial_addr(), "203.0.113.7:80");
    }

    #[test]
    fn test_judge_entry_regex_validation() {
        let judge = Arc::new(Judge::new(6, "http://judge.example.com/").unwrap());
        assert!(JudgeEntry::new(judge.clone(), "HTTP_HOST").is_ok());
        assert!(JudgeEntry::new(judge, "[unclosed").is_err());
    }
}
