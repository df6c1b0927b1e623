//! Judge response classification

use std::sync::OnceLock;

use regex::Regex;

use crate::models::AnonymityLevel;

fn ip_regex() -> &'static Regex {
    static IP_REGEX: OnceLock<Regex> = OnceLock::new();
    IP_REGEX.get_or_init(|| {
        Regex::new(
            r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b|\b(?:[A-Fa-f0-9]{1,4}:){7}[A-Fa-f0-9]{1,4}\b",
        )
        .expect("static regex")
    })
}

/// IPv4 and IPv6 addresses appearing in a string, in order
pub fn find_ips(input: &str) -> impl Iterator<Item = &str> {
    ip_regex().find_iter(input).map(|m| m.as_str())
}

/// Classify an alive proxy from the judge response body.
///
/// Transparent when an address extracted from the body equals the
/// instance's public IP; anonymous when any configured proxy header name
/// shows up; elite otherwise.
pub fn anonymity_level(body: &str, public_ip: &str, proxy_headers: &[String]) -> AnonymityLevel {
    if !public_ip.is_empty() && find_ips(body).any(|ip| ip == public_ip) {
        return AnonymityLevel::Transparent;
    }

    for header in proxy_headers {
        if !header.is_empty() && body.contains(header.as_str()) {
            return AnonymityLevel::Anonymous;
        }
    }

    AnonymityLevel::Elite
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> Vec<String> {
        vec!["X-Forwarded-For".to_string(), "Via".to_string()]
    }

    #[test]
    fn test_find_ips() {
        let body = "REMOTE_ADDR = 203.0.113.9\nX-Forwarded-For: 10.0.0.1";
        let found: Vec<&str> = find_ips(body).collect();
        assert_eq!(found, vec!["203.0.113.9", "10.0.0.1"]);

        assert_eq!(
            find_ips("addr 2001:0db8:0000:0000:0000:0000:0000:0001 end").next(),
            Some("2001:0db8:0000:0000:0000:0000:0000:0001")
        );
        assert_eq!(find_ips("no address here").next(), None);
    }

    #[test]
    fn test_transparent_when_public_ip_leaks() {
        let body = "REMOTE_ADDR = 198.51.100.4\nX-Forwarded-For: 198.51.100.4";
        assert_eq!(
            anonymity_level(body, "198.51.100.4", &headers()),
            AnonymityLevel::Transparent
        );
    }

    #[test]
    fn test_transparent_requires_exact_address_match() {
        // A longer address that merely contains the public IP as a prefix
        // is not a leak.
        let body = "REMOTE_ADDR = 198.51.100.45";
        assert_eq!(
            anonymity_level(body, "198.51.100.4", &[]),
            AnonymityLevel::Elite
        );
    }

    #[test]
    fn test_anonymous_when_proxy_headers_present() {
        let body = "HTTP_HOST = judge\nX-Forwarded-For: 10.0.0.1";
        assert_eq!(
            anonymity_level(body, "198.51.100.4", &headers()),
            AnonymityLevel::Anonymous
        );
    }

    #[test]
    fn test_elite_when_clean() {
        let body = "HTTP_HOST = judge\nHTTP_ACCEPT = */*";
        assert_eq!(
            anonymity_level(body, "198.51.100.4", &headers()),
            AnonymityLevel::Elite
        );
    }

    #[test]
    fn test_empty_public_ip_never_transparent() {
        let body = "REMOTE_ADDR = 198.51.100.4";
        assert_eq!(
            anonymity_level(body, "", &headers()),
            AnonymityLevel::Elite
        );
    }
}
