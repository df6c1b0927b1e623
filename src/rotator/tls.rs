//! Rotator TLS identity
//!
//! One self-signed ECDSA P-256 certificate is generated per process and
//! shared by every QUIC/HTTP3 listener. TLS 1.3 only, ALPN "h3".

use std::sync::{Arc, OnceLock};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::{MagpieError, Result};

pub fn rotator_tls_config() -> Result<Arc<rustls::ServerConfig>> {
    static CONFIG: OnceLock<std::result::Result<Arc<rustls::ServerConfig>, String>> =
        OnceLock::new();

    CONFIG
        .get_or_init(|| build_config().map_err(|e| e.to_string()))
        .clone()
        .map_err(MagpieError::Crypto)
}

fn build_config() -> Result<Arc<rustls::ServerConfig>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| MagpieError::Crypto(format!("certificate generation failed: {}", e)))?;

    let cert_der = CertificateDer::from(certified.cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    let mut config =
        rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| MagpieError::Crypto(format!("TLS config failed: {}", e)))?;

    config.alpn_protocols = vec![b"h3".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_cached_per_process() {
        let a = rotator_tls_config().unwrap();
        let b = rotator_tls_config().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_config_advertises_h3() {
        let config = rotator_tls_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h3".to_vec()]);
    }
}
