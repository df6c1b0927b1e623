//! Geo enrichment contract
//!
//! Country and network-type enrichment is an external collaborator; the
//! checker only consumes this interface.

use crate::models::EstimatedType;

pub trait GeoEnricher: Send + Sync {
    /// Human-readable country for an IP, empty when unknown
    fn country(&self, ip: &str) -> String;

    /// Network-type guess for an IP
    fn estimated_type(&self, ip: &str) -> EstimatedType;
}

/// Enricher used when no geo database is wired in
pub struct NoopGeo;

impl GeoEnricher for NoopGeo {
    fn country(&self, _ip: &str) -> String {
        String::new()
    }

    fn estimated_type(&self, _ip: &str) -> EstimatedType {
        EstimatedType::Unknown
    }
}
