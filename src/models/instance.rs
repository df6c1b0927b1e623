use serde::{Deserialize, Serialize};

/// Heartbeat payload identifying a running Magpie process and its port lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveInstance {
    pub id: String,
    pub name: String,
    pub region: String,
    pub port_start: u16,
    pub port_end: u16,
}

impl ActiveInstance {
    /// Repair missing fields from a partially filled heartbeat payload
    pub fn normalized(mut self, fallback_start: u16, fallback_end: u16) -> Self {
        self.id = self.id.trim().to_string();
        self.name = self.name.trim().to_string();
        self.region = self.region.trim().to_string();

        if self.name.is_empty() {
            self.name = self.id.clone();
        }
        if self.region.is_empty() {
            self.region = "Unknown".to_string();
        }
        if self.port_start == 0 || self.port_end == 0 || self.port_end < self.port_start {
            self.port_start = fallback_start;
            self.port_end = fallback_end;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_fills_gaps() {
        let instance = ActiveInstance {
            id: " edge-1 ".to_string(),
            name: "".to_string(),
            region: "  ".to_string(),
            port_start: 0,
            port_end: 0,
        }
        .normalized(20000, 20100);

        assert_eq!(instance.id, "edge-1");
        assert_eq!(instance.name, "edge-1");
        assert_eq!(instance.region, "Unknown");
        assert_eq!(instance.port_start, 20000);
        assert_eq!(instance.port_end, 20100);
    }

    #[test]
    fn test_normalized_keeps_valid_range() {
        let instance = ActiveInstance {
            id: "edge-2".to_string(),
            name: "edge-two".to_string(),
            region: "eu".to_string(),
            port_start: 30000,
            port_end: 30050,
        }
        .normalized(20000, 20100);

        assert_eq!(instance.port_start, 30000);
        assert_eq!(instance.port_end, 30050);
    }
}
