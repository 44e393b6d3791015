//! Network capability consumed by the container layer.
//!
//! The netlink/tc plumbing lives outside the core; containers only need
//! traffic classes keyed by their id and per-interface counters. Hosts
//! without managed networking plug in [`NoNetwork`].

use std::collections::HashMap;

use porto_common::PortoResult;

/// Per-interface traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    /// Transmitted bytes.
    pub tx_bytes: u64,
    /// Transmitted packets.
    pub tx_packets: u64,
    /// Dropped on egress.
    pub tx_drops: u64,
    /// Throttled by the class limit.
    pub overlimits: u64,
    /// Received bytes.
    pub rx_bytes: u64,
    /// Received packets.
    pub rx_packets: u64,
    /// Dropped on ingress.
    pub rx_drops: u64,
}

/// What the container layer needs from the network stack.
pub trait Network: Send + Sync {
    /// Create or update the traffic class of a container; the class
    /// minor is the container id.
    fn setup_class(
        &self,
        id: u32,
        guarantee: &HashMap<String, u64>,
        limit: &HashMap<String, u64>,
        priority: &HashMap<String, u64>,
    ) -> PortoResult<()>;

    /// Drop a container's traffic class.
    fn destroy_class(&self, id: u32) -> PortoResult<()>;

    /// Counters of a container's class per interface.
    fn class_stats(&self, id: u32) -> PortoResult<HashMap<String, NetStats>>;

    /// Periodic refresh, driven by the UpdateNetwork event.
    fn update(&self) -> PortoResult<()>;
}

/// No managed networking; every operation succeeds and reports zeros.
#[derive(Debug, Default)]
pub struct NoNetwork;

impl Network for NoNetwork {
    fn setup_class(
        &self,
        _id: u32,
        _guarantee: &HashMap<String, u64>,
        _limit: &HashMap<String, u64>,
        _priority: &HashMap<String, u64>,
    ) -> PortoResult<()> {
        Ok(())
    }

    fn destroy_class(&self, _id: u32) -> PortoResult<()> {
        Ok(())
    }

    fn class_stats(&self, _id: u32) -> PortoResult<HashMap<String, NetStats>> {
        Ok(HashMap::new())
    }

    fn update(&self) -> PortoResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_network_reports_nothing() {
        let net = NoNetwork;
        net.setup_class(1, &HashMap::new(), &HashMap::new(), &HashMap::new())
            .unwrap();
        assert!(net.class_stats(1).unwrap().is_empty());
        net.destroy_class(1).unwrap();
    }
}
