use std::collections::{BTreeMap, HashMap};

use ssmgr_process::ShadowsocksService;

/// What the controller believes is allocated on one node.
///
/// Only confirmed RPC results are written here.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct NodeMeta {
    opened_ports: BTreeMap<u16, ShadowsocksService>,
    stats: BTreeMap<u16, u64>,
}

impl NodeMeta {
    /// Records services as open with fresh zero counters.
    pub fn add_ports(&mut self, services: &[ShadowsocksService]) {
        for s in services {
            self.opened_ports.insert(s.port, s.clone());
            self.stats.insert(s.port, 0);
        }
    }

    pub fn remove_ports(&mut self, services: &[ShadowsocksService]) {
        for s in services {
            self.opened_ports.remove(&s.port);
            self.stats.remove(&s.port);
        }
    }

    /// Overwrites the reported ports, keeps the rest.
    pub fn set_stats(&mut self, traffics: &HashMap<u16, u64>) {
        for (port, traffic) in traffics {
            self.stats.insert(*port, *traffic);
        }
    }

    pub fn services(&self) -> Vec<ShadowsocksService> {
        self.opened_ports.values().cloned().collect()
    }

    pub fn stats(&self) -> &BTreeMap<u16, u64> {
        &self.stats
    }

    pub fn is_open(&self, port: u16) -> bool {
        self.opened_ports.contains_key(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_zeroes_counters_and_remove_drops_them() {
        let mut meta = NodeMeta::default();
        let a = ShadowsocksService::new("alice", 8388, "password123");
        let b = ShadowsocksService::new("bob", 8389, "password123");

        meta.set_stats(&HashMap::from([(8388, 500)]));
        meta.add_ports(&[a.clone(), b.clone()]);
        assert_eq!(meta.stats()[&8388], 0);
        assert_eq!(meta.services(), vec![a.clone(), b.clone()]);

        meta.remove_ports(&[a]);
        assert!(!meta.is_open(8388));
        assert!(!meta.stats().contains_key(&8388));
        assert!(meta.is_open(8389));
    }

    #[test]
    fn serializes_for_inspection() {
        let mut meta = NodeMeta::default();
        meta.add_ports(&[ShadowsocksService::new("alice", 8388, "password123")]);
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["opened_ports"]["8388"]["user_id"], "alice");
        assert_eq!(v["stats"]["8388"], 0);
    }

    #[test]
    fn set_stats_merges_per_port() {
        let mut meta = NodeMeta::default();
        meta.set_stats(&HashMap::from([(1, 10), (2, 20)]));
        meta.set_stats(&HashMap::from([(2, 25), (3, 30)]));
        assert_eq!(
            meta.stats().iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>(),
            vec![(1, 10), (2, 25), (3, 30)]
        );
    }
}
