//! Requested vs. returned service sets, compared by `(user_id, port)`.

use std::{collections::HashSet, fmt};

use ssmgr_process::ShadowsocksService;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDiff {
    /// Requested but not returned.
    pub missing: Vec<ShadowsocksService>,
    /// Returned but never requested.
    pub unexpected: Vec<ShadowsocksService>,
}

impl ServiceDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

fn describe(list: &[ShadowsocksService]) -> String {
    list.iter()
        .map(|s| format!("{}:{}", s.user_id, s.port))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for ServiceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing [{}]", describe(&self.missing)));
        }
        if !self.unexpected.is_empty() {
            parts.push(format!("unexpected [{}]", describe(&self.unexpected)));
        }
        if parts.is_empty() {
            f.write_str("no difference")
        } else {
            f.write_str(&parts.join("; "))
        }
    }
}

impl std::error::Error for ServiceDiff {}

/// Entries of `left` whose key is absent from `right`, order kept, keys deduplicated.
fn subtract(left: &[ShadowsocksService], right: &[ShadowsocksService]) -> Vec<ShadowsocksService> {
    let right: HashSet<(&str, u16)> = right.iter().map(ShadowsocksService::key).collect();
    let mut seen = HashSet::new();
    left.iter()
        .filter(|s| !right.contains(&s.key()) && seen.insert(s.key()))
        .cloned()
        .collect()
}

pub fn compare(requested: &[ShadowsocksService], returned: &[ShadowsocksService]) -> ServiceDiff {
    ServiceDiff {
        missing: subtract(requested, returned),
        unexpected: subtract(returned, requested),
    }
}
