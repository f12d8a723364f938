use std::{collections::HashSet, time::Duration};

use anyhow::{Context, bail};

const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveTarget {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    pub slaves: Vec<SlaveTarget>,
    pub token: Option<String>,
    pub rpc_timeout: Duration,
    pub poll_interval: Duration,
}

fn parse_ms(raw: Option<String>, default: u64, min: u64, max: u64) -> Duration {
    let ms = raw
        .as_deref()
        .unwrap_or_default()
        .trim()
        .parse::<u64>()
        .ok()
        .unwrap_or(default)
        .clamp(min, max);
    Duration::from_millis(ms)
}

fn normalize_url(raw: &str) -> String {
    if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    }
}

/// `name=url` or a bare `url`, comma separated.
pub fn parse_slaves(raw: &str) -> anyhow::Result<Vec<SlaveTarget>> {
    let mut out = Vec::new();
    let mut names = HashSet::new();

    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, url) = match part.split_once('=') {
            Some((name, url)) => (name.trim().to_string(), url.trim()),
            None => (part.to_string(), part),
        };
        if name.is_empty() || url.is_empty() {
            bail!("invalid slave entry {part:?}");
        }
        if !names.insert(name.clone()) {
            bail!("duplicate slave name {name:?}");
        }
        out.push(SlaveTarget {
            name,
            url: normalize_url(url),
        });
    }
    Ok(out)
}

impl ControlConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_env(|k| std::env::var(k).ok())
    }

    pub fn from_env(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let slaves = parse_slaves(&get("SSMGR_SLAVES").unwrap_or_default())
            .context("invalid SSMGR_SLAVES")?;
        let token = get("SSMGR_TOKEN")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Ok(Self {
            slaves,
            token,
            rpc_timeout: parse_ms(get("SSMGR_RPC_TIMEOUT_MS"), DEFAULT_RPC_TIMEOUT_MS, 1000, 600_000),
            poll_interval: parse_ms(
                get("SSMGR_POLL_INTERVAL_MS"),
                DEFAULT_POLL_INTERVAL_MS,
                1000,
                3_600_000,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let c = ControlConfig::from_env(env(&[])).unwrap();
        assert!(c.slaves.is_empty());
        assert_eq!(c.token, None);
        assert_eq!(c.rpc_timeout, Duration::from_secs(30));
        assert_eq!(c.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn parses_named_and_bare_slaves() {
        let slaves = parse_slaves(" tokyo=http://10.0.0.1:50051 , 10.0.0.2:50051,,").unwrap();
        assert_eq!(
            slaves,
            vec![
                SlaveTarget {
                    name: "tokyo".to_string(),
                    url: "http://10.0.0.1:50051".to_string(),
                },
                SlaveTarget {
                    name: "10.0.0.2:50051".to_string(),
                    url: "http://10.0.0.2:50051".to_string(),
                },
            ]
        );
    }

    #[test]
    fn rejects_duplicate_and_empty_entries() {
        assert!(parse_slaves("a=http://x:1,a=http://y:1").is_err());
        assert!(parse_slaves("=http://x:1").is_err());
        assert!(parse_slaves("a=").is_err());
    }

    #[test]
    fn clamps_timeouts_and_reads_token() {
        let c = ControlConfig::from_env(env(&[
            ("SSMGR_TOKEN", " s3cret "),
            ("SSMGR_RPC_TIMEOUT_MS", "5"),
            ("SSMGR_POLL_INTERVAL_MS", "junk"),
        ]))
        .unwrap();
        assert_eq!(c.token.as_deref(), Some("s3cret"));
        assert_eq!(c.rpc_timeout, Duration::from_millis(1000));
        assert_eq!(c.poll_interval, Duration::from_secs(30));
    }
}
