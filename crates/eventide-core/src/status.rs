//! Status types the outer HTTP layer serves at `/health`, `/ready`, and
//! `/status`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of an instance, persisted in the instance registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Backfilling; public views still point at the previous instance.
    Historical,
    /// Backfill done, views cut over. `/ready` returns 200.
    Live,
    /// Shut down (cleanly or via lost heartbeat).
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::Live => "live",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "historical" => Some(Self::Historical),
            "live" => Some(Self::Live),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-chain progress, rendered at `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    /// Highest indexed block number.
    pub block: u64,
    /// Timestamp of that block.
    pub timestamp: u64,
    /// `true` once the chain has finished its backfill and follows the tip.
    pub is_realtime: bool,
}

/// A point-in-time view of the engine for the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// `/health` is 200 for the whole process lifetime; this is here so a
    /// snapshot is self-describing.
    pub healthy: bool,
    /// `/ready` is 200 iff the instance is live.
    pub ready: bool,
    pub instance: InstanceStatus,
    /// Network name → progress.
    pub chains: HashMap<String, ChainStatus>,
}

impl StatusSnapshot {
    pub fn starting(networks: impl IntoIterator<Item = String>) -> Self {
        Self {
            healthy: true,
            ready: false,
            instance: InstanceStatus::Historical,
            chains: networks
                .into_iter()
                .map(|n| {
                    (
                        n,
                        ChainStatus {
                            block: 0,
                            timestamp: 0,
                            is_realtime: false,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for s in [
            InstanceStatus::Historical,
            InstanceStatus::Live,
            InstanceStatus::Stopped,
        ] {
            assert_eq!(InstanceStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(InstanceStatus::parse("zombie"), None);
    }

    #[test]
    fn snapshot_serializes_for_http() {
        let mut snap = StatusSnapshot::starting(["mainnet".to_string()]);
        snap.chains.insert(
            "mainnet".into(),
            ChainStatus {
                block: 19_000_000,
                timestamp: 1_700_000_000,
                is_realtime: true,
            },
        );
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["chains"]["mainnet"]["block"], 19_000_000);
        assert_eq!(json["instance"], "historical");
    }
}
