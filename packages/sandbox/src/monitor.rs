// ABOUTME: Advisory abuse monitor scanning sandbox processes for crypto-miner signatures
// ABOUTME: Read-only over stored sandboxes; runs periodically as a background task

use crate::runtime::ContainerRuntime;
use crate::storage::{SandboxStorage, StorageError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Substrings of process command lines treated as mining activity
pub const MINER_PATTERNS: &[&str] = &[
    "xmrig",
    "ethminer",
    "cgminer",
    "sgminer",
    "bfgminer",
    "minerd",
    "cpuminer",
    "cryptonight",
    "stratum",
    "pool",
];

/// A process in a sandbox that matched a miner pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbuseFlag {
    pub sandbox_id: String,
    pub owner_id: String,
    pub pattern: &'static str,
    pub process: String,
}

pub struct AbuseMonitor {
    storage: SandboxStorage,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
}

impl AbuseMonitor {
    pub fn new(
        storage: SandboxStorage,
        runtime: Arc<dyn ContainerRuntime>,
        interval: Duration,
    ) -> Self {
        Self {
            storage,
            runtime,
            interval,
        }
    }

    /// Check every stored sandbox once. Containers that cannot be inspected are skipped.
    pub async fn scan(&self) -> Result<Vec<AbuseFlag>, StorageError> {
        let sandboxes = self.storage.list_all().await?;
        debug!("Scanning {} sandboxes for abuse", sandboxes.len());

        let mut flags = Vec::new();
        for sandbox in sandboxes {
            let processes = match self.runtime.list_processes(&sandbox.runtime_ref).await {
                Ok(processes) => processes,
                Err(e) => {
                    warn!(
                        "Could not list processes of sandbox {}: {}",
                        sandbox.sandbox_id, e
                    );
                    continue;
                }
            };

            for process in processes {
                if let Some(pattern) = match_pattern(&process) {
                    warn!(
                        "Possible mining in sandbox {} (owner {}): {:?} matched {}",
                        sandbox.sandbox_id, sandbox.owner_id, process, pattern
                    );
                    flags.push(AbuseFlag {
                        sandbox_id: sandbox.sandbox_id.clone(),
                        owner_id: sandbox.owner_id.clone(),
                        pattern,
                        process,
                    });
                }
            }
        }

        Ok(flags)
    }

    /// Run `scan` every interval until the returned task is aborted
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Abuse monitor started (interval: {:?})", self.interval);
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match self.scan().await {
                    Ok(flags) if !flags.is_empty() => {
                        info!("Abuse scan flagged {} processes", flags.len())
                    }
                    Ok(_) => debug!("Abuse scan found nothing"),
                    Err(e) => error!("Abuse scan failed: {}", e),
                }
            }
        })
    }
}

fn match_pattern(process: &str) -> Option<&'static str> {
    let lowered = process.to_lowercase();
    MINER_PATTERNS
        .iter()
        .copied()
        .find(|pattern| lowered.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/usr/bin/xmrig --donate-level 1", Some("xmrig"))]
    #[case("./CPUMiner -a sha256d", Some("cpuminer"))]
    #[case("miner -o stratum+tcp://example.org:3333", Some("stratum"))]
    #[case("/sbin/init", None)]
    #[case("sshd: user1234 [priv]", None)]
    fn test_match_pattern(#[case] process: &str, #[case] expected: Option<&str>) {
        assert_eq!(match_pattern(process), expected);
    }
}
