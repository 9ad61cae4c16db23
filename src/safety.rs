// Token safety probe - best-effort checks on the non-base token of a new
// pair. Every field degrades to None independently; a safety outage must
// never block an alert.

use crate::contracts::IOwnable;
use crate::explorer::ExplorerClient;
use crate::rpc_pool::RpcEndpointPool;
use ethers::types::Address;
use log::debug;
use std::sync::Arc;

/// `None` means the check could not be performed, not that it failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyReport {
    pub verified: Option<bool>,
    pub owner_renounced: Option<bool>,
}

pub struct SafetyChecker {
    pool: Arc<RpcEndpointPool>,
    explorer: Option<Arc<ExplorerClient>>,
}

impl SafetyChecker {
    pub fn new(pool: Arc<RpcEndpointPool>, explorer: Option<Arc<ExplorerClient>>) -> Self {
        Self { pool, explorer }
    }

    pub async fn check(&self, token: Address) -> SafetyReport {
        let verified = match &self.explorer {
            Some(explorer) => match explorer.is_verified(token).await {
                Ok(v) => Some(v),
                Err(e) => {
                    debug!("[safety] Verification lookup failed for {:#x}: {}", token, e);
                    None
                }
            },
            None => None,
        };

        let owner_renounced = match self.owner_of(token).await {
            Ok(owner) => Some(owner == Address::zero()),
            Err(e) => {
                // Most tokens without Ownable revert here; that is expected.
                debug!("[safety] owner() lookup failed for {:#x}: {}", token, e);
                None
            }
        };

        SafetyReport {
            verified,
            owner_renounced,
        }
    }

    async fn owner_of(&self, token: Address) -> anyhow::Result<Address> {
        self.pool
            .execute_with_failover("token_owner", |provider, _url| async move {
                let contract = IOwnable::new(token, provider);
                Ok(contract.owner().call().await?)
            })
            .await
    }
}
