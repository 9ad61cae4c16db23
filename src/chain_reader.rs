// On-chain reads for pair classification, routed through the RPC pool so
// every call inherits failover and health accounting.

use crate::classifier::{PairState, PairStateReader};
use crate::contracts::IUniswapV2Pair;
use crate::rpc_pool::RpcEndpointPool;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::types::Address;
use std::sync::Arc;

pub struct RpcPairReader {
    pool: Arc<RpcEndpointPool>,
}

impl RpcPairReader {
    pub fn new(pool: Arc<RpcEndpointPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PairStateReader for RpcPairReader {
    async fn pair_state(&self, pair: Address) -> Result<PairState> {
        self.pool
            .execute_with_failover("pair_state", |provider, _url| async move {
                let contract = IUniswapV2Pair::new(pair, provider);
                let token0 = contract
                    .token_0()
                    .call()
                    .await
                    .context("token0() call failed")?;
                let token1 = contract
                    .token_1()
                    .call()
                    .await
                    .context("token1() call failed")?;
                let (reserve0, reserve1, _ts) = contract
                    .get_reserves()
                    .call()
                    .await
                    .context("getReserves() call failed")?;
                Ok(PairState {
                    token0,
                    token1,
                    reserve0,
                    reserve1,
                })
            })
            .await
    }
}
