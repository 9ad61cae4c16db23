// Known base-token registry. A pair can only be valued when at least one of
// its sides appears here; everything else is "cannot value this side".

use crate::settings::TokenSettings;
use anyhow::{Context, Result};
use ethers::types::Address;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Reference data needed to resolve a dynamic price upstream.
#[derive(Debug, Clone)]
pub struct PriceRef {
    pub address: Address,
    pub symbol: String,
    /// CoinGecko asset id for the simple-price endpoint.
    pub coingecko_id: String,
    /// Exchange ticker symbol, e.g. BNBUSDT.
    pub ticker: String,
}

/// Pricing strategy for a known token. Pegged assets short-circuit with a
/// fixed value; everything else goes through the oracle cascade.
#[derive(Debug, Clone)]
pub enum Pricing {
    Fixed(Decimal),
    Dynamic(PriceRef),
}

#[derive(Debug, Clone)]
pub struct KnownToken {
    pub symbol: String,
    pub decimals: u32,
    pub pricing: Pricing,
}

/// Immutable after startup; lookups are case-insensitive on the address.
pub struct TokenRegistry {
    tokens: HashMap<Address, KnownToken>,
}

impl TokenRegistry {
    pub fn from_settings(settings: &TokenSettings) -> Result<Self> {
        let mut tokens = HashMap::new();

        let native = &settings.wrapped_native;
        let native_addr: Address = native
            .address
            .parse()
            .with_context(|| format!("invalid wrapped-native address {}", native.address))?;
        tokens.insert(
            native_addr,
            KnownToken {
                symbol: native.symbol.clone(),
                decimals: native.decimals,
                pricing: Pricing::Dynamic(PriceRef {
                    address: native_addr,
                    symbol: native.symbol.clone(),
                    coingecko_id: native.coingecko_id.clone(),
                    ticker: native.ticker.clone(),
                }),
            },
        );

        for stable in &settings.stables {
            let addr: Address = stable
                .address
                .parse()
                .with_context(|| format!("invalid stable address {}", stable.address))?;
            tokens.insert(
                addr,
                KnownToken {
                    symbol: stable.symbol.clone(),
                    decimals: stable.decimals,
                    pricing: Pricing::Fixed(Decimal::ONE),
                },
            );
        }

        Ok(Self { tokens })
    }

    /// Address parsing via `ethers` already normalizes case, so a plain map
    /// lookup gives the case-insensitive semantics.
    pub fn get(&self, address: &Address) -> Option<&KnownToken> {
        self.tokens.get(address)
    }

    pub fn is_known(&self, address: &Address) -> bool {
        self.tokens.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TokenSettings;

    #[test]
    fn builds_registry_from_default_settings() {
        let registry = TokenRegistry::from_settings(&TokenSettings::default()).unwrap();
        // wrapped native + three stables
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = TokenRegistry::from_settings(&TokenSettings::default()).unwrap();
        let lower: Address = "0xbb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c".parse().unwrap();
        let mixed: Address = "0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c".parse().unwrap();
        assert!(registry.is_known(&lower));
        assert!(registry.is_known(&mixed));
    }

    #[test]
    fn stables_carry_fixed_price() {
        let registry = TokenRegistry::from_settings(&TokenSettings::default()).unwrap();
        let busd: Address = "0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56".parse().unwrap();
        match &registry.get(&busd).unwrap().pricing {
            Pricing::Fixed(p) => assert_eq!(*p, Decimal::ONE),
            Pricing::Dynamic(_) => panic!("stable should be fixed-price"),
        }
    }
}
