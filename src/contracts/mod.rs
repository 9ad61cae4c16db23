// Contracts Module - read-only ABIs for the factory, pair and token contracts.
//
// Types must match the Solidity declarations exactly (uint112 reserves,
// uint32 timestamp); deviations cause silent decoding errors.

use ethers::prelude::abigen;

abigen!(
    IUniswapV2Factory,
    r#"[
        event PairCreated(address indexed token0, address indexed token1, address pair, uint256 pairIndex)
        function allPairsLength() external view returns (uint256)
        function allPairs(uint256 index) external view returns (address)
    ]"#
);

abigen!(
    IUniswapV2Pair,
    r#"[
        function token0() external view returns (address)
        function token1() external view returns (address)
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast)
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function symbol() external view returns (string)
        function decimals() external view returns (uint8)
        function totalSupply() external view returns (uint256)
    ]"#
);

// Minimal Ownable surface for the renounce check.
abigen!(
    IOwnable,
    r#"[
        function owner() external view returns (address)
    ]"#
);

/// keccak256("PairCreated(address,address,address,uint256)") - topic0 used by
/// the poll-mode log filter.
pub const PAIR_CREATED_SIGNATURE: &str =
    "0x0d3648bd0f6ba80134a33ba9275ac585d9d315f0ad8355cddefde31afa28d0e9";
