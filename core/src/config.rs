// Consensus constants shared by every node of a Meridian network

/// Parent hash written into the genesis header.
pub const GENESIS_PARENT_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Fixed genesis timestamp so that independently started nodes agree on genesis.
pub const GENESIS_TIMESTAMP: i64 = 1_700_000_000;

/// Amount issued by the coinbase of a locally produced block.
pub const BLOCK_REWARD: u64 = 1;
