use anyhow::{Context, Result, bail};
use log::{info, warn};
use meridian_config::Config;
use meridian_core::Block;
use meridian_node::{LocalNetwork, NodeSettings};
use serde_json::json;
use std::time::Duration;

const SETTLE_LIMIT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load().context("loading configuration")?;

    env_logger::Builder::from_default_env()
        .parse_filters(&cfg.log_level)
        .init();

    info!("Meridian demo network starting with {} nodes", cfg.peers);

    let genesis = Block::genesis(&cfg.genesis_address, cfg.genesis_amount)?;
    let settings = NodeSettings::from(&cfg);
    let net = LocalNetwork::new(cfg.peers.max(2), &genesis, &settings)?;

    // Each node mines on its own first; node i ends up at height i+1.
    for (i, node) in net.nodes().iter().enumerate() {
        for _ in 0..=i {
            node.mine_block()?;
        }
    }

    net.connect_line()?;
    if !net.settle(SETTLE_LIMIT).await {
        warn!("network did not settle after connecting");
    }

    let nodes = net.nodes();
    let (Some(payer), Some(payee)) = (nodes.last(), nodes.first()) else {
        bail!("demo needs at least two nodes");
    };
    match payer.create_transaction(&payee.address(), 1) {
        Ok(tx) => info!("{} paid {}: {}", payer.id(), payee.id(), tx.txid),
        Err(e) => warn!("{} could not pay: {}", payer.id(), e),
    }
    if !net.settle(SETTLE_LIMIT).await {
        warn!("transaction relay did not settle");
    }

    if let Some(miner) = nodes.get(nodes.len() / 2) {
        miner.mine_block()?;
    }
    if !net.settle(SETTLE_LIMIT).await {
        warn!("network did not settle after the final block");
    }

    let summary: Vec<_> = nodes
        .iter()
        .map(|n| {
            json!({
                "id": n.id(),
                "height": n.height(),
                "tip": n.get_latest_hash(),
                "mempool": n.get_mempool().len(),
                "balance": n.get_balance(&n.address()),
                "peers": n.peers(),
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!("converged: {}", net.converged());
    Ok(())
}
