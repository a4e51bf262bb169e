use std::net::SocketAddr;

use kadmium::dht::Dht;
use kadmium::DhtConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let bind_addr = args.next().unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let seeds: Vec<SocketAddr> = args.filter_map(|a| a.parse().ok()).collect();

    let dht = Dht::start(&bind_addr, DhtConfig::default()).await?;
    if !seeds.is_empty() {
        dht.bootstrap(seeds).await?;
    }

    tokio::signal::ctrl_c().await?;
    dht.stop().await?;
    Ok(())
}
