//! Stands up a full connectivity node: loads (or creates) the local
//! identity, starts discovery + the link provider, and logs every
//! observer callback to stdout. Run two copies on the same LAN segment
//! and they will discover, connect, and sit `Unpaired` until one side
//! calls the pairing demo (`cargo run --example pair -- <device-id>`).

use std::sync::Arc;

use cosmic_connect_core::{CoreConfig, CoreContext, DeviceType, Observer, PairState, PluginRegistry};
use log::LevelFilter;

struct StdoutObserver;

impl Observer for StdoutObserver {
    fn on_device_discovered(&self, device_id: &str) {
        println!("discovered {device_id}");
    }

    fn on_device_reachability_changed(&self, device_id: &str, reachable: bool) {
        println!("{device_id} reachable={reachable}");
    }

    fn on_device_pair_state_changed(&self, device_id: &str, state: PairState) {
        println!("{device_id} pair state -> {state:?}");
    }

    fn on_device_plugins_changed(&self, device_id: &str) {
        println!("{device_id} active plugins changed");
    }

    fn on_pair_violation(&self, device_id: &str) {
        eprintln!("WARNING: {device_id} presented an unpinned certificate");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cosmic_connect_core::logging::init_logging(LevelFilter::Info);

    let data_dir = CoreConfig::default_data_dir();
    let config = CoreConfig::load_from_dir(&data_dir)?;
    let identity = Arc::new(cosmic_connect_core::IdentityStore::init(&data_dir, &config.device_name)?);

    println!("local device id: {}", identity.device_id());

    let ctx = CoreContext::new(
        identity,
        config,
        DeviceType::Desktop,
        PluginRegistry::new(),
        Arc::new(StdoutObserver),
    );
    ctx.run().await?;

    tokio::signal::ctrl_c().await?;
    ctx.shutdown();
    Ok(())
}
