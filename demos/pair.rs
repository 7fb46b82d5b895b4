//! Interactive pairing demo. Starts a node like `node.rs`, then reads
//! commands from stdin:
//!
//!   list              -- show known device ids and pair states
//!   pair <device-id>   -- send a pair request
//!   accept <device-id> -- accept an incoming request
//!   unpair <device-id> -- unpair an already-paired device

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use cosmic_connect_core::{CoreConfig, CoreContext, DeviceType, Observer, PairState, PluginRegistry};
use log::LevelFilter;

struct StdoutObserver;

impl Observer for StdoutObserver {
    fn on_device_discovered(&self, device_id: &str) {
        println!("discovered {device_id}");
    }

    fn on_device_pair_state_changed(&self, device_id: &str, state: PairState) {
        println!("{device_id} pair state -> {state:?}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cosmic_connect_core::logging::init_logging(LevelFilter::Warn);

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

    let stdin = io::stdin();
    print!("> ");
    io::stdout().flush().ok();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("list"), _) => {
                for device in ctx.registry.snapshot() {
                    println!("{} reachable={} state={:?}", device.id, device.is_reachable(), device.pair_state());
                }
            }
            (Some("pair"), Some(id)) => match ctx.registry.get(id) {
                Some(device) => device.request_pair().await,
                None => println!("unknown device {id}"),
            },
            (Some("accept"), Some(id)) => match ctx.registry.get(id) {
                Some(device) => device.accept_pair().await,
                None => println!("unknown device {id}"),
            },
            (Some("unpair"), Some(id)) => match ctx.registry.get(id) {
                Some(device) => device.unpair().await,
                None => println!("unknown device {id}"),
            },
            _ => println!("commands: list | pair <id> | accept <id> | unpair <id>"),
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    ctx.shutdown();
    Ok(())
}
