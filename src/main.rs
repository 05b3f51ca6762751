use forge::prelude::*;
use wa_outbox::{functions, logging};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let config = ForgeConfig::from_file("forge.toml")?;
    let mut builder = Forge::builder();

    let daemons = builder.daemon_registry_mut();
    daemons.register::<functions::OutboxDaemon>();

    builder.config(config).build()?.run().await
}
