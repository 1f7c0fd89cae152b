//! Exports an Int32 record through the C ABI, imports it, prints a preview
//! and releases it

use anyhow::Context;
use cdata_demo::{run, DemoConfig};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = DemoConfig::from_env().context("loading demo configuration")?;
    tracing::debug!(?config, "starting demo");

    let stdout = std::io::stdout();
    run(&config, &mut stdout.lock()).context("exporting and reading the record")?;
    Ok(())
}
