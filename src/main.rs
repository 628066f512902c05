use std::panic;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::core::judge::Judge;
use crate::native::executor::NativeSandbox;

mod config;
mod core;
mod intake;
mod models;
mod native;
mod pipeline;

#[cfg(test)]
mod stubs;

#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    set_panic_hook();

    let config = Arc::new(Config::from_env()?);
    tracing::debug!(?config, "Loaded configuration");

    let sandbox = Arc::new(NativeSandbox::new(
        &config.scratch_root,
        config.isolation,
        &config.sandbox_paths,
    )?);
    let judge = Arc::new(Judge::new(config.clone(), sandbox));

    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        max_concurrent_sandboxes = config.max_concurrent_sandboxes,
        "Judge listening"
    );
    let server = pipeline::serve(listener, config, judge.clone());

    tokio::select! {
        result = server => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutting down");
            judge.close();
        }
    }

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
