// PCN host proxy: serves accelerator socket calls on the host network stack.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pcn_proxy::{config, Cli, Proxy};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = config::load(&cli)?;
    let proxy = Proxy::start(cfg)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pcn-proxy-ctl")
        .build()
        .context("building runtime")?;
    let served = rt.block_on(async {
        let listener = proxy.listen().await?;
        tokio::select! {
            r = proxy.clone().serve(listener) => r,
            r = shutdown_signal() => {
                log::info!("shutdown requested");
                r
            }
        }
    });
    proxy.shutdown();
    rt.shutdown_timeout(Duration::from_secs(2));
    served
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r.context("waiting for Ctrl+C")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
