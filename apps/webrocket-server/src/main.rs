mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info};
use webrocket::Context;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let tls: Option<(PathBuf, PathBuf)> = match (&cli.cert, &cli.key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        (None, None) => None,
        _ => anyhow::bail!("--cert and --key must be given together"),
    };

    let ctx = Arc::new(Context::new());
    ctx.set_storage_dir(&cli.storage_dir);
    if let Some(name) = &cli.node_name {
        ctx.set_node_name(name).context("invalid node name")?;
    }
    ctx.lock_node().context("failed to lock node")?;
    ctx.load().context("failed to load vhost configuration")?;
    ctx.generate_cookie(false)
        .context("failed to generate node cookie")?;
    info!(
        node = %ctx.node_name(),
        storage = %ctx.storage_dir().display(),
        "node initialized"
    );

    let backend = ctx
        .new_backend_endpoint(&cli.backend_addr)
        .context("failed to create backend endpoint")?;
    let websocket = ctx
        .new_websocket_endpoint(&cli.websocket_addr)
        .context("failed to create websocket endpoint")?;

    let mut backend_task = tokio::spawn({
        let endpoint = Arc::clone(&backend);
        let tls = tls.clone();
        async move {
            match tls {
                Some((cert, key)) => endpoint.listen_and_serve_tls(&cert, &key).await,
                None => endpoint.listen_and_serve().await,
            }
        }
    });
    let mut websocket_task = tokio::spawn({
        let endpoint = Arc::clone(&websocket);
        let tls = tls.clone();
        async move {
            match tls {
                Some((cert, key)) => endpoint.listen_and_serve_tls(&cert, &key).await,
                None => endpoint.listen_and_serve().await,
            }
        }
    });

    info!(
        websocket = %cli.websocket_addr,
        backend = %cli.backend_addr,
        version = webrocket::VERSION,
        "webrocket node running"
    );

    let result = tokio::select! {
        served = &mut backend_task => ("backend endpoint", served),
        served = &mut websocket_task => ("websocket endpoint", served),
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("failed to listen for shutdown signal")?;
            info!("interrupted, shutting down");
            ctx.kill();
            ctx.unlock_node();
            return Ok(());
        }
    };

    // An endpoint returning early is fatal; tear the rest down.
    ctx.kill();
    ctx.unlock_node();
    let (name, served) = result;
    match served {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            error!("{name} terminated: {err}");
            Err(err).context(format!("{name} failed"))
        }
        Err(join_err) => Err(join_err).context(format!("{name} task panicked")),
    }
}
