use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "webrocket-server", about = "WebRocket realtime message broker node", version)]
pub struct Cli {
    /// Address of the websocket (frontend) endpoint.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub websocket_addr: String,

    /// Address of the backend (worker) endpoint.
    #[arg(long, default_value = "0.0.0.0:8081")]
    pub backend_addr: String,

    /// Name of this node; defaults to the sanitized host name.
    #[arg(long)]
    pub node_name: Option<String>,

    /// Path to the server certificate (PEM). Enables TLS together with --key.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Path to the private key (PEM).
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Directory for the node cookie and vhost configuration.
    #[arg(long, default_value = "/var/lib/webrocket")]
    pub storage_dir: PathBuf,
}
