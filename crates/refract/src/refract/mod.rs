pub mod admin;
pub mod app;
pub mod auth;
pub mod chat;
pub mod config;
pub mod crypto;
pub mod hooks;
pub mod legacy;
pub mod logging;
pub mod login;
pub mod net;
pub mod packets;
pub mod proxy;
pub mod session;
pub mod status;
pub mod telemetry;
pub mod transfer;
pub mod translate;
pub mod version;
pub mod wire;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
