mod refract;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "refract",
    version,
    about = "Refract - protocol-translating Minecraft proxy"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses REFRACT_CONFIG; then auto-detects refract.toml > refract.yaml > refract.yml from CWD; then falls back to the OS default path (Linux: /etc/refract/refract.toml; others: user config dir).
    #[arg(long, env = "REFRACT_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    refract::run(cli.config).await
}
