use clap::Parser;
use imaging_gateway::config::{Cli, Config};

#[derive(Parser, Debug)]
#[command(name = "imaging-gateway", version, about = "Medical imaging gateway data movement engine")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cli = Cli::new(args.config);
    let config = Config::from_file(&cli.config_path)?;
    imaging_gateway::run(config).await
}
