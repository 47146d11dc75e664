use anyhow::Result;
use env_logger::Env;
use log::debug;

use nimotion_rust::cli::{build_cli, commands::handle_subcommands};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let level = if matches.get_flag("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();
    debug!("nimotion {}", nimotion_rust::VERSION);

    handle_subcommands(&matches).await
}
