use std::process;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use shardline_cli::ShardlineCli;

fn main() {
    init_log();
    let cli = ShardlineCli::parse();
    if let Err(e) = shardline_cli::run(&cli) {
        eprintln!("{e:#}");
        process::exit(1);
    }
}

fn init_log() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("SHARDLINE_LOG")
                .from_env_lossy(),
        )
        .init();
}
