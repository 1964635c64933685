use std::path::PathBuf;

/// Inspect sharded keys and database server configuration.
#[derive(clap::Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct ShardlineCli {
    #[command(subcommand)]
    pub command: ShardlineCommands,
    #[clap(flatten)]
    pub output: OutputArgs,
}

#[derive(clap::Subcommand, Clone, Debug)]
pub enum ShardlineCommands {
    /// Convert keys between their local, global and relative forms
    #[clap(aliases = &["i"])]
    Id {
        #[command(subcommand)]
        opt: IdOperation,
    },
    /// Read a servers file
    #[clap(aliases = &["srv", "s"])]
    Servers {
        #[command(subcommand)]
        opt: ServersOperation,
        /// Servers file; falls back to SHARDLINE_SERVERS_FILE
        #[clap(short, long)]
        file: Option<PathBuf>,
    },
}

#[derive(clap::Subcommand, Clone, Debug)]
pub enum IdOperation {
    /// Encode a local key of a shard
    Global {
        local: i64,
        #[clap(short, long)]
        shard: i64,
    },
    /// Strip the shard from a key
    Local { value: i64 },
    /// Show the shard embedded in a key
    Shard { value: i64 },
    /// Express a key stored on one shard as another shard sees it
    Relative {
        value: i64,
        #[clap(long)]
        source: i64,
        #[clap(long)]
        target: i64,
    },
}

#[derive(clap::Subcommand, Clone, Debug)]
pub enum ServersOperation {
    /// List the configured servers
    #[clap(aliases = &["ls"])]
    List,
    /// Show the resolved connection parameters of a server
    Config {
        server: String,
        #[clap(short, long, default_value = "primary")]
        environment: String,
    },
    /// Show the statements that would create a shard namespace
    Statements {
        server: String,
        name: String,
    },
}

#[derive(clap::Args, Clone, Debug)]
pub struct OutputArgs {
    #[clap(short = 'o', long = "output", value_enum, default_value_t = OutputFormat::Yaml)]
    pub format: OutputFormat,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
}
