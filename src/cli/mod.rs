//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了CLI命令行接口。

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use crate::protocol::Action;

#[derive(Parser, Debug)]
#[command(name = "oxbackplane")]
#[command(author, version, about = "Diagnostics for the cache coordination layer", long_about = None)]
pub struct Cli {
    /// 日志过滤表达式
    #[arg(long, global = true, default_value = "warn")]
    pub log: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(name = "encode", about = "Encode an invalidation message as hex")]
    Encode(EncodeArgs),

    #[command(name = "decode", about = "Decode and validate a hex payload")]
    Decode(DecodeArgs),

    #[command(name = "check", about = "Validate a configuration file")]
    Check(CheckArgs),

    #[command(name = "listen", about = "Print messages received on a redis backplane channel")]
    Listen(ListenArgs),

    #[command(name = "publish", about = "Publish one message on a redis backplane channel")]
    Publish(PublishArgs),

    #[command(
        name = "metrics",
        about = "Run the cache nodes of a config file for a while and print their metrics"
    )]
    Metrics(MetricsArgs),
}

/// 命令行中的动作名称
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ActionArg {
    Set,
    Remove,
    Expire,
    Sentinel,
}

impl From<ActionArg> for Action {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Set => Action::EntrySet,
            ActionArg::Remove => Action::EntryRemove,
            ActionArg::Expire => Action::EntryExpire,
            ActionArg::Sentinel => Action::Sentinel,
        }
    }
}

#[derive(Parser, Debug)]
pub struct EncodeArgs {
    #[arg(short, long, help = "Source instance id")]
    pub source: String,

    #[arg(short, long, value_enum, help = "Invalidation action")]
    pub action: ActionArg,

    #[arg(short, long, default_value = "", help = "Cache key")]
    pub key: String,

    #[arg(short, long, help = "Timestamp in unix millis, defaults to now")]
    pub timestamp: Option<i64>,
}

#[derive(Parser, Debug)]
pub struct DecodeArgs {
    #[arg(help = "Hex encoded payload")]
    pub payload: String,
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[arg(help = "Path to a TOML configuration file")]
    pub path: std::path::PathBuf,
}

#[derive(Parser, Debug)]
pub struct BackplaneArgs {
    #[arg(short, long, default_value = "redis://127.0.0.1:6379", help = "Redis connection string")]
    pub url: String,

    #[arg(short, long, help = "Logical cache name")]
    pub cache: String,

    #[arg(short, long, help = "Channel prefix, defaults to the cache name")]
    pub prefix: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ListenArgs {
    #[command(flatten)]
    pub backplane: BackplaneArgs,

    #[arg(short = 'n', long, help = "Exit after this many messages")]
    pub count: Option<usize>,

    #[arg(long, help = "Print metrics before exiting")]
    pub metrics: bool,
}

#[derive(Parser, Debug)]
pub struct PublishArgs {
    #[command(flatten)]
    pub backplane: BackplaneArgs,

    #[arg(short, long, value_enum, help = "Invalidation action")]
    pub action: ActionArg,

    #[arg(short, long, default_value = "", help = "Cache key")]
    pub key: String,

    #[arg(short, long, help = "Source instance id, defaults to a random id")]
    pub source: Option<String>,
}

#[derive(Parser, Debug)]
pub struct MetricsArgs {
    #[arg(help = "Path to the TOML configuration file")]
    pub path: std::path::PathBuf,

    #[arg(short, long, default_value_t = 10, help = "Seconds to run before printing")]
    pub seconds: u64,

    #[arg(short, long, help = "Only show series for this cache")]
    pub cache: Option<String>,
}

mod check;
mod codec;
mod metrics;
mod redis;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = crate::telemetry::init_tracing("oxbackplane", &cli.log);

    match &cli.command {
        Commands::Encode(args) => codec::encode(args),
        Commands::Decode(args) => codec::decode(args),
        Commands::Check(args) => check::execute(args),
        Commands::Listen(args) => redis::listen(args).await,
        Commands::Publish(args) => redis::publish(args).await,
        Commands::Metrics(args) => metrics::execute(args).await,
    }
}
