//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了配置检查命令的实现。

use crate::cli::CheckArgs;
use crate::config::Config;
use anyhow::{Context, Result};

pub fn execute(args: &CheckArgs) -> Result<()> {
    let config = Config::from_file(&args.path)
        .with_context(|| format!("invalid configuration '{}'", args.path.display()))?;

    println!("=== Configuration OK ===\n");
    let mut names: Vec<_> = config.caches.keys().collect();
    names.sort();
    for name in names {
        let cache = &config.caches[name];
        println!(
            "  {}: backplane={:?}, distributed_lock={:?}, stripes={}",
            name, cache.backplane.kind, cache.distributed_lock.kind, cache.local_lock.stripes
        );
    }
    Ok(())
}
