//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了指标查询命令的实现：按配置启动全部节点，运行一段时间后
//! 输出本进程收集到的协调层指标。

use crate::cli::MetricsArgs;
use crate::config::Config;
use crate::error::Result as CacheResult;
use crate::manager::CacheRegistry;
use crate::metrics::get_metrics_string;
use crate::protocol::InvalidationMessage;
use crate::sync::InvalidationHandler;
use crate::utils::redaction::redact_cache_key;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 只记录日志的失效处理器
struct LoggingHandler {
    cache_name: String,
}

#[async_trait]
impl InvalidationHandler for LoggingHandler {
    async fn apply(&self, message: &InvalidationMessage) -> CacheResult<()> {
        info!(
            cache = %self.cache_name,
            source = %message.source_id(),
            action = %message.action(),
            key = %redact_cache_key(message.cache_key()),
            "invalidation received"
        );
        Ok(())
    }
}

pub async fn execute(args: &MetricsArgs) -> Result<()> {
    let config = Config::from_file(&args.path)
        .with_context(|| format!("invalid configuration '{}'", args.path.display()))?;
    if !config.global.enable_metrics {
        eprintln!("warning: enable_metrics is false in this configuration, counters stay empty");
    }

    let handlers: HashMap<String, Arc<dyn InvalidationHandler>> = config
        .caches
        .keys()
        .map(|name| {
            let handler: Arc<dyn InvalidationHandler> = Arc::new(LoggingHandler {
                cache_name: name.clone(),
            });
            (name.clone(), handler)
        })
        .collect();

    let registry = CacheRegistry::new();
    registry.init(&config, handlers).await?;
    eprintln!(
        "running {} cache node(s) for {}s (ctrl-c to stop early)",
        registry.len(),
        args.seconds
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(args.seconds)) => {}
    }
    registry.shutdown_all().await?;

    print!("{}", filter_series(&get_metrics_string(), args.cache.as_deref()));
    Ok(())
}

/// 只保留指定缓存的序列，注释行始终保留
pub(crate) fn filter_series(rendered: &str, cache: Option<&str>) -> String {
    let Some(cache) = cache else {
        return rendered.to_string();
    };
    let label = format!("cache=\"{}\"", cache);
    rendered
        .lines()
        .filter(|line| line.starts_with('#') || line.contains(&label))
        .map(|line| format!("{}\n", line))
        .collect()
}
