//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了日志和链路追踪的初始化。

use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// 遥测守卫，drop 时关闭全局 tracer provider
#[must_use = "dropping the guard shuts the tracer provider down"]
pub struct TelemetryGuard {
    installed: bool,
}

impl TelemetryGuard {
    /// 全局 subscriber 是否由本次调用安装
    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.installed {
            global::shutdown_tracer_provider();
        }
    }
}

/// 初始化日志与 OpenTelemetry 链路追踪
///
/// 安装由 `EnvFilter`、控制台 fmt 层和 `tracing-opentelemetry` 层组成的全局
/// subscriber。应在进程启动时调用一次；已有全局 subscriber 时不做任何修改。
///
/// # 参数
///
/// * `service_name` - tracer 名称
/// * `filter` - 过滤表达式，`RUST_LOG` 存在时优先使用环境变量
pub fn init_tracing(service_name: &str, filter: &str) -> TelemetryGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // 未配置导出器时 span 只在进程内流转
    let provider = SdkTracerProvider::builder().build();
    let tracer = provider.tracer(service_name.to_string());
    global::set_tracer_provider(provider);

    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let fmt = tracing_subscriber::fmt::layer().with_target(true);

    let installed = Registry::default()
        .with(env_filter)
        .with(fmt)
        .with(telemetry)
        .try_init()
        .is_ok();

    TelemetryGuard { installed }
}
