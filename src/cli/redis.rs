//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了Redis背板诊断命令的实现。

use crate::backplane::{Backplane, BackplaneListener, BackplaneOptions, RedisBackplane};
use crate::cli::{BackplaneArgs, ListenArgs, PublishArgs};
use crate::config::{BackplaneConfig, BackplaneKind, RedisConfig};
use crate::metrics::get_metrics_string;
use crate::protocol::InvalidationMessage;
use crate::sync::TimestampSource;
use crate::utils::generate_unique_name;
use anyhow::{bail, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn backplane(args: &BackplaneArgs, instance_id: &str) -> Result<RedisBackplane> {
    let mut options = BackplaneOptions::new(&args.cache, instance_id);
    if let Some(prefix) = &args.prefix {
        options = options.with_channel_prefix(prefix);
    }
    let config = BackplaneConfig {
        kind: BackplaneKind::Redis,
        redis: Some(RedisConfig {
            connection_string: SecretString::new(args.url.clone().into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(RedisBackplane::new(options, &config)?)
}

enum Event {
    Connected(bool),
    Message(InvalidationMessage),
}

struct PrintListener(mpsc::UnboundedSender<Event>);

#[async_trait]
impl BackplaneListener for PrintListener {
    async fn on_message(&self, message: InvalidationMessage) {
        let _ = self.0.send(Event::Message(message));
    }

    async fn on_connect(&self, is_reconnection: bool) {
        let _ = self.0.send(Event::Connected(is_reconnection));
    }
}

pub async fn listen(args: &ListenArgs) -> Result<()> {
    let instance_id = generate_unique_name("oxbackplane-listen");
    let backplane = backplane(&args.backplane, &instance_id)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    backplane.subscribe(Arc::new(PrintListener(tx))).await?;
    println!("listening on {} (ctrl-c to stop)", backplane.channel());

    let mut received = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(Event::Connected(true)) => println!("-- reconnected"),
                Some(Event::Connected(false)) => println!("-- connected"),
                Some(Event::Message(message)) => {
                    received += 1;
                    println!(
                        "{} {} {} {}",
                        message.timestamp(),
                        message.source_id(),
                        message.action(),
                        message.cache_key()
                    );
                    if args.count.is_some_and(|count| received >= count) {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    backplane.unsubscribe().await?;
    if args.metrics {
        print!("{}", get_metrics_string());
    }
    Ok(())
}

pub async fn publish(args: &PublishArgs) -> Result<()> {
    let instance_id = args
        .source
        .clone()
        .unwrap_or_else(|| generate_unique_name("oxbackplane-publish"));
    let backplane = backplane(&args.backplane, &instance_id)?;
    let message = InvalidationMessage::new(
        instance_id,
        TimestampSource::new().now(),
        args.action.into(),
        &args.key,
    );
    if !message.is_valid() {
        bail!("message is not valid: {:?}", message);
    }
    backplane.publish(&message, &CancellationToken::new()).await?;
    println!("published to {}", backplane.channel());
    Ok(())
}
