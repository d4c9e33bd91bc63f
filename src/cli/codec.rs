//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了线协议编解码命令的实现。

use crate::cli::{DecodeArgs, EncodeArgs};
use crate::protocol::{self, InvalidationMessage};
use crate::sync::TimestampSource;
use anyhow::{bail, Context, Result};

pub fn encode(args: &EncodeArgs) -> Result<()> {
    let timestamp = args
        .timestamp
        .unwrap_or_else(|| TimestampSource::new().now());
    let message = InvalidationMessage::new(&args.source, timestamp, args.action.into(), &args.key);
    if !message.is_valid() {
        bail!("message is not valid: {:?}", message);
    }
    println!("{}", hex::encode(protocol::encode(&message)));
    Ok(())
}

pub fn decode(args: &DecodeArgs) -> Result<()> {
    let bytes = hex::decode(args.payload.trim()).context("payload is not valid hex")?;
    let message = protocol::decode(&bytes).context("payload is not a valid frame")?;

    println!("source:    {}", message.source_id());
    println!("timestamp: {}", message.timestamp());
    println!("action:    {} ({})", message.action(), message.action().code());
    println!("key:       {}", message.cache_key());
    println!("valid:     {}", message.is_valid());
    if bytes.len() > protocol::encoded_len(&message) {
        println!(
            "trailing:  {} bytes ignored",
            bytes.len() - protocol::encoded_len(&message)
        );
    }
    Ok(())
}
