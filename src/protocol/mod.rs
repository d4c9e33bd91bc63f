//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了背板线协议：失效消息模型及其二进制编解码。

pub mod codec;
pub mod message;

pub use codec::{decode, encode, encode_into, encoded_len, DecodeError, PROTOCOL_VERSION};
pub use message::{Action, InvalidationMessage};
