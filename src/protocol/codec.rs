//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 失效消息的二进制编解码。
//!
//! 布局（小端）：
//!
//! ```text
//! u8  version
//! u32 source_id 长度 | UTF-8 source_id
//! i64 timestamp
//! u8  action
//! u32 cache_key 长度 | UTF-8 cache_key
//! ```

use super::message::{Action, InvalidationMessage};
use thiserror::Error;

/// 当前协议版本
pub const PROTOCOL_VERSION: u8 = 0;

const VERSION_LEN: usize = 1;
const LENGTH_PREFIX_LEN: usize = 4;
const TIMESTAMP_LEN: usize = 8;
const ACTION_LEN: usize = 1;

/// 解码失败原因
///
/// 解码只做语法检查，语义问题交给 `is_valid`。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("payload truncated while reading {field}: need {needed} bytes, {available} left")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

/// 编码后的精确长度
pub fn encoded_len(message: &InvalidationMessage) -> usize {
    VERSION_LEN
        + LENGTH_PREFIX_LEN
        + message.source_id().len()
        + TIMESTAMP_LEN
        + ACTION_LEN
        + LENGTH_PREFIX_LEN
        + message.cache_key().len()
}

/// 编码失效消息
pub fn encode(message: &InvalidationMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(message));
    encode_into(message, &mut buf);
    buf
}

/// 将失效消息追加到调用方提供的缓冲区
pub fn encode_into(message: &InvalidationMessage, buf: &mut Vec<u8>) {
    buf.reserve(encoded_len(message));
    buf.push(PROTOCOL_VERSION);
    write_str(buf, message.source_id());
    buf.extend_from_slice(&message.timestamp().to_le_bytes());
    buf.push(message.action().code());
    write_str(buf, message.cache_key());
}

fn write_str(buf: &mut Vec<u8>, value: &str) {
    // 超过 u32::MAX 的字符串无法表示；缓存键和实例ID远小于此
    let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&value.as_bytes()[..len as usize]);
}

/// 解码失效消息
///
/// 空输入、不支持的版本、越界的长度字段都返回错误，不会 panic。
/// 缓存键之后的多余字节被忽略，以便向前兼容。
pub fn decode(bytes: &[u8]) -> Result<InvalidationMessage, DecodeError> {
    let (&version, rest) = bytes.split_first().ok_or(DecodeError::Empty)?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let mut reader = Reader { buf: rest };
    let source_id = reader.read_str("source_id")?;
    let timestamp = i64::from_le_bytes(reader.read_array::<TIMESTAMP_LEN>("timestamp")?);
    let [action_code] = reader.read_array::<ACTION_LEN>("action")?;
    let cache_key = reader.read_str("cache_key")?;

    Ok(InvalidationMessage::new(
        source_id,
        timestamp,
        Action::from_code(action_code),
        cache_key,
    ))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, field: &'static str, needed: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < needed {
            return Err(DecodeError::Truncated {
                field,
                needed,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(needed);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }

    fn read_str(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = u32::from_le_bytes(self.read_array::<LENGTH_PREFIX_LEN>(field)?) as usize;
        let raw = self.take(field, len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8(field))
    }
}
