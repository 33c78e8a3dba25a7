// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 响应头构建
//!
//! 缓存流与透传两条路径写出的响应头格式完全一致，在写出任何响应体字节之前一次性构建：
//!
//! ```text
//! HTTP/1.1 206 PARTIAL CONTENT | HTTP/1.1 200 OK
//! Accept-Ranges: bytes
//! Content-Length: <length - offset | length>      (长度已知时)
//! Content-Range: bytes <offset>-<length-1>/<length> (长度已知且为 Range 请求时)
//! Content-Type: <mime>                              (MIME 已知时)
//! ```

use crate::{param::*, request::GetRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    partial: bool,
    range_offset: u64,
    length: i64,
    mime: Option<String>,
}

impl ResponseHeader {
    pub fn new(request: &GetRequest, length: i64, mime: Option<&str>) -> Self {
        Self {
            partial: request.partial,
            range_offset: request.range_offset,
            length,
            mime: mime.filter(|m| !m.is_empty()).map(|m| m.to_string()),
        }
    }

    /// 长度已知且起始偏移越过末尾时无法满足
    pub fn is_satisfiable(&self) -> bool {
        !(self.length > 0 && self.range_offset >= self.length as u64)
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        if !self.is_satisfiable() {
            return range_not_satisfiable(self.length);
        }
        let length_known = self.length >= 0;
        let effective = if self.partial {
            self.length - self.range_offset as i64
        } else {
            self.length
        };

        [
            if self.partial { STATUS_PARTIAL } else { STATUS_OK },
            CRLF,
            "Accept-Ranges: bytes",
            CRLF,
            match length_known {
                true => ["Content-Length: ", &effective.to_string(), CRLF].concat(),
                false => "".to_string(),
            }
            .as_str(),
            match length_known && self.partial {
                true => format!(
                    "Content-Range: bytes {}-{}/{}{}",
                    self.range_offset,
                    self.length - 1,
                    self.length,
                    CRLF
                ),
                false => "".to_string(),
            }
            .as_str(),
            match &self.mime {
                Some(m) => ["Content-Type: ", m, CRLF].concat(),
                None => "".to_string(),
            }
            .as_str(),
            CRLF,
        ]
        .concat()
        .into_bytes()
    }
}

/// 416 响应头，没有响应体
pub fn range_not_satisfiable(length: i64) -> Vec<u8> {
    [
        STATUS_RANGE_NOT_SATISFIABLE,
        CRLF,
        "Content-Range: bytes */",
        &length.to_string(),
        CRLF,
        CRLF,
    ]
    .concat()
    .into_bytes()
}
