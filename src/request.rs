// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 客户端请求解析
//!
//! 代理只关心请求头中的两样东西：
//! 1. 请求行 `GET /<编码后的源站URL> HTTP/1.1` 中的 URL；
//! 2. `Range: bytes=<offset>-` 中的起始偏移（结束位置被忽略）。
//!
//! 其余请求头一概忽略。

use lazy_static::lazy_static;
use log::{debug, error};
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::{exception::Exception, param::MAX_REQUEST_HEAD, util::decode};

lazy_static! {
    static ref URL_PATTERN: Regex = Regex::new(r"GET /(.*) HTTP").unwrap();
    static ref RANGE_HEADER_PATTERN: Regex = Regex::new(r"(?i)range:\s*bytes=(\d+)-").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    /// 解码后的源站 URL
    pub uri: String,
    /// Range 起始偏移；没有 Range 头时为 0
    pub range_offset: u64,
    /// 请求中是否带有 Range 头
    pub partial: bool,
}

impl GetRequest {
    pub fn parse(head: &str) -> Result<Self, Exception> {
        let encoded = URL_PATTERN
            .captures(head)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| {
                error!("请求中找不到GET请求行：{:?}", head.lines().next().unwrap_or(""));
                Exception::BadRequest
            })?;
        let uri = decode(encoded)?;

        let range = match RANGE_HEADER_PATTERN.captures(head).and_then(|c| c.get(1)) {
            Some(m) => Some(m.as_str().parse::<u64>().map_err(|_| {
                error!("Range偏移无法解析：{}", m.as_str());
                Exception::BadRequest
            })?),
            None => None,
        };

        Ok(Self {
            uri,
            range_offset: range.unwrap_or(0),
            partial: range.is_some(),
        })
    }

    /// 从连接中读取请求头直到空行，然后解析。
    ///
    /// 请求头超过 `MAX_REQUEST_HEAD` 字节或在空行之前连接关闭，都视为非法请求。
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, Exception>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut head = String::new();
        loop {
            let remaining = MAX_REQUEST_HEAD.saturating_sub(head.len());
            if remaining == 0 {
                error!("请求头超过{}字节", MAX_REQUEST_HEAD);
                return Err(Exception::BadRequest);
            }
            let mut line = String::new();
            let n = (&mut *reader)
                .take(remaining as u64)
                .read_line(&mut line)
                .await
                .map_err(|e| {
                    debug!("读取请求头失败：{}", e);
                    Exception::BadRequest
                })?;
            if n == 0 {
                if head.is_empty() {
                    return Err(Exception::BadRequest);
                }
                break;
            }
            let blank = line.trim().is_empty();
            head.push_str(&line);
            if blank {
                break;
            }
        }
        Self::parse(&head)
    }
}
