// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 回源客户端
//!
//! `Origin` 是代理与源站之间的接缝：
//! - `probe` 只读取响应头，得到 `Content-Length` 与 `Content-Type`，随即丢弃响应体；
//! - `open` 发起（可能带 `Range: bytes=<offset>-` 的）GET，返回响应体的字节流。
//!
//! 默认实现 `HttpOrigin` 基于 reqwest：跟随重定向，对 5xx 与瞬时的网络错误做指数退避重试。
//! 续传偏移恰好落在末尾时源站返回 416，视为一个空的响应体。

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    future,
    stream::{self, BoxStream},
    StreamExt,
};
use log::{debug, info, warn};
use reqwest::{
    header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE},
    redirect::Policy,
    Client, Response, StatusCode,
};

use crate::{
    config::OriginConfig,
    exception::Exception,
    meta::MediaMeta,
    param::RETRY_BASE_DELAY,
};

/// 源站响应体
pub type ByteStream = BoxStream<'static, Result<Bytes, Exception>>;

/// 为每个回源请求附加自定义请求头（例如鉴权）。
pub trait HeaderInjector: Send + Sync {
    fn add_headers(&self, url: &str) -> HashMap<String, String>;
}

#[derive(Debug, Default)]
pub struct DefaultHeaderInjector;

impl HeaderInjector for DefaultHeaderInjector {
    fn add_headers(&self, _url: &str) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// 对所有 URL 注入同一组固定请求头
#[derive(Debug, Default, Clone)]
pub struct StaticHeaderInjector {
    headers: HashMap<String, String>,
}

impl StaticHeaderInjector {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self { headers }
    }
}

impl HeaderInjector for StaticHeaderInjector {
    fn add_headers(&self, _url: &str) -> HashMap<String, String> {
        self.headers.clone()
    }
}

#[async_trait]
pub trait Origin: Send + Sync {
    /// 执行 GET 但只读取响应头。
    async fn probe(&self, url: &str) -> Result<MediaMeta, Exception>;

    /// 从 `offset` 开始读取源站内容；`offset == 0` 时不带 Range 头。
    async fn open(&self, url: &str, offset: u64) -> Result<ByteStream, Exception>;
}

pub struct HttpOrigin {
    client: Client,
    injector: Arc<dyn HeaderInjector>,
    max_retries: u32,
}

impl HttpOrigin {
    pub fn new(config: &OriginConfig, injector: Arc<dyn HeaderInjector>) -> Result<Self, Exception> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent())
            .redirect(Policy::limited(10))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs()));
        if config.no_proxy() {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| Exception::Config(format!("无法构建HTTP客户端：{}", e)))?;
        Ok(Self {
            client,
            injector,
            max_retries: config.max_retries(),
        })
    }

    async fn send(&self, url: &str, offset: u64) -> Result<Response, Exception> {
        let mut attempt: u32 = 0;
        loop {
            let mut request = self.client.get(url);
            for (name, value) in self.injector.add_headers(url) {
                request = request.header(name, value);
            }
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={}-", offset));
            }

            let failure = match request.send().await {
                Ok(response)
                    if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE =>
                {
                    return Ok(response);
                }
                Ok(response) if response.status().is_server_error() => {
                    Exception::SourceStatus(response.status().as_u16())
                }
                Ok(response) if !response.status().is_success() => {
                    warn!("回源<{}>返回{}，不再重试", url, response.status());
                    return Err(Exception::SourceStatus(response.status().as_u16()));
                }
                Ok(response) => return Ok(response),
                Err(e) if !is_transient(&e) => {
                    warn!("回源<{}>失败，不再重试：{}", url, e);
                    return Err(Exception::from(e));
                }
                Err(e) => Exception::from(e),
            };

            if attempt >= self.max_retries {
                warn!("回源<{}>失败，已重试{}次：{}", url, attempt, failure);
                return Err(failure);
            }
            let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt);
            warn!(
                "回源<{}>失败：{}，{}ms后进行第{}次重试",
                url,
                failure,
                delay.as_millis(),
                attempt + 1
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn probe(&self, url: &str) -> Result<MediaMeta, Exception> {
        let response = self.send(url, 0).await?;
        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(-1);
        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        // 丢弃响应即取消响应体的传输
        drop(response);
        debug!("探测<{}>：length={}, mime={}", url, length, mime);
        Ok(MediaMeta::new(url, length, &mime))
    }

    async fn open(&self, url: &str, offset: u64) -> Result<ByteStream, Exception> {
        info!(
            "URL: {} >>>> Open connection{}",
            url,
            if offset > 0 {
                format!(" with offset {}", offset)
            } else {
                String::new()
            }
        );
        let response = self.send(url, offset).await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!("源站<{}>在偏移{}处已无数据", url, offset);
            return Ok(stream::empty().boxed());
        }
        let ignored_range = offset > 0 && response.status() == StatusCode::OK;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Exception::from))
            .boxed();
        if ignored_range {
            warn!("源站<{}>忽略了Range头，将跳过前{}字节", url, offset);
            return Ok(skip_prefix(stream, offset));
        }
        Ok(stream)
    }
}

/// 连接失败、超时与传输中断可能自行恢复；构造请求失败、重定向过多等则不会
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
}

/// 丢弃字节流的前 `skip` 个字节
pub fn skip_prefix(stream: ByteStream, mut skip: u64) -> ByteStream {
    stream
        .filter_map(move |chunk| {
            let out = match chunk {
                Ok(bytes) if skip > 0 => {
                    let len = bytes.len() as u64;
                    if len <= skip {
                        skip -= len;
                        None
                    } else {
                        let rest = bytes.slice(skip as usize..);
                        skip = 0;
                        Some(Ok(rest))
                    }
                }
                other => Some(other),
            };
            future::ready(out)
        })
        .boxed()
}
