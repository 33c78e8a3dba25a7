// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 单个媒体资源的回源通道。

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use log::debug;

use crate::{
    exception::Exception,
    meta::MediaMeta,
    origin::{ByteStream, Origin},
    param::DEFAULT_BUFFER_SIZE,
};

pub struct NetSource {
    meta: MediaMeta,
    origin: Arc<dyn Origin>,
    stream: Option<ByteStream>,
    // 上一个响应块中尚未交出的部分
    pending: Bytes,
}

impl NetSource {
    pub fn new(meta: MediaMeta, origin: Arc<dyn Origin>) -> Self {
        Self {
            meta,
            origin,
            stream: None,
            pending: Bytes::new(),
        }
    }

    pub async fn open_channel(&mut self, offset: u64) -> Result<(), Exception> {
        self.close();
        self.stream = Some(self.origin.open(&self.meta.url, offset).await?);
        Ok(())
    }

    pub fn url(&self) -> &str {
        &self.meta.url
    }

    pub fn length(&self) -> i64 {
        self.meta.length
    }

    pub fn mime(&self) -> Option<&str> {
        if self.meta.unknown_mime() {
            None
        } else {
            Some(&self.meta.mime)
        }
    }

    /// 下一个不超过 `DEFAULT_BUFFER_SIZE` 的数据块；响应体读完返回 `None`。
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Exception> {
        while self.pending.is_empty() {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Exception::SourceRead(format!("{} is not opened", self.meta.url)))?;
            match stream.next().await {
                Some(chunk) => self.pending = chunk?,
                None => return Ok(None),
            }
        }
        let len = self.pending.len().min(DEFAULT_BUFFER_SIZE);
        Ok(Some(self.pending.split_to(len)))
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("URL: {} >>>> Close connection", self.meta.url);
        }
        self.pending = Bytes::new();
    }
}
