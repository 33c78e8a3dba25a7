// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 透传
//!
//! 远距离跳转时不经过磁盘缓存，源站数据直接转发给客户端，也不与其他连接协调。

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    exception::Exception, meta::MediaMeta, origin::Origin, request::GetRequest,
    response::ResponseHeader, source::NetSource,
};

pub struct HttpRequest {
    meta: MediaMeta,
    origin: Arc<dyn Origin>,
    token: CancellationToken,
}

impl HttpRequest {
    pub fn new(meta: MediaMeta, origin: Arc<dyn Origin>, token: CancellationToken) -> Self {
        Self {
            meta,
            origin,
            token,
        }
    }

    pub fn url(&self) -> &str {
        &self.meta.url
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn execute<W>(
        &self,
        writer: &mut W,
        request: &GetRequest,
        id: u128,
    ) -> Result<(), Exception>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if self.token.is_cancelled() {
            return Err(Exception::Cancelled);
        }
        tokio::select! {
            r = self.tunnel(writer, request, id) => r,
            _ = self.token.cancelled() => Err(Exception::Cancelled),
        }
    }

    async fn tunnel<W>(&self, writer: &mut W, request: &GetRequest, id: u128) -> Result<(), Exception>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut source = NetSource::new(self.meta.clone(), Arc::clone(&self.origin));
        let header = ResponseHeader::new(request, source.length(), source.mime());
        if !header.is_satisfiable() {
            warn!(
                "[ID{}]Range偏移{}超出长度{}，返回416",
                id,
                request.range_offset,
                source.length()
            );
            writer
                .write_all(&header.as_bytes())
                .await
                .map_err(|_| Exception::ClientGone)?;
            return Ok(());
        }

        info!(
            "[ID{}]透传<{}>，起始偏移{}",
            id,
            source.url(),
            request.range_offset
        );
        source.open_channel(request.range_offset).await?;
        writer
            .write_all(&header.as_bytes())
            .await
            .map_err(|_| Exception::ClientGone)?;

        let mut sent: u64 = 0;
        while let Some(chunk) = source.next_chunk().await? {
            writer
                .write_all(&chunk)
                .await
                .map_err(|_| Exception::ClientGone)?;
            sent += chunk.len() as u64;
        }
        source.close();
        writer.flush().await.map_err(|_| Exception::ClientGone)?;
        debug!("[ID{}]透传结束，共{} bytes", id, sent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::ByteStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::{stream, StreamExt};
    use std::sync::Mutex;

    struct MemoryOrigin {
        body: Vec<u8>,
        offsets: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Origin for MemoryOrigin {
        async fn probe(&self, url: &str) -> Result<MediaMeta, Exception> {
            Ok(MediaMeta::new(url, self.body.len() as i64, "video/mp4"))
        }

        async fn open(&self, _url: &str, offset: u64) -> Result<ByteStream, Exception> {
            self.offsets.lock().unwrap().push(offset);
            let chunks: Vec<Result<Bytes, Exception>> = self.body[offset as usize..]
                .chunks(3000)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(stream::iter(chunks).boxed())
        }
    }

    fn origin(len: usize) -> Arc<MemoryOrigin> {
        Arc::new(MemoryOrigin {
            body: (0..len).map(|i| (i % 251) as u8).collect(),
            offsets: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_tunnel_from_offset() {
        let origin = origin(100_000);
        let meta = MediaMeta::new("http://e.com/v.mp4", 100_000, "video/mp4");
        let passthrough = HttpRequest::new(meta, origin.clone(), CancellationToken::new());
        let request = GetRequest {
            uri: "http://e.com/v.mp4".to_string(),
            range_offset: 90_000,
            partial: true,
        };

        let mut out = Vec::new();
        passthrough.execute(&mut out, &request, 7).await.unwrap();
        let expected_head = "HTTP/1.1 206 PARTIAL CONTENT\r\nAccept-Ranges: bytes\r\nContent-Length: 10000\r\nContent-Range: bytes 90000-99999/100000\r\nContent-Type: video/mp4\r\n\r\n";
        assert_eq!(&out[..expected_head.len()], expected_head.as_bytes());
        assert_eq!(&out[expected_head.len()..], &origin.body[90_000..]);
        assert_eq!(*origin.offsets.lock().unwrap(), vec![90_000]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        let meta = MediaMeta::new("http://e.com/v.mp4", 100, "video/mp4");
        let passthrough = HttpRequest::new(meta, origin(100), token.clone());
        passthrough.shutdown();
        let request = GetRequest {
            uri: "http://e.com/v.mp4".to_string(),
            range_offset: 0,
            partial: false,
        };
        let mut out = Vec::new();
        assert_eq!(
            passthrough.execute(&mut out, &request, 1).await,
            Err(Exception::Cancelled)
        );
        assert!(token.is_cancelled());
        assert!(out.is_empty());
    }
}
