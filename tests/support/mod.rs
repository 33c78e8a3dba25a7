// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 集成测试共用的桩源站与客户端工具。

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use mediacache::{
    cache::partial_path,
    disk_usage::{DiskUsage, LruDiskUsage},
    meta::{MediaMeta, MemoryMetaStore},
    origin::{ByteStream, Origin},
    param::{DEFAULT_MAX_SIZE, REQUEST_HEAD_TIMEOUT},
    util::encode,
    Engine, EngineBuilder, Exception, ProxyServer, ReconnectPolicy,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
};

pub const URL: &str = "http://origin.test/media/ElephantsDream.mp4";
pub const LENGTH: usize = 100_000;

pub fn origin_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 内存中的源站：记录每次打开的偏移，统计同时被消费的响应体个数。
pub struct StubOrigin {
    body: Vec<u8>,
    mime: String,
    chunk_delay: Duration,
    pub active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
    pub probes: AtomicUsize,
    pub offsets: Mutex<Vec<u64>>,
}

impl StubOrigin {
    pub fn new(len: usize, chunk_delay: Duration) -> Self {
        Self {
            body: origin_bytes(len),
            mime: "video/mp4".to_string(),
            chunk_delay,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            probes: AtomicUsize::new(0),
            offsets: Mutex::new(Vec::new()),
        }
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Origin for StubOrigin {
    async fn probe(&self, url: &str) -> Result<MediaMeta, Exception> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(MediaMeta::new(url, self.body.len() as i64, &self.mime))
    }

    async fn open(&self, _url: &str, offset: u64) -> Result<ByteStream, Exception> {
        self.offsets.lock().unwrap().push(offset);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));
        let chunks: Vec<Bytes> = self.body[offset as usize..]
            .chunks(4096)
            .map(Bytes::copy_from_slice)
            .collect();
        let delay = self.chunk_delay;
        Ok(stream::unfold(
            (chunks.into_iter(), guard),
            move |(mut it, guard)| async move {
                tokio::time::sleep(delay).await;
                it.next().map(|c| (Ok(c), (it, guard)))
            },
        )
        .boxed())
    }
}

pub struct TestProxy {
    pub engine: Arc<Engine>,
    pub addr: SocketAddr,
    pub origin: Arc<StubOrigin>,
    pub server: JoinHandle<()>,
    pub dir: TempDir,
}

impl TestProxy {
    pub fn cache_file(&self) -> PathBuf {
        self.engine.cache_file(URL)
    }

    pub fn partial_file(&self) -> PathBuf {
        partial_path(&self.cache_file())
    }
}

pub async fn start_proxy(origin: StubOrigin, policy: ReconnectPolicy) -> TestProxy {
    start_proxy_with(
        origin,
        policy,
        Arc::new(LruDiskUsage::total_size(DEFAULT_MAX_SIZE)),
        REQUEST_HEAD_TIMEOUT,
    )
    .await
}

pub async fn start_proxy_with(
    origin: StubOrigin,
    policy: ReconnectPolicy,
    disk_usage: Arc<dyn DiskUsage>,
    head_timeout: Duration,
) -> TestProxy {
    let dir = TempDir::new().unwrap();
    let origin = Arc::new(origin);
    let engine = Arc::new(
        EngineBuilder::new()
            .cache_root(dir.path().join("cache"))
            .meta_store(Arc::new(MemoryMetaStore::new()))
            .origin(origin.clone())
            .port(0)
            .reconnect(policy)
            .disk_usage(disk_usage)
            .build()
            .unwrap(),
    );
    let server = ProxyServer::bind(Arc::clone(&engine))
        .await
        .unwrap()
        .head_timeout(head_timeout);
    let addr = server.local_addr().unwrap();
    let server = tokio::spawn(server.run());
    TestProxy {
        engine,
        addr,
        origin,
        server,
        dir,
    }
}

pub fn get_request(url: &str, range: Option<u64>) -> String {
    let mut request = format!(
        "GET /{} HTTP/1.1\r\nHost: 127.0.0.1\r\nUser-Agent: stagefright/1.2\r\n",
        encode(url)
    );
    if let Some(offset) = range {
        request.push_str(&format!("Range: bytes={}-\r\n", offset));
    }
    request.push_str("\r\n");
    request
}

/// 发送原始请求，读到连接关闭（或出错）为止
pub async fn send_raw(addr: SocketAddr, raw: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    read_until_closed(&mut stream).await
}

pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match tokio::time::timeout(Duration::from_secs(20), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            Err(_) => panic!("timed out waiting for the proxy"),
        }
    }
    out
}

pub fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    match raw.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => (
            String::from_utf8_lossy(&raw[..pos + 4]).to_string(),
            raw[pos + 4..].to_vec(),
        ),
        None => (String::from_utf8_lossy(raw).to_string(), Vec::new()),
    }
}

pub async fn fetch(addr: SocketAddr, url: &str, range: Option<u64>) -> (String, Vec<u8>) {
    let raw = send_raw(addr, get_request(url, range).as_bytes()).await;
    split_response(&raw)
}

/// 等待条件成立，最多 10 秒
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
