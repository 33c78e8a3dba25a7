// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求协调
//!
//! `Engine` 持有 URL 到 `CacheRequest` 的映射，保证同一 URL 在任何时刻只有一套缓存状态。
//! 每个客户端连接经过以下步骤：
//!
//! 1. 映射中已有该 URL：通知旧的占用者让位，在已有的条目上开启会话；
//! 2. 否则读取（必要时探测并保存）媒体元数据；
//! 3. 根据 Range 偏移判断走缓存还是透传：
//!    偏移超过「已缓存长度 + 总长度 * 0.2」的远距离跳转直接透传，不产生缓存文件。
//!
//! 条目在最后一个会话与写入任务结束后自行离开映射，下次请求同一 URL 时重新打开缓存文件。

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use log::{debug, info, warn};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    cache::FileCache,
    config::{Config, OriginConfig, ReconnectPolicy},
    disk_usage::{touch_safely, DiskUsage, LruDiskUsage, UsageLimit},
    exception::Exception,
    meta::{JsonMetaStore, MediaMeta, MetaStore},
    naming::{FileNameGenerator, Md5FileNameGenerator},
    origin::{HeaderInjector, DefaultHeaderInjector, HttpOrigin, Origin, StaticHeaderInjector},
    param::*,
    passthrough::HttpRequest,
    request::GetRequest,
    streaming::{CacheCallback, CacheCallbacks, CacheRequest, CacheSession, RequestRegistry},
    util::encode,
};

/// 一次客户端连接选定的服务方式
pub enum ProxyRequest {
    Cache(CacheSession),
    Passthrough(HttpRequest),
}

impl ProxyRequest {
    pub fn is_cached(&self) -> bool {
        matches!(self, ProxyRequest::Cache(_))
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
        match self {
            ProxyRequest::Cache(r) => r.execute(writer, request, id).await,
            ProxyRequest::Passthrough(r) => r.execute(writer, request, id).await,
        }
    }
}

/// 远距离跳转判断：长度已知、带 Range 且偏移超出已缓存部分加上 20% 容差时不缓存
pub fn is_cacheable(length: i64, request: &GetRequest, cache_available: u64) -> bool {
    !(length > 0
        && request.partial
        && request.range_offset as f64
            > cache_available as f64 + length as f64 * NO_CACHE_BARRIER)
}

pub struct Engine {
    cache_root: PathBuf,
    host: String,
    port: AtomicU16,
    worker_slots: usize,
    reconnect: ReconnectPolicy,
    name_generator: Arc<dyn FileNameGenerator>,
    disk_usage: Arc<dyn DiskUsage>,
    meta_store: Arc<dyn MetaStore>,
    origin: Arc<dyn Origin>,
    callbacks: Arc<CacheCallbacks>,
    requests: Arc<RequestRegistry>,
    token: CancellationToken,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// 为一个已解析的客户端请求选择（或建立）服务方式。
    pub async fn get_request(&self, request: &GetRequest) -> Result<ProxyRequest, Exception> {
        if self.token.is_cancelled() {
            return Err(Exception::Cancelled);
        }
        let url = request.uri.as_str();

        {
            let requests = self.requests();
            if let Some(existing) = requests.get(url) {
                existing.supplant();
                return Ok(ProxyRequest::Cache(existing.attach()));
            }
        }

        let meta = self.load_meta(url).await?;
        let file = self.cache_file(url);
        let cached = FileCache::cached_length(&file);
        if !is_cacheable(meta.length, request, cached) {
            info!(
                "<{}>远距离跳转到{}（已缓存{}，总长{}），透传",
                url, request.range_offset, cached, meta.length
            );
            return Ok(ProxyRequest::Passthrough(HttpRequest::new(
                meta,
                Arc::clone(&self.origin),
                self.token.child_token(),
            )));
        }

        let built = Arc::new(
            CacheRequest::new(
                meta,
                file,
                Arc::clone(&self.disk_usage),
                Arc::clone(&self.origin),
                Arc::clone(&self.callbacks),
                self.reconnect,
                self.token.child_token(),
            )?
            .with_registry(Arc::downgrade(&self.requests)),
        );

        let mut requests = self.requests();
        if self.token.is_cancelled() {
            return Err(Exception::Cancelled);
        }
        if let Some(existing) = requests.get(url) {
            // 并发建立的条目先一步插入，以它为准
            existing.supplant();
            return Ok(ProxyRequest::Cache(existing.attach()));
        }
        debug!("为<{}>建立缓存请求，已缓存{} bytes", url, cached);
        requests.insert(url.to_string(), Arc::clone(&built));
        Ok(ProxyRequest::Cache(built.attach()))
    }

    async fn load_meta(&self, url: &str) -> Result<MediaMeta, Exception> {
        let stored = match self.meta_store.get(url).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!("读取<{}>的元数据失败：{}", url, e);
                None
            }
        };
        if let Some(meta) = stored {
            if !meta.unknown() {
                return Ok(meta);
            }
        }
        let meta = self.origin.probe(url).await?;
        if let Err(e) = self.meta_store.put(url, meta.clone()).await {
            warn!("保存<{}>的元数据失败：{}", url, e);
        }
        Ok(meta)
    }

    /// URL 对应的最终缓存文件路径
    pub fn cache_file(&self, url: &str) -> PathBuf {
        self.cache_root.join(self.name_generator.generate(url))
    }

    /// 播放器应当使用的地址。
    ///
    /// 允许时，已完整缓存的文件直接以 `file://` 地址返回（同时刷新其 LRU 位置）；
    /// 否则返回指向本代理的地址。
    pub fn get_proxy_url(&self, url: &str, allow_cached_file_uri: bool) -> String {
        if allow_cached_file_uri {
            let file = self.cache_file(url);
            if file.exists() {
                touch_safely(self.disk_usage.as_ref(), &file);
                match fs::canonicalize(&file).map(Url::from_file_path) {
                    Ok(Ok(uri)) => return uri.to_string(),
                    _ => warn!("无法为{}生成file URI", file.display()),
                }
            }
        }
        format!("http://{}:{}/{}", self.host, self.port(), encode(url))
    }

    pub fn register_cache_callback(&self, callback: Arc<dyn CacheCallback>) -> u64 {
        self.callbacks.register(callback)
    }

    pub fn unregister_cache_callback(&self, id: u64) -> bool {
        self.callbacks.unregister(id)
    }

    /// 关闭所有缓存请求并拒绝新的请求
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            return;
        }
        info!("引擎停机");
        self.token.cancel();
        let drained: Vec<Arc<CacheRequest>> = self.requests().drain().map(|(_, r)| r).collect();
        for request in drained {
            request.shutdown();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    /// 监听端口为 0 时，绑定后以实际端口更新
    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Release);
    }

    pub fn worker_slots(&self) -> usize {
        self.worker_slots
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn tracked_requests(&self) -> usize {
        self.requests().len()
    }

    /// 缓存目录中所有文件（含未完成的）的总字节数与个数
    pub fn cache_usage(&self) -> (u64, usize) {
        let entries = match fs::read_dir(&self.cache_root) {
            Ok(entries) => entries,
            Err(_) => return (0, 0),
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .fold((0, 0), |(size, count), m| (size + m.len(), count + 1))
    }

    fn requests(&self) -> MutexGuard<'_, HashMap<String, Arc<CacheRequest>>> {
        match self.requests.lock() {
            Ok(lock) => lock,
            Err(poisoned) => {
                warn!("请求表锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }
}

/// 显式的引擎配置。缓存目录与元数据存储必须提供。
pub struct EngineBuilder {
    cache_root: Option<PathBuf>,
    meta_store: Option<Arc<dyn MetaStore>>,
    host: String,
    port: u16,
    worker_slots: usize,
    reconnect: ReconnectPolicy,
    name_generator: Arc<dyn FileNameGenerator>,
    disk_usage: Option<Arc<dyn DiskUsage>>,
    header_injector: Arc<dyn HeaderInjector>,
    origin: Option<Arc<dyn Origin>>,
    origin_config: OriginConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            cache_root: None,
            meta_store: None,
            host: PROXY_HOST.to_string(),
            port: PROXY_PORT,
            worker_slots: DEFAULT_WORKER_SLOTS,
            reconnect: ReconnectPolicy::default(),
            name_generator: Arc::new(Md5FileNameGenerator),
            disk_usage: None,
            header_injector: Arc::new(DefaultHeaderInjector),
            origin: None,
            origin_config: OriginConfig::new(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, Exception> {
        config.validate()?;
        let meta_store = JsonMetaStore::open(config.meta_store())?;
        let limit = if config.max_cache_files() > 0 {
            UsageLimit::TotalCount(config.max_cache_files())
        } else {
            UsageLimit::TotalSize(config.max_cache_size())
        };
        let mut builder = Self::new()
            .cache_root(config.cache_root())
            .meta_store(Arc::new(meta_store))
            .host(config.host())
            .port(config.port())
            .worker_slots(config.worker_slots())
            .reconnect(config.reconnect())
            .disk_usage(Arc::new(LruDiskUsage::new(limit)))
            .origin_config(config.origin().clone());
        if !config.origin().headers().is_empty() {
            builder = builder.header_injector(Arc::new(StaticHeaderInjector::new(
                config.origin().headers().clone(),
            )));
        }
        Ok(builder)
    }

    pub fn cache_root(mut self, dir: impl AsRef<Path>) -> Self {
        self.cache_root = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn meta_store(mut self, store: Arc<dyn MetaStore>) -> Self {
        self.meta_store = Some(store);
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn worker_slots(mut self, slots: usize) -> Self {
        self.worker_slots = slots;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn file_name_generator(mut self, generator: Arc<dyn FileNameGenerator>) -> Self {
        self.name_generator = generator;
        self
    }

    pub fn disk_usage(mut self, disk_usage: Arc<dyn DiskUsage>) -> Self {
        self.disk_usage = Some(disk_usage);
        self
    }

    pub fn header_injector(mut self, injector: Arc<dyn HeaderInjector>) -> Self {
        self.header_injector = injector;
        self
    }

    pub fn origin(mut self, origin: Arc<dyn Origin>) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn origin_config(mut self, config: OriginConfig) -> Self {
        self.origin_config = config;
        self
    }

    pub fn build(self) -> Result<Engine, Exception> {
        let cache_root = self
            .cache_root
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| Exception::Config("缺少缓存目录".to_string()))?;
        let meta_store = self
            .meta_store
            .ok_or_else(|| Exception::Config("缺少元数据存储".to_string()))?;
        if self.worker_slots == 0 {
            return Err(Exception::Config("worker_slots必须大于0".to_string()));
        }
        fs::create_dir_all(&cache_root).map_err(|e| {
            Exception::Config(format!("无法创建缓存目录{}：{}", cache_root.display(), e))
        })?;
        let origin = match self.origin {
            Some(origin) => origin,
            None => Arc::new(HttpOrigin::new(&self.origin_config, self.header_injector)?),
        };
        let disk_usage = self
            .disk_usage
            .unwrap_or_else(|| Arc::new(LruDiskUsage::total_size(DEFAULT_MAX_SIZE)));
        info!("缓存目录：{}", cache_root.display());

        Ok(Engine {
            cache_root,
            host: self.host,
            port: AtomicU16::new(self.port),
            worker_slots: self.worker_slots,
            reconnect: self.reconnect,
            name_generator: self.name_generator,
            disk_usage,
            meta_store,
            origin,
            callbacks: Arc::new(CacheCallbacks::new()),
            requests: Arc::new(Mutex::new(HashMap::new())),
            token: CancellationToken::new(),
        })
    }
}
