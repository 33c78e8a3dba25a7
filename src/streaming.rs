// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 缓存流状态机
//!
//! 一个 `CacheRequest` 对应一个 URL，通过同一个 `FileCache` 耦合两类任务：
//!
//! - **写入任务**（同一时刻至多一个）：从 `cache.available()` 处回源，把响应体追加到缓存，
//!   每次追加都会唤醒等待中的读取方。响应体读完且长度吻合时完成缓存。
//! - **服务循环**（每个客户端连接一个会话）：先写响应头，再从缓存中按顺序读出字节写给客户端；
//!   缓存中还没有所需字节时等待缓存增长，必要时拉起写入任务。
//!
//! 写入失败只会累加错误计数，由服务循环决定何时重试、何时放弃。
//!
//! 既没有会话也没有写入任务时，请求把自己从引擎的请求表中移除，缓存文件句柄随之关闭。

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock, Weak,
    },
};

use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Notify,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::FileCache,
    config::ReconnectPolicy,
    disk_usage::DiskUsage,
    exception::Exception,
    meta::MediaMeta,
    origin::Origin,
    param::*,
    request::GetRequest,
    response::ResponseHeader,
    source::NetSource,
    util::percents,
};

/// 缓存进度监听
pub trait CacheCallback: Send + Sync {
    fn on_cache_progress(&self, file: &Path, url: &str, percents: i32);
}

#[derive(Default)]
pub struct CacheCallbacks {
    listeners: RwLock<Vec<(u64, Arc<dyn CacheCallback>)>>,
    next_id: AtomicU64,
}

impl CacheCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: Arc<dyn CacheCallback>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, callback));
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|(i, _)| *i != id);
        listeners.len() != before
    }

    pub fn notify(&self, file: &Path, url: &str, percents: i32) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, callback) in listeners.iter() {
            callback.on_cache_progress(file, url, percents);
        }
    }
}

/// 引擎持有的 URL 到缓存请求的映射
pub type RequestRegistry = Mutex<HashMap<String, Arc<CacheRequest>>>;

struct WriterHandle {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 写入任务退出时清空写入槽位，并尝试释放空闲的请求
struct WriterExit {
    request: Arc<CacheRequest>,
    id: u64,
}

impl Drop for WriterExit {
    fn drop(&mut self) {
        {
            let mut slot = lock(&self.request.writer);
            if matches!(slot.as_ref(), Some(w) if w.id == self.id) {
                *slot = None;
            }
        }
        self.request.release();
    }
}

/// 一个客户端连接在某个缓存请求上的会话。
///
/// 会话存在期间请求不会被释放；会话被 drop 时注销自己。
pub struct CacheSession {
    request: Arc<CacheRequest>,
    id: u64,
    token: CancellationToken,
}

impl CacheSession {
    pub fn request(&self) -> &Arc<CacheRequest> {
        &self.request
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 为客户端服务直到响应体写完、客户端离开或会话被关闭。
    pub async fn execute<W>(
        &self,
        writer: &mut W,
        request: &GetRequest,
        id: u128,
    ) -> Result<(), Exception>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let result = tokio::select! {
            r = self.request.serve(writer, request, id) => r,
            _ = self.token.cancelled() => Err(Exception::Cancelled),
        };
        if let Err(e) = self.request.cache.close() {
            warn!(
                "[ID{}]关闭缓存文件{}失败：{}",
                id,
                self.request.file.display(),
                e
            );
        }
        result
    }
}

impl Drop for CacheSession {
    fn drop(&mut self) {
        lock(&self.request.sessions).remove(&self.id);
        self.request.release();
    }
}

pub struct CacheRequest {
    meta: MediaMeta,
    file: PathBuf,
    cache: FileCache,
    origin: Arc<dyn Origin>,
    callbacks: Arc<CacheCallbacks>,
    policy: ReconnectPolicy,
    token: CancellationToken,
    grown: Notify,
    errors: AtomicU32,
    // 写入任务正常结束但缓存无法完成：读取方读完已有数据即结束
    drained: AtomicBool,
    last_percents: AtomicI32,
    writer: Mutex<Option<WriterHandle>>,
    // 新的写入任务必须等上一个任务释放回源连接之后才能开始
    writer_gate: Arc<tokio::sync::Mutex<()>>,
    next_writer: AtomicU64,
    sessions: Mutex<HashMap<u64, CancellationToken>>,
    next_session: AtomicU64,
    registry: Option<Weak<RequestRegistry>>,
}

impl CacheRequest {
    pub fn new(
        meta: MediaMeta,
        file: PathBuf,
        disk_usage: Arc<dyn DiskUsage>,
        origin: Arc<dyn Origin>,
        callbacks: Arc<CacheCallbacks>,
        policy: ReconnectPolicy,
        token: CancellationToken,
    ) -> Result<Self, Exception> {
        let cache = FileCache::open(&file, disk_usage)?;
        Ok(Self {
            meta,
            file,
            cache,
            origin,
            callbacks,
            policy,
            token,
            grown: Notify::new(),
            errors: AtomicU32::new(0),
            drained: AtomicBool::new(false),
            last_percents: AtomicI32::new(-1),
            writer: Mutex::new(None),
            writer_gate: Arc::new(tokio::sync::Mutex::new(())),
            next_writer: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
            registry: None,
        })
    }

    /// 空闲时从 `registry` 中移除自己
    pub fn with_registry(mut self, registry: Weak<RequestRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn url(&self) -> &str {
        &self.meta.url
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn writer_running(&self) -> bool {
        matches!(lock(&self.writer).as_ref(), Some(w) if !w.handle.is_finished())
    }

    /// 没有客户端、也没有写入任务
    pub fn is_idle(&self) -> bool {
        self.session_count() == 0 && !self.writer_running()
    }

    /// 同一 URL 来了新的客户端连接。
    ///
    /// `Replace` 策略下关闭之前的会话与写入任务，新的写入任务会从已增长的缓存末尾继续；
    /// `Multiplex` 策略下之前的会话继续读取。
    pub fn supplant(&self) {
        if self.policy == ReconnectPolicy::Replace {
            let sessions: Vec<CancellationToken> = lock(&self.sessions).values().cloned().collect();
            if !sessions.is_empty() {
                info!("<{}>有新的连接，关闭之前的{}个会话", self.meta.url, sessions.len());
            }
            for session in sessions {
                session.cancel();
            }
            if let Some(writer) = lock(&self.writer).as_ref() {
                writer.token.cancel();
            }
        }
        self.drained.store(false, Ordering::Release);
        self.grown.notify_waiters();
    }

    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            return;
        }
        debug!("关闭<{}>的缓存请求", self.meta.url);
        self.token.cancel();
        self.grown.notify_waiters();
        if let Err(e) = self.cache.close() {
            warn!("关闭缓存文件{}失败：{}", self.file.display(), e);
        }
    }

    /// 开启一个新会话并立即为它服务
    pub async fn execute<W>(
        self: &Arc<Self>,
        writer: &mut W,
        request: &GetRequest,
        id: u128,
    ) -> Result<(), Exception>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.attach().execute(writer, request, id).await
    }

    /// 登记一个会话。引擎在持有请求表锁时调用，保证会话登记前请求不会被释放。
    pub fn attach(self: &Arc<Self>) -> CacheSession {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let token = self.token.child_token();
        lock(&self.sessions).insert(id, token.clone());
        CacheSession {
            request: Arc::clone(self),
            id,
            token,
        }
    }

    fn release(self: &Arc<Self>) {
        if !self.is_idle() {
            return;
        }
        let registry = match self.registry.as_ref().and_then(Weak::upgrade) {
            Some(registry) => registry,
            None => return,
        };
        let mut requests = lock(&*registry);
        // 持有请求表锁再确认一次，期间不会有新的会话登记
        if matches!(requests.get(self.url()), Some(r) if Arc::ptr_eq(r, self)) && self.is_idle() {
            requests.remove(self.url());
            debug!("<{}>已空闲，释放缓存请求", self.meta.url);
        }
    }

    async fn serve<W>(
        self: &Arc<Self>,
        writer: &mut W,
        request: &GetRequest,
        id: u128,
    ) -> Result<(), Exception>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let length = if self.cache.is_completed() {
            self.cache.available() as i64
        } else {
            self.meta.length
        };
        let mime = if self.meta.unknown_mime() {
            None
        } else {
            Some(self.meta.mime.as_str())
        };
        let header = ResponseHeader::new(request, length, mime);
        writer
            .write_all(&header.as_bytes())
            .await
            .map_err(|_| Exception::ClientGone)?;
        if !header.is_satisfiable() {
            warn!(
                "[ID{}]Range偏移{}超出长度{}，返回416",
                id, request.range_offset, length
            );
            return Ok(());
        }

        let mut offset = request.range_offset;
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        loop {
            let n = self.read(&mut buf, offset).await?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|_| Exception::ClientGone)?;
            offset += n as u64;
        }
        writer.flush().await.map_err(|_| Exception::ClientGone)?;
        debug!(
            "[ID{}]<{}>已发送{} bytes",
            id,
            self.meta.url,
            offset - request.range_offset
        );
        Ok(())
    }

    /// 从缓存读取 `offset` 处的数据，缓存不够时等待它增长。
    async fn read(self: &Arc<Self>, buf: &mut [u8], offset: u64) -> Result<usize, Exception> {
        let wanted = offset + buf.len() as u64;
        loop {
            if self.token.is_cancelled() {
                return Err(Exception::Cancelled);
            }
            let available = self.cache.available();
            if self.cache.is_completed() || available >= wanted {
                break;
            }
            if self.drained.load(Ordering::Acquire) {
                break;
            }

            let notified = self.grown.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.cache.available() != available || self.cache.is_completed() {
                continue;
            }
            self.ensure_writer();
            let _ = tokio::time::timeout(INTERVAL, notified).await;
            self.check_errors()?;
        }

        let n = self.cache.read(buf, offset)?;
        if self.cache.is_completed() {
            self.report_progress(100);
        }
        Ok(n)
    }

    fn check_errors(&self) -> Result<(), Exception> {
        let errors = self.errors.load(Ordering::Acquire);
        if errors >= MAX_READ_SOURCE_ATTEMPTS {
            self.errors.store(0, Ordering::Release);
            error!("<{}>回源失败{}次，缓存不可用", self.meta.url, errors);
            return Err(Exception::CacheUnavailable(errors));
        }
        Ok(())
    }

    fn ensure_writer(self: &Arc<Self>) {
        if self.cache.is_completed()
            || self.token.is_cancelled()
            || self.drained.load(Ordering::Acquire)
        {
            return;
        }
        let mut slot = lock(&self.writer);
        if matches!(slot.as_ref(), Some(w) if !w.handle.is_finished()) {
            return;
        }
        let id = self.next_writer.fetch_add(1, Ordering::Relaxed);
        let token = self.token.child_token();
        let handle = tokio::spawn(Arc::clone(self).run_writer(token.clone(), id));
        *slot = Some(WriterHandle { id, token, handle });
    }

    async fn run_writer(self: Arc<Self>, token: CancellationToken, id: u64) {
        let _exit = WriterExit {
            request: Arc::clone(&self),
            id,
        };
        let gate = tokio::select! {
            g = Arc::clone(&self.writer_gate).lock_owned() => g,
            _ = token.cancelled() => return,
        };
        let result = tokio::select! {
            r = self.fill_cache() => r,
            _ = token.cancelled() => Err(Exception::Cancelled),
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_benign() => debug!("<{}>写入任务被取消", self.meta.url),
            Err(e) => {
                let errors = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
                error!(
                    "<{}>写入任务失败（第{}次）：{}",
                    self.meta.url, errors, e
                );
            }
        }
        drop(gate);
        self.grown.notify_waiters();
    }

    async fn fill_cache(&self) -> Result<(), Exception> {
        if self.cache.is_completed() {
            return Ok(());
        }
        let initial = self.cache.available();
        let mut source = NetSource::new(self.meta.clone(), Arc::clone(&self.origin));
        if self.meta.length < 0 || initial < self.meta.length as u64 {
            source.open_channel(initial).await?;
            while let Some(chunk) = source.next_chunk().await? {
                self.cache.append(&chunk)?;
                self.grown.notify_waiters();
                self.report_progress(percents(self.cache.available(), self.meta.length));
            }
            source.close();
        }

        if self.try_complete()? {
            self.report_progress(100);
        } else {
            warn!(
                "<{}>源站数据已读完，但缓存{} bytes与长度{}不符，无法完成",
                self.meta.url,
                self.cache.available(),
                self.meta.length
            );
            self.drained.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn try_complete(&self) -> Result<bool, Exception> {
        if !self.cache.is_completed()
            && self.meta.length >= 0
            && self.cache.available() == self.meta.length as u64
        {
            self.cache.complete()?;
        }
        Ok(self.cache.is_completed())
    }

    fn report_progress(&self, percents: i32) {
        if self.meta.unknown_length() && percents != 100 {
            return;
        }
        if self.last_percents.swap(percents, Ordering::AcqRel) != percents {
            self.callbacks.notify(&self.file, &self.meta.url, percents);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
