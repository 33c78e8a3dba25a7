// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 代理服务器
//!
//! 在回环地址上监听。请求头在限时内读完之后，连接才占用有界工作池中的一个槽位，
//! 因此迟迟不发请求的连接不会挤占槽位。
//! 接受连接失败只记录并重试；单个连接的失败不影响其他连接。

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Semaphore,
};

use crate::{
    engine::Engine, exception::Exception, param::REQUEST_HEAD_TIMEOUT, request::GetRequest,
};

pub struct ProxyServer {
    engine: Arc<Engine>,
    listener: TcpListener,
    slots: Arc<Semaphore>,
    active_connection: Arc<AtomicUsize>,
    head_timeout: Duration,
}

impl ProxyServer {
    /// 绑定引擎配置的地址。端口为 0 时由系统分配，并回写到引擎。
    pub async fn bind(engine: Arc<Engine>) -> Result<Self, Exception> {
        let address = format!("{}:{}", engine.host(), engine.port());
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            error!("无法绑定地址：{}，错误：{}", address, e);
            Exception::Config(format!("无法绑定地址{}：{}", address, e))
        })?;
        let local = listener.local_addr()?;
        engine.set_port(local.port());
        info!("代理服务器在{}上监听Socket连接", local);

        Ok(Self {
            slots: Arc::new(Semaphore::new(engine.worker_slots())),
            engine,
            listener,
            active_connection: Arc::new(AtomicUsize::new(0)),
            head_timeout: REQUEST_HEAD_TIMEOUT,
        })
    }

    /// 读取请求头的时限，超时的连接按非法请求关闭
    pub fn head_timeout(mut self, timeout: Duration) -> Self {
        self.head_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Exception> {
        Ok(self.listener.local_addr()?)
    }

    /// 当前活跃连接数的共享计数，供管理控制台读取
    pub fn active_connection(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_connection)
    }

    /// 接受循环，直到引擎停机
    pub async fn run(self) {
        let token = self.engine.token();
        let mut id: u128 = 0;
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = token.cancelled() => {
                    info!("主循环接收到停机指令，正在退出...");
                    break;
                }
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("接受连接失败：{}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            debug!("[ID{}]TCP连接已建立：{}", id, addr);

            let engine = Arc::clone(&self.engine);
            let slots = Arc::clone(&self.slots);
            let active_connection = Arc::clone(&self.active_connection);
            let head_timeout = self.head_timeout;
            tokio::spawn(async move {
                active_connection.fetch_add(1, Ordering::SeqCst);
                let start_time = Instant::now();
                match process_socket(&engine, stream, &slots, head_timeout, id).await {
                    Ok(()) => debug!(
                        "[ID{}]连接处理完成，用时{}ms",
                        id,
                        start_time.elapsed().as_millis()
                    ),
                    Err(e) if e.is_benign() => debug!("[ID{}]连接结束：{}", id, e),
                    Err(Exception::BadRequest) => warn!("[ID{}]非法请求，关闭连接", id),
                    Err(e) => error!("[ID{}]处理连接时发生错误：{}", id, e),
                }
                active_connection.fetch_sub(1, Ordering::SeqCst);
            });
            id += 1;
        }
    }
}

/// 读取请求、占用工作槽位、选定服务方式并写出响应。返回后连接即被关闭。
pub async fn process_socket(
    engine: &Engine,
    stream: TcpStream,
    slots: &Semaphore,
    head_timeout: Duration,
    id: u128,
) -> Result<(), Exception> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let request = tokio::time::timeout(head_timeout, GetRequest::read_from(&mut reader))
        .await
        .map_err(|_| {
            debug!("[ID{}]{}ms内未收到完整请求头", id, head_timeout.as_millis());
            Exception::BadRequest
        })??;
    let _permit = slots.acquire().await.map_err(|_| Exception::Cancelled)?;
    info!(
        "[ID{}]GET <{}>{}",
        id,
        request.uri,
        if request.partial {
            format!(", Range: bytes={}-", request.range_offset)
        } else {
            String::new()
        }
    );

    let proxy_request = engine.get_request(&request).await?;
    debug!(
        "[ID{}]{}",
        id,
        if proxy_request.is_cached() {
            "经由缓存提供"
        } else {
            "透传"
        }
    );
    proxy_request.execute(&mut write_half, &request, id).await?;
    let _ = write_half.shutdown().await;
    Ok(())
}
