// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 代理协议参数与常量模块
//!
//! 该模块集中定义了媒体缓存代理所使用的常量，包括：
//! - 代理监听地址与端口的默认值。
//! - 缓存读写的块大小、轮询间隔与重试预算。
//! - 响应状态行与文件命名约定。

use std::time::Duration;

/// 代理默认监听的回环地址
pub const PROXY_HOST: &str = "127.0.0.1";

/// 代理默认监听端口
pub const PROXY_PORT: u16 = 7878;

/// 服务器名称标识，用于日志与回源请求的 User-Agent
pub const SERVER_NAME: &str = "shaneyale-mediacache";

/// HTTP 协议规定的换行符（Carriage Return Line Feed）
pub const CRLF: &str = "\r\n";

/// 单次回源读取 / 单次写往客户端的块大小（8 KiB）
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// 读取方等待缓存增长时的最长轮询间隔
pub const INTERVAL: Duration = Duration::from_millis(600);

/// 回源写入任务累计失败达到该次数后，判定缓存不可用
pub const MAX_READ_SOURCE_ATTEMPTS: u32 = 5;

/// 远距离跳转阈值：超出「已缓存长度 + 总长度 * 0.2」的 Range 请求直接透传
pub const NO_CACHE_BARRIER: f64 = 0.2;

/// 未完成缓存文件的后缀
pub const TEMP_POSTFIX: &str = ".download";

/// 文件名扩展名的最大长度
pub const MAX_EXTENSION_LENGTH: usize = 4;

/// 默认磁盘缓存上限：512 MiB
pub const DEFAULT_MAX_SIZE: u64 = 512 * 1024 * 1024;

/// 默认并发连接处理槽位数
pub const DEFAULT_WORKER_SLOTS: usize = 5;

/// 回源失败时的最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// 回源指数退避的基础间隔
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// 读取客户端请求头的字节上限，超出即视为非法请求
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// 读取客户端请求头的时限
pub const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// 状态行
pub const STATUS_OK: &str = "HTTP/1.1 200 OK";
pub const STATUS_PARTIAL: &str = "HTTP/1.1 206 PARTIAL CONTENT";
pub const STATUS_RANGE_NOT_SATISFIABLE: &str = "HTTP/1.1 416 RANGE NOT SATISFIABLE";
