// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了媒体缓存代理在请求处理生命周期中可能抛出的各类异常情况。
//!
//! ## 设计意图
//! - **错误分类**：涵盖客户端请求解析错误、回源错误、本地缓存文件错误以及配置错误。
//! - **传播策略**：瞬时的回源错误在写入任务内部被计数重试，只有终止性错误才会关闭客户端连接。
//! - **取消是良性的**：`Cancelled` 与 `ClientGone` 只会以 debug 级别记录。

use std::fmt;
use std::io;

/// 代理处理请求过程中发生的异常类型。
#[derive(Debug, Clone, PartialEq)]
pub enum Exception {
    /// 客户端发送的请求中找不到 `GET /<url> HTTP` 请求行，或请求头过长、编码非法。
    /// 连接将被直接关闭，不写任何响应。
    BadRequest,
    /// 回源请求建立失败或读取响应体失败。
    SourceRead(String),
    /// 回源得到了无法使用的状态码（重试耗尽后的 5xx，或 4xx）。
    SourceStatus(u16),
    /// 回源写入任务累计失败次数达到上限，缓存不可用。
    CacheUnavailable(u32),
    /// 试图向已经完成的缓存文件追加数据。
    CacheCompleted,
    /// 本地缓存文件读写、重命名失败。
    CacheIo(String),
    /// 元数据存储读写失败。
    MetaStore(String),
    /// 客户端已断开，写 socket 失败。
    ClientGone,
    /// 请求被新的连接替换或引擎停机。
    Cancelled,
    /// 配置缺失或非法。
    Config(String),
}

use Exception::*;

impl Exception {
    /// 是否属于良性的终止（取消 / 客户端离开），这类情况不需要以 error 级别记录。
    pub fn is_benign(&self) -> bool {
        matches!(self, Cancelled | ClientGone)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadRequest => write!(f, "Bad client request"),
            SourceRead(msg) => write!(f, "Error reading source: {}", msg),
            SourceStatus(code) => write!(f, "Origin responded with status {}", code),
            CacheUnavailable(count) => write!(f, "Error reading source {} times", count),
            CacheCompleted => write!(f, "Cache file is already completed"),
            CacheIo(msg) => write!(f, "Cache file I/O error: {}", msg),
            MetaStore(msg) => write!(f, "Media meta storage error: {}", msg),
            ClientGone => write!(f, "Client closed the connection"),
            Cancelled => write!(f, "Request was shut down"),
            Config(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Exception {}

impl From<io::Error> for Exception {
    fn from(e: io::Error) -> Self {
        CacheIo(e.to_string())
    }
}

impl From<reqwest::Error> for Exception {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => SourceStatus(status.as_u16()),
            None => SourceRead(e.to_string()),
        }
    }
}
