use num_cpus;
use serde_derive::Deserialize;
use serde_derive::Serialize;

use log::error;
use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;
use std::net::IpAddr;

use crate::exception::Exception;
use crate::param::*;

/// 同一 URL 被再次请求时，对之前仍在读取的客户端的处理方式
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// 关闭之前的会话，只为最新的客户端服务
    #[default]
    Replace,
    /// 之前的会话继续读取
    Multiplex,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OriginConfig {
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_connect_timeout_secs")]
    connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    user_agent: String,
    #[serde(default)]
    no_proxy: bool,
    #[serde(default)]
    headers: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    cache_root: String,
    meta_store: String,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    worker_threads: usize,
    #[serde(default = "default_worker_slots")]
    worker_slots: usize,
    #[serde(default = "default_max_cache_size")]
    max_cache_size: u64,
    #[serde(default)]
    max_cache_files: usize,
    #[serde(default)]
    reconnect: ReconnectPolicy,
    #[serde(default)]
    origin: OriginConfig,
}

fn default_host() -> String {
    PROXY_HOST.to_string()
}

fn default_port() -> u16 {
    PROXY_PORT
}

fn default_worker_slots() -> usize {
    DEFAULT_WORKER_SLOTS
}

fn default_max_cache_size() -> u64 {
    DEFAULT_MAX_SIZE
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_user_agent() -> String {
    format!("{}/{}", SERVER_NAME, env!("CARGO_PKG_VERSION"))
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginConfig {
    pub fn new() -> Self {
        Self {
            max_retries: default_max_retries(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            no_proxy: false,
            headers: HashMap::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_no_proxy(mut self, no_proxy: bool) -> Self {
        self.no_proxy = no_proxy;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn no_proxy(&self) -> bool {
        self.no_proxy
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            cache_root: "cache".to_string(),
            meta_store: "data/media_meta.json".to_string(),
            host: default_host(),
            port: default_port(),
            worker_threads: 0,
            worker_slots: default_worker_slots(),
            max_cache_size: default_max_cache_size(),
            max_cache_files: 0,
            reconnect: ReconnectPolicy::default(),
            origin: OriginConfig::new(),
        }
    }

    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let mut file = File::open(filename).map_err(|e| {
            error!("无法打开配置文件{}：{}", filename, e);
            Exception::Config(format!("no such file {}: {}", filename, e))
        })?;
        let mut str_val = String::new();
        file.read_to_string(&mut str_val)
            .map_err(|e| Exception::Config(format!("Error Reading file: {}", e)))?;
        Self::from_toml_str(&str_val)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, Exception> {
        let mut raw_config: Config = toml::from_str(content).map_err(|e| {
            error!("无法成功从配置文件构建配置对象：{}", e);
            Exception::Config(e.to_string())
        })?;
        if raw_config.worker_threads == 0 {
            raw_config.worker_threads = num_cpus::get();
        }
        raw_config.validate()?;
        Ok(raw_config)
    }

    /// 代理只允许监听回环地址
    pub fn validate(&self) -> Result<(), Exception> {
        if self.cache_root.trim().is_empty() {
            return Err(Exception::Config("cache_root不能为空".to_string()));
        }
        if self.meta_store.trim().is_empty() {
            return Err(Exception::Config("meta_store不能为空".to_string()));
        }
        if self.worker_slots == 0 {
            return Err(Exception::Config("worker_slots必须大于0".to_string()));
        }
        let loopback = self.host == "localhost"
            || self
                .host
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false);
        if !loopback {
            return Err(Exception::Config(format!(
                "host必须是回环地址，当前为{}",
                self.host
            )));
        }
        Ok(())
    }
}

impl Config {
    pub fn cache_root(&self) -> &str {
        &self.cache_root
    }

    pub fn meta_store(&self) -> &str {
        &self.meta_store
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn worker_slots(&self) -> usize {
        self.worker_slots
    }

    pub fn max_cache_size(&self) -> u64 {
        self.max_cache_size
    }

    pub fn max_cache_files(&self) -> usize {
        self.max_cache_files
    }

    pub fn reconnect(&self) -> ReconnectPolicy {
        self.reconnect
    }

    pub fn origin(&self) -> &OriginConfig {
        &self.origin
    }
}
