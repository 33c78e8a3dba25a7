// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 媒体元数据存储
//!
//! 每个源站 URL 对应一条 `{length, mime}` 记录。`length = -1` 或 `mime` 为空表示未知，
//! 此时协调器会向源站探测并覆盖写入。

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use log::{debug, error, warn};
use serde_derive::{Deserialize, Serialize};

use crate::exception::Exception;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MediaMeta {
    pub url: String,
    #[serde(default = "unknown_length")]
    pub length: i64,
    #[serde(default)]
    pub mime: String,
}

fn unknown_length() -> i64 {
    -1
}

impl MediaMeta {
    pub fn new(url: &str, length: i64, mime: &str) -> Self {
        Self {
            url: url.to_string(),
            length,
            mime: mime.to_string(),
        }
    }

    pub fn unknown_length(&self) -> bool {
        self.length < 0
    }

    pub fn unknown_mime(&self) -> bool {
        self.mime.is_empty()
    }

    pub fn unknown(&self) -> bool {
        self.unknown_length() || self.unknown_mime()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, url: &str) -> Result<Option<MediaMeta>, Exception>;

    async fn put(&self, url: &str, meta: MediaMeta) -> Result<(), Exception>;
}

/// 空存储：什么都不记住，每次都需要探测源站。
#[derive(Debug, Default)]
pub struct NoMetaStore;

#[async_trait]
impl MetaStore for NoMetaStore {
    async fn get(&self, _url: &str) -> Result<Option<MediaMeta>, Exception> {
        Ok(None)
    }

    async fn put(&self, _url: &str, _meta: MediaMeta) -> Result<(), Exception> {
        Ok(())
    }
}

/// 纯内存存储，进程退出即丢失。
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    map: Mutex<HashMap<String, MediaMeta>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, url: &str) -> Result<Option<MediaMeta>, Exception> {
        let map = self.map.lock().map_err(|e| Exception::MetaStore(e.to_string()))?;
        Ok(map.get(url).cloned())
    }

    async fn put(&self, url: &str, meta: MediaMeta) -> Result<(), Exception> {
        let mut map = self.map.lock().map_err(|e| Exception::MetaStore(e.to_string()))?;
        map.insert(url.to_string(), meta);
        Ok(())
    }
}

/// 以 JSON 文件持久化的存储。
///
/// 启动时整体载入，每次 `put` 后整体写回：先写临时文件再重命名，
/// 避免写到一半崩溃留下损坏的文件。
pub struct JsonMetaStore {
    path: PathBuf,
    map: Mutex<HashMap<String, MediaMeta>>,
}

impl JsonMetaStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Exception> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Exception::MetaStore(e.to_string()))?;
            }
        }
        let map = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<MediaMeta>>(&content) {
                Ok(list) => list.into_iter().map(|m| (m.url.clone(), m)).collect(),
                Err(e) => {
                    warn!("元数据文件{}无法解析，将重新建立：{}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!("从{}载入{}条媒体元数据", path.display(), map.len());
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    fn persist(&self, map: &HashMap<String, MediaMeta>) -> Result<(), Exception> {
        let mut list: Vec<&MediaMeta> = map.values().collect();
        list.sort_by(|a, b| a.url.cmp(&b.url));
        let json =
            serde_json::to_vec_pretty(&list).map_err(|e| Exception::MetaStore(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| Exception::MetaStore(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            error!("无法写回元数据文件{}：{}", self.path.display(), e);
            Exception::MetaStore(e.to_string())
        })
    }
}

#[async_trait]
impl MetaStore for JsonMetaStore {
    async fn get(&self, url: &str) -> Result<Option<MediaMeta>, Exception> {
        let map = self.map.lock().map_err(|e| Exception::MetaStore(e.to_string()))?;
        Ok(map.get(url).cloned())
    }

    async fn put(&self, url: &str, meta: MediaMeta) -> Result<(), Exception> {
        let mut map = self.map.lock().map_err(|e| Exception::MetaStore(e.to_string()))?;
        map.insert(url.to_string(), meta);
        self.persist(&map)
    }
}
