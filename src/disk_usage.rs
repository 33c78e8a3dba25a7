// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 磁盘占用策略
//!
//! 每次 `touch` 一个已完成的缓存文件后，按最近使用顺序淘汰最旧的已完成文件，
//! 直到总大小（或总文件数）不超过上限。
//!
//! 排序规则：本进程内从未被 touch 过的文件按修改时间升序排在前面，
//! 被 touch 过的文件按 LRU 表中的先后排在后面。这样即便文件系统的
//! 修改时间精度很粗，刚刚 touch 过的文件也不会先于更旧的文件被淘汰。
//! 未完成（`.download`）的文件既不计入总量，也永远不会被淘汰。

use std::{
    collections::HashMap,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
    time::SystemTime,
};

use log::{debug, info, warn};
use lru::LruCache;

use crate::param::TEMP_POSTFIX;

/// 缓存目录的占用管理。
pub trait DiskUsage: Send + Sync {
    /// 刷新文件的最近使用时间，然后执行淘汰。
    fn touch(&self, file: &Path) -> io::Result<()>;
}

/// 出错只记录日志、不向上传播的 touch
pub fn touch_safely(disk_usage: &dyn DiskUsage, file: &Path) {
    if let Err(e) = disk_usage.touch(file) {
        warn!("touch缓存文件{}失败：{}", file.display(), e);
    }
}

/// 不做任何限制
#[derive(Debug, Default)]
pub struct UnlimitedDiskUsage;

impl DiskUsage for UnlimitedDiskUsage {
    fn touch(&self, _file: &Path) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLimit {
    /// 已完成文件的总字节数上限
    TotalSize(u64),
    /// 已完成文件的总个数上限
    TotalCount(usize),
}

pub struct LruDiskUsage {
    limit: UsageLimit,
    recent: Mutex<LruCache<PathBuf, ()>>,
}

struct CachedEntry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

impl LruDiskUsage {
    pub fn new(limit: UsageLimit) -> Self {
        Self {
            limit,
            recent: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn total_size(max_bytes: u64) -> Self {
        Self::new(UsageLimit::TotalSize(max_bytes))
    }

    pub fn total_count(max_count: usize) -> Self {
        Self::new(UsageLimit::TotalCount(max_count))
    }

    pub fn limit(&self) -> UsageLimit {
        self.limit
    }

    fn accept(&self, total_size: u64, total_count: usize) -> bool {
        match self.limit {
            UsageLimit::TotalSize(max) => total_size <= max,
            UsageLimit::TotalCount(max) => total_count <= max,
        }
    }

    fn trim(&self, dir: &Path, touched: &Path, recent: &mut LruCache<PathBuf, ()>) -> io::Result<()> {
        let mut entries = completed_files(dir)?;

        // 清理已经不在磁盘上的记录
        let stale: Vec<PathBuf> = recent
            .iter()
            .map(|(p, _)| p.clone())
            .filter(|p| !entries.iter().any(|e| &e.path == p))
            .collect();
        for p in stale {
            recent.pop(&p);
        }

        // 最久未使用者排名为 0
        let rank: HashMap<&PathBuf, usize> = recent
            .iter()
            .rev()
            .enumerate()
            .map(|(i, (p, _))| (p, i))
            .collect();
        entries.sort_by(|a, b| match (rank.get(&a.path), rank.get(&b.path)) {
            (None, None) => a.modified.cmp(&b.modified),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        });
        drop(rank);

        let mut total_size: u64 = entries.iter().map(|e| e.size).sum();
        let mut total_count = entries.len();
        for entry in &entries {
            if self.accept(total_size, total_count) {
                break;
            }
            if entry.path == touched {
                continue;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    total_size -= entry.size;
                    total_count -= 1;
                    recent.pop(&entry.path);
                    info!(
                        "缓存文件{}已被淘汰，剩余{}个文件，共{} bytes",
                        entry.path.display(),
                        total_count,
                        total_size
                    );
                }
                Err(e) => {
                    warn!("无法删除缓存文件{}：{}", entry.path.display(), e);
                }
            }
        }
        Ok(())
    }
}

impl DiskUsage for LruDiskUsage {
    fn touch(&self, file: &Path) -> io::Result<()> {
        let dir = match file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = file
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a file path"))?;
        let path = dir.join(name);

        File::options()
            .write(true)
            .open(&path)?
            .set_modified(SystemTime::now())?;

        let mut recent = match self.recent.lock() {
            Ok(lock) => lock,
            Err(poisoned) => {
                warn!("LRU表锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        };
        recent.put(path.clone(), ());
        debug!("touch {}", path.display());
        self.trim(&dir, &path, &mut recent)
    }
}

fn completed_files(dir: &Path) -> io::Result<Vec<CachedEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !metadata.is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with(TEMP_POSTFIX) {
            continue;
        }
        entries.push(CachedEntry {
            path: entry.path(),
            size: metadata.len(),
            modified: metadata.modified()?,
        });
    }
    Ok(entries)
}
