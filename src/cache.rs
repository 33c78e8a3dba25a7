// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 文件缓存
//!
//! 单个 URL 对应磁盘上的一个文件：
//! - 未完成时文件名带 `.download` 后缀，只允许在末尾追加；
//! - 完成时重命名为最终文件名，此后只读。
//!
//! 单写多读。可读长度 `available` 是一个原子计数，写入方在数据落盘后才推进它，
//! 读取方先采样它再读，因此永远看不到尚未写入的字节。

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use log::{debug, error, info, warn};

use crate::{
    disk_usage::{touch_safely, DiskUsage},
    exception::Exception,
    param::TEMP_POSTFIX,
};

struct CacheFileHandle {
    file: Option<File>,
    path: PathBuf,
}

pub struct FileCache {
    handle: Mutex<CacheFileHandle>,
    available: AtomicU64,
    completed: AtomicBool,
    disk_usage: Arc<dyn DiskUsage>,
}

impl FileCache {
    /// 以最终文件名 `file` 打开缓存。
    ///
    /// 最终文件存在即视为已完成；否则打开（或创建）对应的 `.download` 文件，
    /// 已有的内容作为续传的前缀保留。
    pub fn open(file: &Path, disk_usage: Arc<dyn DiskUsage>) -> Result<Self, Exception> {
        if let Some(dir) = file.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let completed = file.exists();
        let path = if completed {
            file.to_path_buf()
        } else {
            partial_path(file)
        };
        let data_file = if completed {
            File::open(&path)
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
        }
        .map_err(|e| {
            error!("无法使用{}作为磁盘缓存：{}", path.display(), e);
            Exception::from(e)
        })?;
        let available = data_file.metadata()?.len();
        debug!(
            "打开缓存文件{}，已缓存{} bytes，已完成：{}",
            path.display(),
            available,
            completed
        );

        Ok(Self {
            handle: Mutex::new(CacheFileHandle {
                file: Some(data_file),
                path,
            }),
            available: AtomicU64::new(available),
            completed: AtomicBool::new(completed),
            disk_usage,
        })
    }

    /// 不创建任何文件，只探测某个最终文件名当前可用的缓存长度。
    pub fn cached_length(file: &Path) -> u64 {
        fs::metadata(file)
            .or_else(|_| fs::metadata(partial_path(file)))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// 当前文件路径（未完成时为 `.download` 文件）
    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    pub fn append(&self, data: &[u8]) -> Result<(), Exception> {
        let mut handle = self.lock();
        if self.is_completed() {
            return Err(Exception::CacheCompleted);
        }
        let end = self.available();
        let file = handle.file.as_mut().ok_or(Exception::CacheCompleted)?;
        file.seek(SeekFrom::Start(end))?;
        file.write_all(data)?;
        self.available
            .store(end + data.len() as u64, Ordering::Release);
        Ok(())
    }

    /// 从 `offset` 读取至多 `buf.len()` 字节。
    ///
    /// 只要 `offset + buf.len() <= available()` 就一定读满；越过可读末尾返回 0。
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, Exception> {
        let available = self.available();
        if offset >= available {
            return Ok(0);
        }
        let len = buf.len().min((available - offset) as usize);
        let mut handle = self.lock();
        let path = handle.path.clone();
        let file = handle
            .file
            .as_mut()
            .ok_or_else(|| Exception::CacheIo(format!("{} is closed", path.display())))?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..len]).map_err(|e| {
            error!(
                "从{}读取{} bytes（偏移{}，文件{} bytes）失败：{}",
                path.display(),
                len,
                offset,
                available,
                e
            );
            Exception::from(e)
        })?;
        Ok(len)
    }

    /// 将 `.download` 文件重命名为最终文件名。重复调用无副作用。
    pub fn complete(&self) -> Result<(), Exception> {
        let mut handle = self.lock();
        if self.is_completed() {
            return Ok(());
        }
        if let Some(file) = handle.file.take() {
            file.sync_all()?;
        }
        let completed_path = final_path(&handle.path);
        if let Err(e) = fs::rename(&handle.path, &completed_path) {
            error!(
                "无法将{}重命名为{}：{}",
                handle.path.display(),
                completed_path.display(),
                e
            );
            handle.file = Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&handle.path)?,
            );
            return Err(e.into());
        }
        handle.file = Some(File::open(&completed_path)?);
        handle.path = completed_path.clone();
        self.completed.store(true, Ordering::Release);
        drop(handle);

        info!("缓存文件{}已完成", completed_path.display());
        touch_safely(self.disk_usage.as_ref(), &completed_path);
        Ok(())
    }

    /// 刷盘并通过磁盘策略 touch 当前文件。
    pub fn close(&self) -> Result<(), Exception> {
        let handle = self.lock();
        if let Some(file) = handle.file.as_ref() {
            file.sync_data()?;
        }
        let path = handle.path.clone();
        drop(handle);
        if self.is_completed() {
            touch_safely(self.disk_usage.as_ref(), &path);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, CacheFileHandle> {
        match self.handle.lock() {
            Ok(lock) => lock,
            Err(poisoned) => {
                warn!("缓存文件锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }
}

/// 最终文件名对应的未完成文件名
pub fn partial_path(file: &Path) -> PathBuf {
    let mut name = file.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_POSTFIX);
    file.with_file_name(name)
}

fn final_path(partial: &Path) -> PathBuf {
    let name = partial.file_name().unwrap_or_default().to_string_lossy();
    let stripped = name
        .strip_suffix(TEMP_POSTFIX)
        .unwrap_or(&name[..])
        .to_string();
    partial.with_file_name(stripped)
}
