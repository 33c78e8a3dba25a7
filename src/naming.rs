// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 缓存文件命名。

use crate::{param::MAX_EXTENSION_LENGTH, util::compute_md5};

/// URL 到缓存文件名的映射，必须是纯函数。
pub trait FileNameGenerator: Send + Sync {
    fn generate(&self, url: &str) -> String;
}

/// 以 URL 的 MD5 作为文件名，并尽量保留原扩展名。
#[derive(Debug, Default, Clone, Copy)]
pub struct Md5FileNameGenerator;

impl FileNameGenerator for Md5FileNameGenerator {
    fn generate(&self, url: &str) -> String {
        let name = compute_md5(url);
        match extension(url) {
            Some(ext) => format!("{}.{}", name, ext),
            None => name,
        }
    }
}

// 最后一个 '.' 必须位于最后一个 '/' 之后，且扩展名不超过 4 个字符
fn extension(url: &str) -> Option<&str> {
    let dot = url.rfind('.')?;
    if let Some(slash) = url.rfind('/') {
        if dot < slash {
            return None;
        }
    }
    let ext = &url[dot + 1..];
    if ext.is_empty() || ext.chars().count() > MAX_EXTENSION_LENGTH {
        None
    } else {
        Some(ext)
    }
}
