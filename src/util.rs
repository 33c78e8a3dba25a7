// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use md5::{Digest, Md5};
use percent_encoding::percent_decode_str;
use url::form_urlencoded;

use crate::exception::Exception;

/// 将源站 URL 编码为代理路径段（空格编码为 `+`，保留字符全部百分号编码）。
pub fn encode(url: &str) -> String {
    form_urlencoded::byte_serialize(url.as_bytes()).collect()
}

/// `encode` 的逆操作。非法的 UTF-8 序列视为非法请求。
pub fn decode(encoded: &str) -> Result<String, Exception> {
    let plus_as_space = encoded.replace('+', " ");
    percent_decode_str(&plus_as_space)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| Exception::BadRequest)
}

/// 小写十六进制 MD5 摘要
pub fn compute_md5(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    format!("{:x}", digest)
}

/// 缓存进度百分比：源长度为 0 视为 100，否则向下取整。
pub fn percents(cache_available: u64, source_length: i64) -> i32 {
    if source_length == 0 {
        return 100;
    }
    (cache_available as f64 / source_length as f64 * 100.0) as i32
}

pub fn format_file_size(size: u64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < units.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.1} {}", size, units[unit_index])
}
