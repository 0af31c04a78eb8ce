//! Path processing utility functions / 路径处理工具函数

use chrono::{DateTime, Utc};

/// Ticks between 0001-01-01 and the Unix epoch (100ns units) / 纪元偏移
const TICKS_AT_UNIX_EPOCH: i64 = 621_355_968_000_000_000;

/// Normalize a logical storage path / 规范化存储路径
/// 1. Replace backslashes with forward slashes / 将反斜杠替换为正斜杠
/// 2. Drop empty and `.` segments, resolve `..` / 清理 . 和 ..
/// 3. No leading or trailing slash; root is "" / 不以 / 开头
pub fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }

    parts.join("/")
}

/// Join two path fragments and normalize / 拼接路径
pub fn join_path(base: &str, child: &str) -> String {
    normalize_path(&format!("{}/{}", base, child))
}

/// Last segment of a path / 获取文件名
pub fn file_name(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent of a normalized path ("" for top level) / 获取父路径
pub fn parent_path(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

/// Prefix matching every object below a folder / 目录前缀
pub fn folder_prefix(path: &str) -> String {
    let path = normalize_path(path);
    if path.is_empty() {
        String::new()
    } else {
        format!("{}/", path)
    }
}

/// Check if sub_path is path itself or lies below it / 判断 sub_path 是否是 path 的子路径
pub fn is_sub_path(path: &str, sub_path: &str) -> bool {
    let path = normalize_path(path);
    let sub_path = normalize_path(sub_path);

    if path.is_empty() || path == sub_path {
        return true;
    }

    sub_path.starts_with(&format!("{}/", path))
}

/// Get file extension (lowercase) / 获取文件扩展名
pub fn get_ext(path: &str) -> String {
    std::path::Path::new(file_name(path))
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Guess a content type when the client sent none / 猜测内容类型
pub fn guess_content_type(path: &str) -> String {
    mime_guess::from_path(file_name(path))
        .first_or_octet_stream()
        .to_string()
}

/// Integer ticks persisted as the upload timestamp tag / 上传时间戳
pub fn to_ticks(time: DateTime<Utc>) -> i64 {
    let micros = time.timestamp_micros();
    micros * 10 + TICKS_AT_UNIX_EPOCH
}
