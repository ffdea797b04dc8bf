use std::path::{Path, PathBuf};

use indicatif::ProgressStyle;
use regex::Regex;
use walkdir::WalkDir;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// 按冒号分隔文件名列表，忽略空项
pub fn split_names(names: &str) -> Vec<&str> {
    names.split(':').map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// 由逗号分隔的后缀名列表构造不区分大小写的匹配规则
pub fn suffix_regex(suffix: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?i)({})$", suffix.replace(',', "|")))
}

/// 递归扫描目录下后缀名符合要求的文件，按路径排序
pub fn scan_images(path: impl AsRef<Path>, re_suf: &Regex) -> Vec<PathBuf> {
    let mut entries = WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| {
            entry.ok().and_then(|entry| {
                let path = entry.path();
                let ext = path.extension()?.to_string_lossy();
                (path.is_file() && re_suf.is_match(&ext)).then(|| path.to_path_buf())
            })
        })
        .collect::<Vec<_>>();
    entries.sort();
    entries
}
