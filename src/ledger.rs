//! 描述符编号账本
//!
//! 每次入库追加一行 `<lat>,<lng>,<起始编号>,<结束编号>`，编号在所有地点之间全局连续。

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow, ensure};
use log::{info, warn};
use serde::Serialize;

use crate::location::LocationTag;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub location: LocationTag,
    pub start_bin: u64,
    /// 包含在内
    pub end_bin: u64,
}

impl LedgerEntry {
    pub fn count(&self) -> u64 {
        self.end_bin - self.start_bin + 1
    }

    pub fn contains(&self, bin: u64) -> bool {
        (self.start_bin..=self.end_bin).contains(&bin)
    }
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.location, self.start_bin, self.end_bin)
    }
}

impl FromStr for LedgerEntry {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let fields = line.trim().split(',').map(str::trim).collect::<Vec<_>>();
        let [lat, lng, start, end] = fields.as_slice() else {
            return Err(anyhow!("账本行应当有 4 个字段: {line}"));
        };
        let location = LocationTag::new(lat.parse()?, lng.parse()?)?;
        let (start_bin, end_bin) = (start.parse::<u64>()?, end.parse::<u64>()?);
        ensure!(end_bin >= start_bin, "结束编号小于起始编号: {line}");
        Ok(Self { location, start_bin, end_bin })
    }
}

/// 追加写入的账本文件，同一进程内写入由互斥锁串行化
pub struct BinLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl BinLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("读取账本失败: {}", self.path.display())),
        }
    }

    /// 所有可以解析的记录，无法解析的行会被跳过
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let content = self.read()?;
        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match line.parse() {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("跳过无法解析的账本行 {line:?}: {e}");
                    None
                }
            })
            .collect();
        Ok(entries)
    }

    /// 最后一条记录，文件不存在、为空或最后一行无法解析时为 None
    pub fn last_entry(&self) -> Result<Option<LedgerEntry>> {
        let content = self.read()?;
        Ok(last_entry(&content))
    }

    /// 查找包含某个全局描述符编号的记录
    pub fn find_bin(&self, bin: u64) -> Result<Option<LedgerEntry>> {
        Ok(self.entries()?.into_iter().find(|e| e.contains(bin)))
    }

    /// 开始一次入库，在返回的分配器提交或被丢弃之前，其他写入者会被阻塞
    pub fn begin(&self) -> Result<BinAllocator<'_>> {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let content = self.read()?;
        let next_bin = last_entry(&content).map_or(0, |e| e.end_bin + 1);
        Ok(BinAllocator {
            path: &self.path,
            next_bin,
            needs_newline: !content.is_empty() && !content.ends_with('\n'),
            _guard: guard,
        })
    }
}

fn last_entry(content: &str) -> Option<LedgerEntry> {
    let line = content.lines().rev().find(|line| !line.trim().is_empty())?;
    match line.parse() {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!("账本最后一行无法解析，编号从 0 开始 {line:?}: {e}");
            None
        }
    }
}

/// 一次入库事务持有的编号分配器
pub struct BinAllocator<'a> {
    path: &'a Path,
    next_bin: u64,
    needs_newline: bool,
    _guard: MutexGuard<'a, ()>,
}

impl BinAllocator<'_> {
    /// 本次入库的起始编号
    pub fn next_bin(&self) -> u64 {
        self.next_bin
    }

    /// 为 `count` 个描述符分配编号并写入账本
    pub fn commit(self, location: LocationTag, count: usize) -> Result<LedgerEntry> {
        ensure!(count > 0, "不能为 0 个描述符分配编号");
        let entry = LedgerEntry {
            location,
            start_bin: self.next_bin,
            end_bin: self.next_bin + count as u64 - 1,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path)
            .with_context(|| format!("打开账本失败: {}", self.path.display()))?;
        if self.needs_newline {
            writeln!(file)?;
        }
        writeln!(file, "{entry}")?;
        file.sync_all()?;

        info!("{location}: 分配编号 {} - {}", entry.start_bin, entry.end_bin);
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tempfile::TempDir;

    use super::*;

    fn tag(lat: f64, lng: f64) -> LocationTag {
        LocationTag::new(lat, lng).unwrap()
    }

    #[test]
    fn test_consecutive_ranges() {
        let dir = TempDir::new().unwrap();
        let ledger = BinLedger::new(dir.path().join("bins.txt"));

        let counts = [10, 5, 20];
        let entries = counts
            .iter()
            .enumerate()
            .map(|(i, &count)| ledger.begin().unwrap().commit(tag(i as f64, 1.5), count).unwrap())
            .collect::<Vec<_>>();
        let ranges = entries.iter().map(|e| (e.start_bin, e.end_bin)).collect::<Vec<_>>();
        assert_eq!(ranges, vec![(0, 9), (10, 14), (15, 34)]);

        let content = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(content, "0,1.5,0,9\n1,1.5,10,14\n2,1.5,15,34\n");
        assert_eq!(ledger.entries().unwrap(), entries);
    }

    #[test]
    fn test_missing_file_starts_at_zero() {
        let dir = TempDir::new().unwrap();
        let ledger = BinLedger::new(dir.path().join("nested").join("bins.txt"));
        assert_eq!(ledger.last_entry().unwrap(), None);
        assert_eq!(ledger.begin().unwrap().next_bin(), 0);
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_last_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bins.txt");
        fs::write(&path, "1.0,2.0,0,9\n1.0,2.0,oops").unwrap();
        let ledger = BinLedger::new(&path);

        assert_eq!(ledger.begin().unwrap().next_bin(), 0);
        assert_eq!(ledger.entries().unwrap().len(), 1);

        // 结束编号小于起始编号同样视为损坏
        fs::write(&path, "1.0,2.0,10,3\n").unwrap();
        assert_eq!(ledger.begin().unwrap().next_bin(), 0);
    }

    #[test]
    fn test_missing_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bins.txt");
        fs::write(&path, "1,2,0,9").unwrap();
        let ledger = BinLedger::new(&path);

        let entry = ledger.begin().unwrap().commit(tag(3.0, 4.0), 2).unwrap();
        assert_eq!((entry.start_bin, entry.end_bin), (10, 11));
        assert_eq!(fs::read_to_string(&path).unwrap(), "1,2,0,9\n3,4,10,11\n");
    }

    #[test]
    fn test_abandoned_and_empty_commits() {
        let dir = TempDir::new().unwrap();
        let ledger = BinLedger::new(dir.path().join("bins.txt"));

        drop(ledger.begin().unwrap());
        assert!(!ledger.path().exists());

        assert!(ledger.begin().unwrap().commit(tag(0.0, 0.0), 0).is_err());
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn test_find_bin() {
        let dir = TempDir::new().unwrap();
        let ledger = BinLedger::new(dir.path().join("bins.txt"));
        ledger.begin().unwrap().commit(tag(1.0, 1.0), 10).unwrap();
        ledger.begin().unwrap().commit(tag(2.0, 2.0), 5).unwrap();

        assert_eq!(ledger.find_bin(0).unwrap().unwrap().location, tag(1.0, 1.0));
        assert_eq!(ledger.find_bin(12).unwrap().unwrap().location, tag(2.0, 2.0));
        assert!(ledger.find_bin(15).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_writers() {
        let dir = TempDir::new().unwrap();
        let ledger = BinLedger::new(dir.path().join("bins.txt"));

        thread::scope(|s| {
            for i in 0..8 {
                let ledger = &ledger;
                s.spawn(move || ledger.begin().unwrap().commit(tag(i as f64, 0.0), 7).unwrap());
            }
        });

        let mut entries = ledger.entries().unwrap();
        assert_eq!(entries.len(), 8);
        entries.sort_by_key(|e| e.start_bin);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.start_bin, i as u64 * 7);
            assert_eq!(e.count(), 7);
        }
    }
}
