//! 描述符索引库
//!
//! 每个地点对应配置目录下的一个 `<lat>,<lng>/` 目录，其中保存搜索索引和 `record.json`。
//! 新的索引先写入临时目录，完成后再替换旧目录，最后才写入账本。

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use log::{debug, info, warn};
use ndarray::Axis;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::features::{FeatureExtractor, Features};
use crate::knn::{AnyIndex, IndexKind, IndexParams, NeighborSearch};
use crate::ledger::BinLedger;
use crate::location::LocationTag;
use crate::rootsift::root_sift_all;
use crate::utils::split_names;

pub const RECORD_FILE: &str = "record.json";

/// 一个地点的索引描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub location: LocationTag,
    pub kind: IndexKind,
    /// 描述符维度
    pub dim: usize,
    /// 参与构建的图片文件名，顺序与 `counts` 一致
    pub images: Vec<String>,
    /// 每张图片的描述符数量
    pub counts: Vec<usize>,
    pub total: usize,
    pub start_bin: u64,
    pub end_bin: u64,
}

impl IndexRecord {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(RECORD_FILE);
        let file = File::open(&path).with_context(|| format!("无法打开 {}", path.display()))?;
        let record = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("无法解析 {}", path.display()))?;
        Ok(record)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let file = File::create(dir.join(RECORD_FILE))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// 列出 `root` 下所有的索引目录，按地点排序
    pub fn list(root: impl AsRef<Path>) -> Result<Vec<(PathBuf, IndexRecord)>> {
        let root = root.as_ref();
        if !root.exists() {
            return Ok(vec![]);
        }
        let mut records = vec![];
        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            let hidden = path.file_name().is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if hidden || !path.join(RECORD_FILE).is_file() {
                continue;
            }
            match IndexRecord::open(&path) {
                Ok(record) => records.push((path, record)),
                Err(e) => warn!("跳过损坏的索引 {}: {e:#}", path.display()),
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}

pub struct IndexStore {
    root: PathBuf,
    ledger: BinLedger,
    params: IndexParams,
}

impl IndexStore {
    pub fn new(root: impl Into<PathBuf>, ledger: BinLedger, params: IndexParams) -> Self {
        Self { root: root.into(), ledger, params }
    }

    pub fn ledger(&self) -> &BinLedger {
        &self.ledger
    }

    pub fn record_dir(&self, location: LocationTag) -> PathBuf {
        self.root.join(location.to_string())
    }

    /// 提取一组图片的特征并为它们建立索引
    ///
    /// 任何一张图片读取失败都不会写入任何内容；账本只在索引目录就位之后才追加。
    pub fn ingest(
        &self,
        location: LocationTag,
        paths: &[PathBuf],
        extractor: &mut dyn FeatureExtractor,
    ) -> Result<IndexRecord> {
        let mut features = extractor.detect_files(paths)?;
        root_sift_all(&mut features)?;

        let counts = features.iter().map(Features::len).collect::<Vec<_>>();
        let total = counts.iter().sum::<usize>();
        if total == 0 {
            return Err(PipelineError::NoFeatures { location: location.to_string() }.into());
        }
        let views = features.iter().map(|f| f.descriptors.view()).collect::<Vec<_>>();
        let data = ndarray::concatenate(Axis(0), &views)?;
        let dim = data.ncols();
        debug!("{location}: {} 张图片，共 {total} 个描述符", paths.len());

        let allocator = self.ledger.begin()?;
        let start_bin = allocator.next_bin();

        let index = AnyIndex::build(data, &self.params)?;
        let record = IndexRecord {
            location,
            kind: self.params.kind,
            dim,
            images: paths
                .iter()
                .map(|p| p.file_name().unwrap_or(p.as_os_str()).to_string_lossy().into_owned())
                .collect(),
            counts,
            total,
            start_bin,
            end_bin: start_bin + total as u64 - 1,
        };

        fs::create_dir_all(&self.root)?;
        let tmp = self.root.join(format!(".{location}.tmp"));
        stage_dir(&tmp, |dir| {
            index.save(dir)?;
            record.save(dir)
        })?;
        self.replace_dir(&tmp, &self.record_dir(location))?;

        let entry = allocator.commit(location, total)?;
        ensure!(entry.start_bin == start_bin, "账本编号与索引记录不一致");
        info!("{location}: 索引已保存，描述符编号 {} - {}", entry.start_bin, entry.end_bin);
        Ok(record)
    }

    /// 用 `src` 替换 `dst`，旧目录先改名再删除
    fn replace_dir(&self, src: &Path, dst: &Path) -> Result<()> {
        if dst.exists() {
            let name = dst.file_name().unwrap_or_default().to_string_lossy();
            let old = self.root.join(format!(".{name}.old"));
            if old.exists() {
                fs::remove_dir_all(&old)?;
            }
            fs::rename(dst, &old)?;
            fs::rename(src, dst)?;
            fs::remove_dir_all(&old)?;
        } else {
            fs::rename(src, dst)?;
        }
        Ok(())
    }
}

/// 在空的临时目录 `tmp` 中写入内容，写入失败时删除该目录
fn stage_dir(tmp: &Path, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    if tmp.exists() {
        fs::remove_dir_all(tmp)?;
    }
    fs::create_dir(tmp)?;
    if let Err(e) = write(tmp) {
        if let Err(cleanup) = fs::remove_dir_all(tmp) {
            warn!("无法删除临时目录 {}: {cleanup}", tmp.display());
        }
        return Err(e);
    }
    Ok(())
}

/// 保存一批同一地点的图片的特征
///
/// `img_filenames` 为冒号分隔的文件名列表，地点取自第一个文件名的 `<lat>,<lng>` 前缀，
/// 每个文件名与 `img_folder` 拼接得到图片路径。
pub fn save_features(
    img_folder: impl AsRef<Path>,
    img_filenames: &str,
    out_folder: impl AsRef<Path>,
    ledger_file: impl AsRef<Path>,
    extractor: &mut dyn FeatureExtractor,
    params: IndexParams,
) -> Result<IndexRecord> {
    let names = split_names(img_filenames);
    let Some(first) = names.first() else {
        return Err(PipelineError::InvalidLocation(img_filenames.to_string()).into());
    };
    let location = LocationTag::from_filename(first)?;
    let paths = names.iter().map(|name| img_folder.as_ref().join(name)).collect::<Vec<_>>();

    let store = IndexStore::new(out_folder.as_ref(), BinLedger::new(ledger_file.as_ref()), params);
    store.ingest(location, &paths, extractor)
}

/// 按文件名中的地点对图片分组，保持地点第一次出现的顺序，文件名无法解析的图片会被跳过
pub fn group_by_location(paths: impl IntoIterator<Item = PathBuf>) -> Vec<(LocationTag, Vec<PathBuf>)> {
    let mut groups: Vec<(LocationTag, Vec<PathBuf>)> = vec![];
    let mut positions = HashMap::new();
    for path in paths {
        let location = match LocationTag::from_filename(&path) {
            Ok(location) => location,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };
        let pos = *positions.entry(location.to_string()).or_insert_with(|| {
            groups.push((location, vec![]));
            groups.len() - 1
        });
        groups[pos].1.push(path);
    }
    groups
}

#[cfg(test)]
mod tests {
    use std::hash::{DefaultHasher, Hash, Hasher};

    use image::GrayImage;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    use super::*;
    use crate::features::KeyPoint;
    use crate::recogniser::Recogniser;

    /// 根据文件名生成固定的描述符，文件名包含 `missing` 时读取失败，包含 `blank` 时没有特征点
    struct FakeExtractor;

    impl FeatureExtractor for FakeExtractor {
        fn detect_and_compute(&mut self, image: &GrayImage) -> Result<Features> {
            Ok(Features::empty(image.width(), image.height(), 8))
        }

        fn max_size(&self) -> (u32, u32) {
            (100, 100)
        }

        fn detect_file(&mut self, path: &Path) -> Result<Features> {
            let name = path.to_string_lossy();
            if name.contains("missing") {
                return Err(PipelineError::ImageRead { path: path.to_path_buf() }.into());
            }
            if name.contains("blank") {
                return Ok(Features::empty(100, 100, 8));
            }
            let mut hasher = DefaultHasher::new();
            name.hash(&mut hasher);
            let mut rng = StdRng::seed_from_u64(hasher.finish());
            let n = rng.random_range(5..15);
            Ok(Features {
                keypoints: (0..n).map(|i| KeyPoint::new(i as f32, i as f32)).collect(),
                descriptors: Array2::from_shape_fn((n, 8), |_| rng.random_range(0.1f32..1.0)),
                width: 100,
                height: 100,
            })
        }
    }

    fn store(dir: &Path) -> IndexStore {
        IndexStore::new(dir, BinLedger::new(dir.join("bins.txt")), IndexParams::default())
    }

    fn tag(s: &str) -> LocationTag {
        s.parse().unwrap()
    }

    #[test]
    fn test_ingest() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        let paths = vec![PathBuf::from("1,2,a.jpg"), PathBuf::from("1,2,b.jpg")];

        let record = store.ingest(tag("1,2"), &paths, &mut FakeExtractor).unwrap();
        assert_eq!(record.images, vec!["1,2,a.jpg", "1,2,b.jpg"]);
        assert_eq!(record.total, record.counts.iter().sum::<usize>());
        assert_eq!((record.start_bin, record.end_bin), (0, record.total as u64 - 1));
        assert_eq!(record.dim, 8);

        let saved = IndexRecord::open(store.record_dir(tag("1,2"))).unwrap();
        assert_eq!(saved, record);
        let index = AnyIndex::open(&store.record_dir(tag("1,2")), &IndexParams::default()).unwrap();
        assert_eq!(index.len(), record.total);

        let entries = store.ledger().entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].end_bin, record.end_bin);
    }

    #[test]
    fn test_ingest_hnsw_and_query() {
        let dir = TempDir::new().unwrap();
        let params = IndexParams { kind: IndexKind::Hnsw, ..Default::default() };
        let store = IndexStore::new(dir.path(), BinLedger::new(dir.path().join("bins.txt")), params.clone());
        let paths = (0..6).map(|i| PathBuf::from(format!("7,8,{i}.jpg"))).collect::<Vec<_>>();

        let record = store.ingest(tag("7,8"), &paths, &mut FakeExtractor).unwrap();
        assert_eq!(record.kind, IndexKind::Hnsw);
        assert!(store.record_dir(tag("7,8")).join("hnsw.hnsw.graph").is_file());

        let mut recogniser =
            Recogniser::open(store.record_dir(tag("7,8")), Box::new(FakeExtractor), &IndexParams::default(), 0.8)
                .unwrap();
        assert_eq!(recogniser.record(), &record);
        assert_eq!(recogniser.query(&paths[2]).unwrap(), record.counts[2]);
    }

    #[test]
    fn test_failed_write_removes_staging_dir() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join(".1,2.tmp");

        let err = stage_dir(&tmp, |d| {
            fs::write(d.join("descriptors.npy"), b"partial")?;
            anyhow::bail!("disk full")
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(!tmp.exists());

        stage_dir(&tmp, |d| Ok(fs::write(d.join(RECORD_FILE), b"{}")?)).unwrap();
        assert!(tmp.join(RECORD_FILE).is_file());
    }

    #[test]
    fn test_failed_image_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        let paths = vec![PathBuf::from("1,2,a.jpg"), PathBuf::from("1,2,missing.jpg")];

        let err = store.ingest(tag("1,2"), &paths, &mut FakeExtractor).unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::ImageRead { .. })));
        assert!(!store.record_dir(tag("1,2")).exists());
        assert!(!store.ledger().path().exists());
    }

    #[test]
    fn test_no_features() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        let paths = vec![PathBuf::from("1,2,blank.jpg")];

        let err = store.ingest(tag("1,2"), &paths, &mut FakeExtractor).unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::NoFeatures { .. })));
        assert!(store.ledger().entries().unwrap().is_empty());
    }

    #[test]
    fn test_reingest_supersedes() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());

        let first = store.ingest(tag("3,4"), &[PathBuf::from("3,4,a.jpg")], &mut FakeExtractor).unwrap();
        let second = store
            .ingest(tag("3,4"), &[PathBuf::from("3,4,b.jpg"), PathBuf::from("3,4,blank.jpg")], &mut FakeExtractor)
            .unwrap();

        assert_eq!(second.start_bin, first.end_bin + 1);
        assert_eq!(second.counts[1], 0);
        assert_eq!(IndexRecord::open(store.record_dir(tag("3,4"))).unwrap(), second);

        let records = IndexRecord::list(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(store.ledger().entries().unwrap().len(), 2);
    }

    #[test]
    fn test_save_features() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let ledger = dir.path().join("bins.txt");

        let a = save_features("/photos", "10,20,x.jpg:10,20,y.jpg", &out, &ledger, &mut FakeExtractor, IndexParams::default())
            .unwrap();
        let b = save_features("/photos", "11,21,z.jpg", &out, &ledger, &mut FakeExtractor, IndexParams::default())
            .unwrap();

        assert_eq!(a.location, tag("10,20"));
        assert_eq!(a.images.len(), 2);
        assert_eq!(b.start_bin, a.end_bin + 1);
        assert!(out.join("10,20").join(RECORD_FILE).is_file());
        assert!(out.join("11,21").join(RECORD_FILE).is_file());

        let content = fs::read_to_string(&ledger).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], format!("10,20,0,{}", a.end_bin));
        assert_eq!(lines[1], format!("11,21,{},{}", b.start_bin, b.end_bin));

        assert!(save_features("/photos", "", &out, &ledger, &mut FakeExtractor, IndexParams::default()).is_err());
    }

    #[test]
    fn test_group_by_location() {
        let paths = ["5,6,b.jpg", "1,2,a.jpg", "nolocation.jpg", "5,6,a.jpg", "5.0,6.0,c.jpg"]
            .into_iter()
            .map(PathBuf::from);
        let groups = group_by_location(paths);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, tag("5,6"));
        assert_eq!(groups[0].1.len(), 3);
        assert_eq!(groups[1].0, tag("1,2"));
    }
}
