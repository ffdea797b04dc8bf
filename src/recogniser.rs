//! 地点识别
//!
//! 查询图片与某个地点的索引之间通过比值检验的匹配数量即为该地点的得分，不做几何校验。

use std::path::Path;

use anyhow::{Result, ensure};
use log::{debug, info};
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use serde::Serialize;

use crate::features::{FeatureExtractor, Features};
use crate::knn::{AnyIndex, IndexParams, NeighborSearch};
use crate::location::LocationTag;
use crate::matcher::{knn_match, ratio_filter};
use crate::rootsift::root_sift;
use crate::store::IndexRecord;

/// 已加载到内存中的单个地点的索引，只读
struct LocationIndex {
    record: IndexRecord,
    index: AnyIndex,
}

impl LocationIndex {
    fn open(dir: &Path, params: &IndexParams) -> Result<Self> {
        let record = IndexRecord::open(dir)?;
        let params = IndexParams { kind: record.kind, ..params.clone() };
        let index = AnyIndex::open(dir, &params)?;
        ensure!(
            index.len() == record.total,
            "{}: 索引中有 {} 个描述符，记录中为 {}",
            dir.display(),
            index.len(),
            record.total
        );
        debug!("加载索引 {}: {} 个描述符", record.location, record.total);
        Ok(Self { record, index })
    }

    fn count_matches(&self, descriptors: ArrayView2<f32>, ratio: f32) -> Result<usize> {
        let knn = knn_match(descriptors, &self.index, 2)?;
        Ok(ratio_filter(&knn, ratio).len())
    }
}

/// 提取查询图片的描述符并做 RootSIFT 变换，没有特征点时返回 None
fn prepare(features: &Features) -> Result<Option<Array2<f32>>> {
    if features.is_empty() {
        return Ok(None);
    }
    let mut descriptors = features.descriptors.clone();
    root_sift(&mut descriptors)?;
    Ok(Some(descriptors))
}

/// 针对单个地点的识别服务
pub struct Recogniser {
    location: LocationIndex,
    extractor: Box<dyn FeatureExtractor>,
    ratio: f32,
}

impl Recogniser {
    /// 加载 `dir` 下的索引，之后的查询都复用它
    pub fn open(
        dir: impl AsRef<Path>,
        extractor: Box<dyn FeatureExtractor>,
        params: &IndexParams,
        ratio: f32,
    ) -> Result<Self> {
        let location = LocationIndex::open(dir.as_ref(), params)?;
        Ok(Self { location, extractor, ratio })
    }

    pub fn record(&self) -> &IndexRecord {
        &self.location.record
    }

    /// 返回查询图片与该地点之间通过比值检验的匹配数量
    pub fn query(&mut self, image: impl AsRef<Path>) -> Result<usize> {
        let features = self.extractor.detect_file(image.as_ref())?;
        self.query_features(&features)
    }

    pub fn query_features(&self, features: &Features) -> Result<usize> {
        let Some(descriptors) = prepare(features)? else {
            return Ok(0);
        };
        let count = self.location.count_matches(descriptors.view(), self.ratio)?;
        debug!("{}: {count} 个匹配", self.location.record.location);
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ranked {
    pub location: LocationTag,
    pub count: usize,
}

/// 在所有地点中查找与查询图片最匹配的地点
pub struct Locator {
    locations: Vec<LocationIndex>,
    extractor: Box<dyn FeatureExtractor>,
    ratio: f32,
}

impl Locator {
    /// 加载 `root` 下的全部地点索引
    pub fn open(
        root: impl AsRef<Path>,
        extractor: Box<dyn FeatureExtractor>,
        params: &IndexParams,
        ratio: f32,
    ) -> Result<Self> {
        let locations = IndexRecord::list(root)?
            .into_iter()
            .map(|(dir, _)| LocationIndex::open(&dir, params))
            .collect::<Result<Vec<_>>>()?;
        info!("已加载 {} 个地点", locations.len());
        Ok(Self { locations, extractor, ratio })
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// 所有地点按匹配数量从大到小排列，数量相同时保持地点顺序
    pub fn locate(&mut self, image: impl AsRef<Path>) -> Result<Vec<Ranked>> {
        let features = self.extractor.detect_file(image.as_ref())?;
        self.locate_features(&features)
    }

    pub fn locate_features(&self, features: &Features) -> Result<Vec<Ranked>> {
        let descriptors = prepare(features)?;
        let ratio = self.ratio;
        let mut ranked = self
            .locations
            .par_iter()
            .map(|loc| -> Result<Ranked> {
                let count = match &descriptors {
                    Some(d) => loc.count_matches(d.view(), ratio)?,
                    None => 0,
                };
                Ok(Ranked { location: loc.record.location, count })
            })
            .collect::<Result<Vec<_>>>()?;
        ranked.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(ranked)
    }

    /// 匹配数量最多的地点，所有地点都没有匹配时为 None
    pub fn best(&mut self, image: impl AsRef<Path>) -> Result<Option<Ranked>> {
        Ok(self.locate(image)?.into_iter().next().filter(|r| r.count > 0))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use image::GrayImage;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    use super::*;
    use crate::features::KeyPoint;
    use crate::ledger::BinLedger;
    use crate::store::IndexStore;

    /// 文件名中的数字作为随机种子，相同种子得到相同的描述符
    struct SeededExtractor;

    fn seeded_features(seed: u64) -> Features {
        let mut rng = StdRng::seed_from_u64(seed);
        Features {
            keypoints: (0..30).map(|i| KeyPoint::new(i as f32, 0.0)).collect(),
            descriptors: Array2::from_shape_fn((30, 16), |_| rng.random_range(0.05f32..1.0)),
            width: 64,
            height: 64,
        }
    }

    impl FeatureExtractor for SeededExtractor {
        fn detect_and_compute(&mut self, image: &GrayImage) -> Result<Features> {
            Ok(Features::empty(image.width(), image.height(), 16))
        }

        fn max_size(&self) -> (u32, u32) {
            (64, 64)
        }

        fn detect_file(&mut self, path: &Path) -> Result<Features> {
            let stem = path.file_stem().unwrap_or_default().to_string_lossy();
            let seed = stem.rsplit(',').next().unwrap_or_default().parse().unwrap_or(0);
            Ok(seeded_features(seed))
        }
    }

    fn build_catalog(dir: &Path) {
        let store = IndexStore::new(dir, BinLedger::new(dir.join("bins.txt")), IndexParams::default());
        for (loc, seeds) in [("1,1", [1, 2]), ("2,2", [3, 4]), ("3,3", [5, 6])] {
            let paths = seeds.iter().map(|s| PathBuf::from(format!("{loc},{s}.jpg"))).collect::<Vec<_>>();
            store.ingest(loc.parse().unwrap(), &paths, &mut SeededExtractor).unwrap();
        }
    }

    #[test]
    fn test_self_query_beats_unrelated() {
        let dir = TempDir::new().unwrap();
        build_catalog(dir.path());

        let mut recogniser =
            Recogniser::open(dir.path().join("2,2"), Box::new(SeededExtractor), &IndexParams::default(), 0.8)
                .unwrap();
        assert_eq!(recogniser.record().counts, vec![30, 30]);

        let same = recogniser.query("q,3.jpg").unwrap();
        let other = recogniser.query("q,99.jpg").unwrap();
        assert_eq!(same, 30);
        assert!(same > other);
    }

    #[test]
    fn test_empty_query() {
        let dir = TempDir::new().unwrap();
        build_catalog(dir.path());

        let recogniser =
            Recogniser::open(dir.path().join("1,1"), Box::new(SeededExtractor), &IndexParams::default(), 0.8)
                .unwrap();
        assert_eq!(recogniser.query_features(&Features::empty(10, 10, 16)).unwrap(), 0);
    }

    #[test]
    fn test_locator_ranking() {
        let dir = TempDir::new().unwrap();
        build_catalog(dir.path());

        let mut locator = Locator::open(dir.path(), Box::new(SeededExtractor), &IndexParams::default(), 0.8).unwrap();
        assert_eq!(locator.len(), 3);

        let ranked = locator.locate("q,6.jpg").unwrap();
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].location, "3,3".parse().unwrap());
        assert_eq!(ranked[0].count, 30);
        assert!(ranked.windows(2).all(|w| w[0].count >= w[1].count));

        let best = locator.best("q,1.jpg").unwrap().unwrap();
        assert_eq!(best.location, "1,1".parse().unwrap());
    }

    #[test]
    fn test_missing_record() {
        let dir = TempDir::new().unwrap();
        assert!(
            Recogniser::open(dir.path().join("9,9"), Box::new(SeededExtractor), &IndexParams::default(), 0.8).is_err()
        );
        let locator = Locator::open(dir.path(), Box::new(SeededExtractor), &IndexParams::default(), 0.8).unwrap();
        assert!(locator.is_empty());
    }
}
