use std::path::Path;

use anyhow::{Context, Result};
use hnsw_rs::prelude::*;
use log::debug;
use ndarray::{Array2, ArrayView2};
use ndarray_npy::{read_npy, write_npy};
use rayon::prelude::*;

use super::{IndexParams, Neighbor, NeighborSearch, sort_neighbors};
use crate::error::PipelineError;

const BASENAME: &str = "hnsw";
const DATA_FILE: &str = "descriptors.npy";
/// hnsw_rs 的最大层数，file_dump 只接受以该层数建立的图
const MAX_LAYER: usize = 16;

/// 基于 hnsw_rs 的近似搜索索引
///
/// 原始描述符同时保存为 npy 文件，用于校验维度和重建索引。
pub struct HnswIndex {
    hnsw: Hnsw<'static, f32, DistL2>,
    data: Array2<f32>,
    ef_search: usize,
}

impl NeighborSearch for HnswIndex {
    fn build(data: Array2<f32>, params: &IndexParams) -> Result<Self> {
        let data = data.as_standard_layout().into_owned();
        let (nb, dim) = data.dim();
        let hnsw = Hnsw::<f32, DistL2>::new(
            params.max_connections,
            nb.max(1),
            MAX_LAYER,
            params.ef_construction,
            DistL2 {},
        );
        if nb > 0 && dim > 0 {
            let flat = data.as_slice().context("描述符矩阵不连续")?;
            flat.par_chunks_exact(dim).enumerate().for_each(|(i, row)| {
                hnsw.insert_slice((row, i));
            });
        }
        debug!("hnsw built with {} points", nb);
        Ok(Self { hnsw, data, ef_search: params.ef_search })
    }

    fn open(dir: &Path, params: &IndexParams) -> Result<Self> {
        let path = dir.join(DATA_FILE);
        let data: Array2<f32> =
            read_npy(&path).with_context(|| format!("读取索引失败: {}", path.display()))?;
        let reloader = HnswIo::new(dir, BASENAME);
        // NOTE: reloader 加载的 HNSW 生命周期依赖于 reloader 的引用，所以需要使用 Box::leak 来延长生命周期
        let reloader = Box::leak(Box::new(reloader));
        let hnsw = reloader.load_hnsw_with_dist(DistL2 {})?;
        Ok(Self { hnsw, data, ef_search: params.ef_search })
    }

    fn save(&self, dir: &Path) -> Result<()> {
        write_npy(dir.join(DATA_FILE), &self.data)?;
        self.hnsw.file_dump(dir, BASENAME)?;
        Ok(())
    }

    fn knn(&self, query: ArrayView2<f32>, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        if self.data.nrows() == 0 || k == 0 {
            return Ok(vec![vec![]; query.nrows()]);
        }
        if query.nrows() > 0 && query.ncols() != self.dim() {
            return Err(PipelineError::DimensionMismatch { expected: self.dim(), found: query.ncols() }.into());
        }

        let ef = self.ef_search.max(k);
        let result = (0..query.nrows())
            .into_par_iter()
            .map(|i| {
                let q = query.row(i).to_vec();
                let mut neighbors = self
                    .hnsw
                    .search(&q, k, ef)
                    .into_iter()
                    .map(|n| Neighbor { index: n.d_id, distance: n.distance })
                    .collect::<Vec<_>>();
                sort_neighbors(&mut neighbors, k);
                neighbors
            })
            .collect();
        Ok(result)
    }

    fn len(&self) -> usize {
        self.data.nrows()
    }

    fn dim(&self) -> usize {
        self.data.ncols()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    use super::*;
    use crate::knn::{FlatIndex, IndexKind};

    fn random_data(n: usize, dim: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, dim), |_| rng.random_range(0.0..1.0))
    }

    fn params() -> IndexParams {
        IndexParams { kind: IndexKind::Hnsw, ..Default::default() }
    }

    #[test]
    fn test_exact_member_is_found() {
        let data = random_data(300, 16, 1);
        let index = HnswIndex::build(data.clone(), &params()).unwrap();
        let result = index.knn(data.slice(ndarray::s![0..20, ..]), 2).unwrap();
        for (i, neighbors) in result.iter().enumerate() {
            assert_eq!(neighbors[0].index, i);
            assert!(neighbors[0].distance < 1e-4);
        }
    }

    #[test]
    fn test_agrees_with_flat() {
        let data = random_data(200, 8, 2);
        let query = random_data(10, 8, 3);
        let hnsw = HnswIndex::build(data.clone(), &params()).unwrap();
        let flat = FlatIndex::build(data, &params()).unwrap();

        let a = hnsw.knn(query.view(), 1).unwrap();
        let b = flat.knn(query.view(), 1).unwrap();
        let same = a.iter().zip(&b).filter(|(x, y)| x[0].index == y[0].index).count();
        assert!(same >= 9);
    }

    #[test]
    fn test_save_and_open() {
        let dir = TempDir::new().unwrap();
        let data = random_data(100, 8, 4);
        let index = HnswIndex::build(data.clone(), &params()).unwrap();
        index.save(dir.path()).unwrap();

        let reopened = HnswIndex::open(dir.path(), &params()).unwrap();
        assert_eq!(reopened.len(), 100);
        assert_eq!(reopened.dim(), 8);
        let result = reopened.knn(data.slice(ndarray::s![5..6, ..]), 1).unwrap();
        assert_eq!(result[0][0].index, 5);
    }
}
