use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array2, ArrayView2};
use ndarray_npy::{read_npy, write_npy};
use rayon::prelude::*;

use super::{IndexParams, Neighbor, NeighborSearch, l2_squared, sort_neighbors};
use crate::error::PipelineError;

const DATA_FILE: &str = "descriptors.npy";

/// 暴力搜索索引，持久化为一个 npy 文件
pub struct FlatIndex {
    data: Array2<f32>,
}

impl FlatIndex {
    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }
}

impl NeighborSearch for FlatIndex {
    fn build(data: Array2<f32>, _params: &IndexParams) -> Result<Self> {
        Ok(Self { data: data.as_standard_layout().into_owned() })
    }

    fn open(dir: &Path, _params: &IndexParams) -> Result<Self> {
        let path = dir.join(DATA_FILE);
        let data: Array2<f32> =
            read_npy(&path).with_context(|| format!("读取索引失败: {}", path.display()))?;
        Ok(Self { data })
    }

    fn save(&self, dir: &Path) -> Result<()> {
        write_npy(dir.join(DATA_FILE), &self.data)?;
        Ok(())
    }

    fn knn(&self, query: ArrayView2<f32>, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        if self.data.nrows() == 0 || k == 0 {
            return Ok(vec![vec![]; query.nrows()]);
        }
        if query.nrows() > 0 && query.ncols() != self.dim() {
            return Err(PipelineError::DimensionMismatch { expected: self.dim(), found: query.ncols() }.into());
        }

        let result = (0..query.nrows())
            .into_par_iter()
            .map(|i| {
                let q = query.row(i).to_vec();
                let mut best: Vec<Neighbor> = Vec::with_capacity(k + 1);
                for (j, row) in self.data.outer_iter().enumerate() {
                    // 数据为标准布局，每一行都是连续的
                    let d = match row.as_slice() {
                        Some(row) => l2_squared(&q, row),
                        None => l2_squared(&q, &row.to_vec()),
                    };
                    if best.len() == k && d >= best[k - 1].distance {
                        continue;
                    }
                    let pos = best.partition_point(|n| n.distance <= d);
                    best.insert(pos, Neighbor { index: j, distance: d });
                    best.truncate(k);
                }
                best.iter_mut().for_each(|n| n.distance = n.distance.sqrt());
                sort_neighbors(&mut best, k);
                best
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
