mod flat;
mod hnsw;

use std::path::Path;

use anyhow::Result;
use clap::ValueEnum;
pub use flat::FlatIndex;
pub use hnsw::HnswIndex;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// 一次 KNN 搜索的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// 在被搜索数据集中的行号
    pub index: usize,
    /// 欧氏距离
    pub distance: f32,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// 暴力搜索，结果精确
    Flat,
    /// HNSW 近似搜索
    Hnsw,
}

#[derive(Debug, Clone)]
pub struct IndexParams {
    pub kind: IndexKind,
    /// HNSW 每个节点的最大连接数
    pub max_connections: usize,
    /// HNSW 构建时的候选列表大小
    pub ef_construction: usize,
    /// HNSW 搜索时的候选列表大小
    pub ef_search: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self { kind: IndexKind::Flat, max_connections: 16, ef_construction: 200, ef_search: 64 }
    }
}

/// 适用于浮点描述符的 KNN 搜索结构
pub trait NeighborSearch {
    /// 使用一组描述符（每行一个）构建索引
    fn build(data: Array2<f32>, params: &IndexParams) -> Result<Self>
    where
        Self: Sized;

    /// 从指定目录加载索引
    fn open(dir: &Path, params: &IndexParams) -> Result<Self>
    where
        Self: Sized;

    /// 保存索引到指定目录，目录必须已经存在
    fn save(&self, dir: &Path) -> Result<()>;

    /// 为每个查询向量搜索最接近的至多 k 个向量，按距离从小到大排列，
    /// 距离相同时行号小的在前
    fn knn(&self, query: ArrayView2<f32>, k: usize) -> Result<Vec<Vec<Neighbor>>>;

    /// 索引中的向量数量
    fn len(&self) -> usize;

    /// 向量维度
    fn dim(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 根据 [`IndexKind`] 选择具体实现
pub enum AnyIndex {
    Flat(FlatIndex),
    Hnsw(HnswIndex),
}

impl NeighborSearch for AnyIndex {
    fn build(data: Array2<f32>, params: &IndexParams) -> Result<Self> {
        Ok(match params.kind {
            IndexKind::Flat => Self::Flat(FlatIndex::build(data, params)?),
            IndexKind::Hnsw => Self::Hnsw(HnswIndex::build(data, params)?),
        })
    }

    fn open(dir: &Path, params: &IndexParams) -> Result<Self> {
        Ok(match params.kind {
            IndexKind::Flat => Self::Flat(FlatIndex::open(dir, params)?),
            IndexKind::Hnsw => Self::Hnsw(HnswIndex::open(dir, params)?),
        })
    }

    fn save(&self, dir: &Path) -> Result<()> {
        match self {
            Self::Flat(index) => index.save(dir),
            Self::Hnsw(index) => index.save(dir),
        }
    }

    fn knn(&self, query: ArrayView2<f32>, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        match self {
            Self::Flat(index) => index.knn(query, k),
            Self::Hnsw(index) => index.knn(query, k),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Flat(index) => index.len(),
            Self::Hnsw(index) => index.len(),
        }
    }

    fn dim(&self) -> usize {
        match self {
            Self::Flat(index) => index.dim(),
            Self::Hnsw(index) => index.dim(),
        }
    }
}

/// 两个向量的欧氏距离的平方
#[inline(always)]
pub fn l2_squared(va: &[f32], vb: &[f32]) -> f32 {
    va.iter().zip(vb).map(|(a, b)| (a - b) * (a - b)).sum()
}

/// 在 `candidates` 中保留最近的 k 个，距离相同时保留行号小的
pub(crate) fn sort_neighbors(candidates: &mut Vec<Neighbor>, k: usize) {
    candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.index.cmp(&b.index)));
    candidates.truncate(k);
}
