use anyhow::Result;
use ndarray::{Array2, ArrayView2, Axis};
use serde::Serialize;

use crate::knn::{IndexParams, NeighborSearch};

/// Lowe 比值检验的默认比值
pub const LOWE_RATIO: f32 = 0.8;

/// 查询描述符与参考描述符之间的一组对应关系
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Correspondence {
    /// 查询描述符的行号
    pub query_idx: usize,
    /// 参考描述符的行号，多图匹配时为该图片内部的行号
    pub train_idx: usize,
    /// 多图匹配时参考图片的序号
    pub img_idx: Option<usize>,
    pub distance: f32,
}

/// 为每个查询描述符搜索 k 个最近的参考描述符
///
/// 返回结果与查询描述符一一对应，参考集合为空时每一项都为空。
pub fn knn_match<S: NeighborSearch + ?Sized>(
    query: ArrayView2<f32>,
    reference: &S,
    k: usize,
) -> Result<Vec<Vec<Correspondence>>> {
    let neighbors = reference.knn(query, k)?;
    Ok(neighbors
        .into_iter()
        .enumerate()
        .map(|(query_idx, list)| {
            list.into_iter()
                .map(|n| Correspondence {
                    query_idx,
                    train_idx: n.index,
                    img_idx: None,
                    distance: n.distance,
                })
                .collect()
        })
        .collect())
}

/// 多张参考图片的描述符拼接后建立的单个索引
///
/// 通过前缀和将拼接后的行号映射回 (图片序号, 图片内行号)。
pub struct ReferenceSet<S> {
    index: S,
    offsets: Vec<usize>,
}

impl<S: NeighborSearch> ReferenceSet<S> {
    /// 按顺序拼接每张图片的描述符并建立索引
    pub fn build<'a, I>(sets: I, params: &IndexParams) -> Result<Self>
    where
        I: IntoIterator<Item = ArrayView2<'a, f32>>,
    {
        let views = sets.into_iter().collect::<Vec<_>>();
        let counts = views.iter().map(|v| v.nrows()).collect::<Vec<_>>();
        let data = if views.is_empty() {
            Array2::zeros((0, 0))
        } else {
            ndarray::concatenate(Axis(0), &views)?
        };
        Ok(Self::from_parts(S::build(data, params)?, &counts))
    }

    /// 使用已有的索引和每张图片的描述符数量构造
    pub fn from_parts(index: S, counts: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        offsets.push(0);
        for count in counts {
            offsets.push(offsets[offsets.len() - 1] + count);
        }
        debug_assert_eq!(offsets[offsets.len() - 1], index.len());
        Self { index, offsets }
    }

    pub fn index(&self) -> &S {
        &self.index
    }

    /// 参考图片数量
    pub fn images(&self) -> usize {
        self.offsets.len() - 1
    }

    /// 将拼接后的行号映射为 (图片序号, 图片内行号)
    pub fn locate(&self, global: usize) -> (usize, usize) {
        let img = self.offsets.partition_point(|&o| o <= global) - 1;
        (img, global - self.offsets[img])
    }

    /// 第 `img` 张图片在拼接后的行号范围
    pub fn range(&self, img: usize) -> std::ops::Range<usize> {
        self.offsets[img]..self.offsets[img + 1]
    }
}

/// 在多张参考图片中搜索，结果中的 `img_idx` 与参考图片顺序一致
pub fn knn_match_batch<S: NeighborSearch>(
    query: ArrayView2<f32>,
    reference: &ReferenceSet<S>,
    k: usize,
) -> Result<Vec<Vec<Correspondence>>> {
    let mut matches = knn_match(query, reference.index(), k)?;
    for m in matches.iter_mut().flatten() {
        let (img, local) = reference.locate(m.train_idx);
        m.img_idx = Some(img);
        m.train_idx = local;
    }
    Ok(matches)
}

/// Lowe 比值检验：最近距离不超过次近距离的 `ratio` 倍时保留最近的匹配
///
/// 候选少于两个的查询无法判断歧义，直接丢弃。
pub fn ratio_filter(knn_matches: &[Vec<Correspondence>], ratio: f32) -> Vec<Correspondence> {
    knn_matches
        .iter()
        .filter_map(|candidates| match candidates.as_slice() {
            [m, n, ..] if m.distance <= ratio * n.distance => Some(*m),
            _ => None,
        })
        .collect()
}

/// 保留距离不超过最小距离两倍（至少 0.02）的匹配
pub fn distance_filter(matches: &[Correspondence]) -> Vec<Correspondence> {
    let Some(min) = matches.iter().map(|m| m.distance).min_by(f32::total_cmp) else {
        return vec![];
    };
    let threshold = (2.0 * min).max(0.02);
    matches.iter().filter(|m| m.distance <= threshold).copied().collect()
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::knn::FlatIndex;

    fn candidate(query_idx: usize, train_idx: usize, distance: f32) -> Correspondence {
        Correspondence { query_idx, train_idx, img_idx: None, distance }
    }

    #[test]
    fn test_ratio_filter_examples() {
        let kept = ratio_filter(&[vec![candidate(0, 3, 1.0), candidate(0, 4, 2.0)]], LOWE_RATIO);
        assert_eq!(kept, vec![candidate(0, 3, 1.0)]);

        let dropped = ratio_filter(&[vec![candidate(0, 3, 1.8), candidate(0, 4, 2.0)]], LOWE_RATIO);
        assert!(dropped.is_empty());
    }

    #[test]
    fn test_ratio_filter_keeps_order() {
        let knn = vec![
            vec![candidate(0, 1, 0.1), candidate(0, 2, 1.0)],
            vec![candidate(1, 1, 0.9), candidate(1, 2, 1.0)],
            vec![candidate(2, 5, 0.0), candidate(2, 6, 0.0)],
            vec![candidate(3, 7, 0.2)],
            vec![],
            vec![candidate(5, 0, 0.3), candidate(5, 9, 3.0)],
        ];
        let kept = ratio_filter(&knn, LOWE_RATIO);
        let ids = kept.iter().map(|m| m.query_idx).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 2, 5]);
    }

    #[test]
    fn test_distance_filter() {
        let matches = vec![candidate(0, 0, 0.1), candidate(1, 1, 0.25), candidate(2, 2, 0.15)];
        let kept = distance_filter(&matches);
        assert_eq!(kept.iter().map(|m| m.query_idx).collect::<Vec<_>>(), vec![0, 2]);

        let tiny = vec![candidate(0, 0, 0.0), candidate(1, 1, 0.015), candidate(2, 2, 0.5)];
        assert_eq!(distance_filter(&tiny).len(), 2);
        assert!(distance_filter(&[]).is_empty());
    }

    #[test]
    fn test_knn_match_empty_reference() {
        let index = FlatIndex::build(Array2::zeros((0, 2)), &IndexParams::default()).unwrap();
        let matches = knn_match(array![[1.0f32, 0.0]].view(), &index, 2).unwrap();
        assert!(ratio_filter(&matches, LOWE_RATIO).is_empty());
    }

    #[test]
    fn test_reference_set_locate() {
        let a = array![[0.0f32, 0.0], [1.0, 1.0]];
        let empty = Array2::<f32>::zeros((0, 2));
        let b = array![[5.0f32, 5.0], [6.0, 6.0], [7.0, 7.0]];
        let set = ReferenceSet::<FlatIndex>::build(
            [a.view(), empty.view(), b.view()],
            &IndexParams::default(),
        )
        .unwrap();

        assert_eq!(set.images(), 3);
        assert_eq!(set.locate(0), (0, 0));
        assert_eq!(set.locate(1), (0, 1));
        assert_eq!(set.locate(2), (2, 0));
        assert_eq!(set.locate(4), (2, 2));
        assert_eq!(set.range(1), 2..2);

        let matches = knn_match_batch(array![[6.1f32, 6.0], [0.9, 1.0]].view(), &set, 2).unwrap();
        assert_eq!(matches[0][0].img_idx, Some(2));
        assert_eq!(matches[0][0].train_idx, 1);
        assert_eq!(matches[1][0].img_idx, Some(0));
        assert_eq!(matches[1][0].train_idx, 1);
    }
}
