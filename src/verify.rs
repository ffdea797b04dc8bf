//! 几何校验
//!
//! 通过 RANSAC 估计单应矩阵来剔除几何上不一致的匹配，并检查估计结果是否会把参考图片压缩成一个点。

use anyhow::Result;
use log::debug;
use rayon::prelude::*;

use crate::features::{Features, KeyPoint};
use crate::homography::{Homography, RansacParams, find_homography, projected_area_ratio};
use crate::knn::{FlatIndex, IndexParams, NeighborSearch};
use crate::matcher::{Correspondence, LOWE_RATIO, ReferenceSet, knn_match, knn_match_batch, ratio_filter};

/// 估计单应矩阵所需的最少匹配数
pub const MIN_MATCHES: usize = 4;
/// 投影面积与原面积之比低于该值时认为单应矩阵不可信
pub const MIN_AREA_RATIO: f64 = 0.0005;

#[derive(Debug, Clone)]
pub struct MatchParams {
    pub ratio: f32,
    pub ransac: RansacParams,
    pub min_area_ratio: f64,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self { ratio: LOWE_RATIO, ransac: RansacParams::default(), min_area_ratio: MIN_AREA_RATIO }
    }
}

/// 几何校验的结果
#[derive(Debug, Clone)]
pub struct Verified {
    pub matches: Vec<Correspondence>,
    pub homography: Homography,
    /// 是否实际估计出了单应矩阵
    pub estimated: bool,
}

/// 返回 (内点掩码, 单应矩阵, 是否估计成功)
fn ransac_mask(
    matches: &[Correspondence],
    query_kps: &[KeyPoint],
    train_kps: &[KeyPoint],
    params: &RansacParams,
) -> (Vec<bool>, Homography, bool) {
    if matches.len() < MIN_MATCHES {
        return (vec![true; matches.len()], Homography::identity(), false);
    }
    let (src, dst): (Vec<_>, Vec<_>) = matches
        .iter()
        .map(|m| {
            let q = &query_kps[m.query_idx];
            let t = &train_kps[m.train_idx];
            ((q.x as f64, q.y as f64), (t.x as f64, t.y as f64))
        })
        .unzip();
    match find_homography(&src, &dst, params) {
        Some((h, mask)) => (mask, h, true),
        None => {
            debug!("无法从 {} 个匹配中估计单应矩阵", matches.len());
            (vec![false; matches.len()], Homography::identity(), false)
        }
    }
}

/// 使用 RANSAC 剔除外点，保留的匹配保持原有顺序
///
/// 匹配少于 4 个时原样返回，单应矩阵为单位矩阵；
/// 4 个以上却无法估计时，没有任何匹配通过校验。
/// `query_idx`、`train_idx` 必须是 `query_kps`、`train_kps` 的合法下标。
pub fn ransac_filter(
    matches: &[Correspondence],
    query_kps: &[KeyPoint],
    train_kps: &[KeyPoint],
    params: &RansacParams,
) -> Verified {
    let (mask, homography, estimated) = ransac_mask(matches, query_kps, train_kps, params);
    let matches = matches.iter().zip(&mask).filter(|(_, keep)| **keep).map(|(m, _)| *m).collect();
    Verified { matches, homography, estimated }
}

/// 按参考图片分组分别执行 [`ransac_filter`]
///
/// 返回的单应矩阵与 `train_kps` 一一对应，没有匹配的图片为单位矩阵。
/// 保留的匹配保持输入中的相对顺序，`img_idx` 为空或越界的匹配会被丢弃。
pub fn ransac_filter_batch(
    matches: &[Correspondence],
    query_kps: &[KeyPoint],
    train_kps: &[Vec<KeyPoint>],
    params: &RansacParams,
) -> (Vec<Correspondence>, Vec<Homography>) {
    let mut groups = vec![vec![]; train_kps.len()];
    for (pos, m) in matches.iter().enumerate() {
        match m.img_idx {
            Some(img) if img < train_kps.len() => groups[img].push(pos),
            _ => debug!("丢弃没有参考图片的匹配: {m:?}"),
        }
    }

    let results = groups
        .par_iter()
        .zip(train_kps)
        .map(|(positions, kps)| {
            let group = positions.iter().map(|&p| matches[p]).collect::<Vec<_>>();
            let (mask, h, _) = ransac_mask(&group, query_kps, kps, params);
            (mask, h)
        })
        .collect::<Vec<_>>();

    let mut keep = vec![false; matches.len()];
    let mut homographies = Vec::with_capacity(results.len());
    for (positions, (mask, h)) in groups.iter().zip(results) {
        for (&pos, inlier) in positions.iter().zip(mask) {
            keep[pos] = inlier;
        }
        homographies.push(h);
    }
    let kept = matches.iter().zip(&keep).filter(|(_, k)| **k).map(|(m, _)| *m).collect();
    (kept, homographies)
}

/// 单应矩阵把查询图片映射到参考图片，因此用它的逆把参考图片的四个角投影回去，
/// 返回投影面积与参考图片面积之比。矩阵不可逆时视为压缩成一个点。
pub fn area_ratio(h: &Homography, ref_width: u32, ref_height: u32) -> f64 {
    match h.inverse() {
        Some(inv) => projected_area_ratio(ref_width as f64, ref_height as f64, &inv),
        None => 0.0,
    }
}

pub fn is_plausible(h: &Homography, ref_width: u32, ref_height: u32, min_area_ratio: f64) -> bool {
    area_ratio(h, ref_width, ref_height) >= min_area_ratio
}

/// 两张图片之间的完整匹配结果
#[derive(Debug, Clone)]
pub struct PairMatch {
    /// 通过比值检验的匹配
    pub ratio_matches: Vec<Correspondence>,
    /// 通过几何校验的匹配
    pub matches: Vec<Correspondence>,
    pub homography: Homography,
    /// 估计出单应矩阵时的投影面积比
    pub area_ratio: Option<f64>,
}

/// 匹配两张图片：KNN 搜索、比值检验、RANSAC、面积检查
pub fn match_pair(query: &Features, reference: &Features, params: &MatchParams) -> Result<PairMatch> {
    let index = FlatIndex::build(reference.descriptors.clone(), &IndexParams::default())?;
    let knn = knn_match(query.descriptors.view(), &index, 2)?;
    let ratio_matches = ratio_filter(&knn, params.ratio);

    if ratio_matches.len() < MIN_MATCHES {
        return Ok(PairMatch {
            matches: ratio_matches.clone(),
            ratio_matches,
            homography: Homography::identity(),
            area_ratio: None,
        });
    }

    let verified = ransac_filter(&ratio_matches, &query.keypoints, &reference.keypoints, &params.ransac);
    let mut matches = verified.matches;
    let mut area = None;
    if verified.estimated {
        let ratio = area_ratio(&verified.homography, reference.width, reference.height);
        if ratio < params.min_area_ratio {
            debug!("单应矩阵面积比 {ratio} 过小，丢弃全部匹配");
            matches.clear();
        }
        area = Some(ratio);
    }
    debug!(
        "match: {} knn, {} ratio, {} verified",
        knn.len(),
        ratio_matches.len(),
        matches.len()
    );

    Ok(PairMatch { ratio_matches, matches, homography: verified.homography, area_ratio: area })
}

/// 一张查询图片与多张参考图片的匹配结果
#[derive(Debug, Clone)]
pub struct BatchMatch {
    pub ratio_matches: Vec<Correspondence>,
    pub matches: Vec<Correspondence>,
    /// 与参考图片一一对应
    pub homographies: Vec<Homography>,
    /// 每张参考图片通过校验的匹配数量
    pub counts: Vec<usize>,
}

/// 在一个拼接索引上同时匹配多张参考图片，面积检查不通过的图片的匹配全部丢弃
pub fn match_batch(query: &Features, references: &[Features], params: &MatchParams) -> Result<BatchMatch> {
    let set = ReferenceSet::<FlatIndex>::build(
        references.iter().map(|f| f.descriptors.view()),
        &IndexParams::default(),
    )?;
    let knn = knn_match_batch(query.descriptors.view(), &set, 2)?;
    let ratio_matches = ratio_filter(&knn, params.ratio);

    let train_kps = references.iter().map(|f| f.keypoints.clone()).collect::<Vec<_>>();
    let (verified, homographies) =
        ransac_filter_batch(&ratio_matches, &query.keypoints, &train_kps, &params.ransac);

    let plausible = homographies
        .iter()
        .zip(references)
        .map(|(h, f)| is_plausible(h, f.width, f.height, params.min_area_ratio))
        .collect::<Vec<_>>();
    let matches = verified
        .into_iter()
        .filter(|m| m.img_idx.is_some_and(|img| plausible[img]))
        .collect::<Vec<_>>();

    let mut counts = vec![0; references.len()];
    for m in &matches {
        if let Some(img) = m.img_idx {
            counts[img] += 1;
        }
    }

    Ok(BatchMatch { ratio_matches, matches, homographies, counts })
}
