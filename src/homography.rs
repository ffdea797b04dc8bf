//! 单应矩阵估计
//!
//! 最小样本为 4 对点，使用 Hartley 归一化的 DLT 求解，RANSAC 挑选内点最多的模型，
//! 最后用全部内点做一次最小二乘重新拟合。

use log::debug;
use nalgebra::{Matrix3, SMatrix, SVector, SymmetricEigen, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;

/// 3x3 投影变换，把查询图片的像素坐标映射到参考图片的像素坐标
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography(Matrix3<f64>);

impl Homography {
    /// 单位矩阵，表示“没有估计出几何关系”
    pub fn identity() -> Self {
        Self(Matrix3::identity())
    }

    pub fn from_array(m: [[f64; 3]; 3]) -> Self {
        Self(Matrix3::new(
            m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
        ))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    pub fn as_array(&self) -> [[f64; 3]; 3] {
        let m = &self.0;
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
            [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
        ]
    }

    pub fn is_identity(&self) -> bool {
        self.0 == Matrix3::identity()
    }

    /// 逆变换，矩阵奇异时返回 None
    pub fn inverse(&self) -> Option<Self> {
        self.0.try_inverse().filter(|m| m.iter().all(|v| v.is_finite())).map(Self)
    }

    /// 对一个点做透视变换，齐次坐标 w 接近 0 时结果为原点
    pub fn project(&self, x: f64, y: f64) -> (f64, f64) {
        let v = self.0 * Vector3::new(x, y, 1.0);
        let w = if v.z.abs() > f64::EPSILON { 1.0 / v.z } else { 0.0 };
        (v.x * w, v.y * w)
    }

    /// 缩放使 h33 = 1
    fn normalized(m: Matrix3<f64>) -> Option<Self> {
        let h22 = m[(2, 2)];
        let m = if h22.abs() > f64::EPSILON { m / h22 } else { m };
        m.iter().all(|v| v.is_finite()).then_some(Self(m))
    }
}

/// 多边形面积（绝对值），顶点按顺序给出
pub fn polygon_area(points: &[(f64, f64)]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let twice: f64 = (0..n)
        .map(|i| {
            let (x1, y1) = points[i];
            let (x2, y2) = points[(i + 1) % n];
            x1 * y2 - x2 * y1
        })
        .sum();
    twice.abs() / 2.0
}

/// 将 width x height 的图片四个角点经过 `h` 投影，返回投影后四边形面积与原面积之比
pub fn projected_area_ratio(width: f64, height: f64, h: &Homography) -> f64 {
    let corners = [(0.0, 0.0), (width, 0.0), (width, height), (0.0, height)];
    let original = polygon_area(&corners);
    if original <= 0.0 {
        return 0.0;
    }
    let projected = corners.map(|(x, y)| h.project(x, y));
    polygon_area(&projected) / original
}

#[derive(Debug, Clone)]
pub struct RansacParams {
    /// 重投影误差阈值，单位为像素
    pub threshold: f64,
    pub max_iters: usize,
    /// 置信度，用于自适应地减少迭代次数
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self { threshold: 3.0, max_iters: 2000, confidence: 0.995, seed: 0x5eed }
    }
}

/// 使用 RANSAC 估计把 `src` 映射到 `dst` 的单应矩阵，返回矩阵和内点掩码
///
/// 点数少于 4 或者找不到非退化的模型时返回 None。
pub fn find_homography(
    src: &[(f64, f64)],
    dst: &[(f64, f64)],
    params: &RansacParams,
) -> Option<(Homography, Vec<bool>)> {
    assert_eq!(src.len(), dst.len(), "点对数量不一致");
    let n = src.len();
    if n < 4 {
        return None;
    }

    let thresh2 = params.threshold * params.threshold;
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<(Homography, Vec<bool>, usize)> = None;
    let mut niters = params.max_iters;
    let mut iter = 0;

    while iter < niters {
        iter += 1;
        let idx = sample(&mut rng, n, 4);
        let ps = [src[idx.index(0)], src[idx.index(1)], src[idx.index(2)], src[idx.index(3)]];
        let pd = [dst[idx.index(0)], dst[idx.index(1)], dst[idx.index(2)], dst[idx.index(3)]];
        if !is_good_sample(&ps, &pd) {
            continue;
        }
        let Some(h) = dlt(&ps, &pd) else {
            continue;
        };
        let (mask, count) = inliers(&h, src, dst, thresh2);
        if best.as_ref().is_none_or(|(_, _, c)| count > *c) {
            niters = update_num_iters(params.confidence, (n - count) as f64 / n as f64, 4, niters);
            best = Some((h, mask, count));
        }
    }

    let (mut h, mut mask, mut count) = best?;
    debug!("ransac: {iter} iterations, {count}/{n} inliers");

    // 使用全部内点重新拟合
    if count > 4 {
        let (s, d): (Vec<_>, Vec<_>) =
            (0..n).filter(|&i| mask[i]).map(|i| (src[i], dst[i])).unzip();
        if let Some(refined) = dlt(&s, &d) {
            let (refined_mask, refined_count) = inliers(&refined, src, dst, thresh2);
            if refined_count >= count {
                (h, mask, count) = (refined, refined_mask, refined_count);
            }
        }
    }
    debug!("ransac refined: {count}/{n} inliers");

    Some((h, mask))
}

fn inliers(h: &Homography, src: &[(f64, f64)], dst: &[(f64, f64)], thresh2: f64) -> (Vec<bool>, usize) {
    let mask = src
        .iter()
        .zip(dst)
        .map(|(&(x, y), &(u, v))| {
            let (px, py) = h.project(x, y);
            (px - u).powi(2) + (py - v).powi(2) <= thresh2
        })
        .collect::<Vec<_>>();
    let count = mask.iter().filter(|&&m| m).count();
    (mask, count)
}

/// 根据当前外点比例更新所需迭代次数
fn update_num_iters(confidence: f64, outlier_ratio: f64, model_points: i32, max_iters: usize) -> usize {
    let num = (1.0 - confidence).max(f64::MIN_POSITIVE);
    let denom = 1.0 - (1.0 - outlier_ratio).powi(model_points);
    if denom < f64::MIN_POSITIVE {
        return 0;
    }
    let (num, denom) = (num.ln(), denom.ln());
    if denom >= 0.0 || -num >= max_iters as f64 * -denom {
        max_iters
    } else {
        (num / denom).round() as usize
    }
}

fn cross(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

/// 样本中任意三点不能共线，且两侧三角形的朝向必须一致
fn is_good_sample(src: &[(f64, f64); 4], dst: &[(f64, f64); 4]) -> bool {
    const TRIPLES: [(usize, usize, usize); 4] = [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)];
    TRIPLES.iter().all(|&(i, j, k)| {
        let a = cross(src[i], src[j], src[k]);
        let b = cross(dst[i], dst[j], dst[k]);
        a.abs() > 1e-6 && b.abs() > 1e-6 && a.signum() == b.signum()
    })
}

/// 平移到质心并缩放使平均距离为 sqrt(2)，返回 (归一化后的点, 缩放, 质心)
fn hartley(points: &[(f64, f64)]) -> Option<(Vec<(f64, f64)>, f64, (f64, f64))> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    let mean = points.iter().map(|p| (p.0 - cx).hypot(p.1 - cy)).sum::<f64>() / n;
    if mean <= f64::EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean;
    let normalized = points.iter().map(|p| ((p.0 - cx) * s, (p.1 - cy) * s)).collect();
    Some((normalized, s, (cx, cy)))
}

/// 直接线性变换，点数大于 4 时为最小二乘解
fn dlt(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Homography> {
    let (ns, ss, (sx, sy)) = hartley(src)?;
    let (nd, sd, (dx, dy)) = hartley(dst)?;

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (&(x, y), &(u, v)) in ns.iter().zip(&nd) {
        let r1 = SVector::<f64, 9>::from_column_slice(&[-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]);
        let r2 = SVector::<f64, 9>::from_column_slice(&[0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]);
        ata += r1 * r1.transpose() + r2 * r2.transpose();
    }

    let eigen = SymmetricEigen::new(ata);
    let h = eigen.eigenvectors.column(eigen.eigenvalues.imin());
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_src = Matrix3::new(ss, 0.0, -ss * sx, 0.0, ss, -ss * sy, 0.0, 0.0, 1.0);
    let t_dst_inv = Matrix3::new(1.0 / sd, 0.0, dx, 0.0, 1.0 / sd, dy, 0.0, 0.0, 1.0);
    Homography::normalized(t_dst_inv * hn * t_src)
}
