//! 纯 Rust 实现的特征提取器
//!
//! 使用 Harris 角点作为特征点，在特征点主方向上计算 4x4x8 的梯度方向直方图，
//! 描述符的布局与取值范围与 SIFT 相同，因此可以直接进行 RootSIFT 变换。
//! 不具备尺度不变性。

use std::f32::consts::TAU;

use anyhow::Result;
use image::GrayImage;
use image::imageops;
use ndarray::{Array2, Zip};
use rayon::prelude::*;

use super::{ExtractParams, FeatureExtractor, Features, KeyPoint};

/// 描述符维度
pub const DESCRIPTOR_LEN: usize = DESC_WIDTH * DESC_WIDTH * DESC_BINS;

const BLUR_SIGMA: f32 = 1.0;
const HARRIS_K: f32 = 0.04;
const HARRIS_RADIUS: usize = 2;
/// 特征点到图片边缘的最小距离，保证旋转后的采样窗口不越界
const MARGIN: usize = 12;
const ORI_RADIUS: i32 = 6;
const ORI_BINS: usize = 36;
const DESC_WIDTH: usize = 4;
const DESC_BINS: usize = 8;
/// 采样窗口边长
const PATCH_SIZE: usize = 16;
const DESC_CLIP: f32 = 0.2;
const DESC_SCALE: f32 = 512.0;

pub struct GradientSift {
    params: ExtractParams,
}

impl GradientSift {
    pub fn new(params: ExtractParams) -> Self {
        Self { params }
    }
}

impl FeatureExtractor for GradientSift {
    fn detect_and_compute(&mut self, image: &GrayImage) -> Result<Features> {
        let (width, height) = image.dimensions();
        if (width as usize) < 2 * MARGIN + 3 || (height as usize) < 2 * MARGIN + 3 {
            return Ok(Features::empty(width, height, DESCRIPTOR_LEN));
        }

        let blurred = imageops::blur(image, BLUR_SIGMA);
        let pixels = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            blurred.get_pixel(x as u32, y as u32).0[0] as f32 / 255.0
        });
        let (gx, gy) = gradients(&pixels);
        let response = harris_response(&gx, &gy);
        let corners = select_corners(&response, self.params.harris_threshold, self.params.nfeatures);

        let described = corners
            .par_iter()
            .filter_map(|&(x, y, r)| {
                let angle = dominant_orientation(&gx, &gy, x, y);
                let descriptor = describe(&gx, &gy, x, y, angle)?;
                let kp = KeyPoint {
                    x: x as f32,
                    y: y as f32,
                    size: PATCH_SIZE as f32,
                    angle,
                    response: r,
                };
                Some((kp, descriptor))
            })
            .collect::<Vec<_>>();

        let mut descriptors = Array2::zeros((described.len(), DESCRIPTOR_LEN));
        let mut keypoints = Vec::with_capacity(described.len());
        for (i, (kp, des)) in described.into_iter().enumerate() {
            descriptors.row_mut(i).assign(&ndarray::ArrayView1::from(&des[..]));
            keypoints.push(kp);
        }

        Ok(Features { keypoints, descriptors, width, height })
    }

    fn max_size(&self) -> (u32, u32) {
        self.params.max_size
    }
}

fn gradients(img: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
    let (h, w) = img.dim();
    let mut gx = Array2::zeros((h, w));
    let mut gy = Array2::zeros((h, w));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            gx[[y, x]] = (img[[y, x + 1]] - img[[y, x - 1]]) * 0.5;
            gy[[y, x]] = (img[[y + 1, x]] - img[[y - 1, x]]) * 0.5;
        }
    }
    (gx, gy)
}

/// 可分离的方框求和滤波
fn box_sum(a: &Array2<f32>, r: usize) -> Array2<f32> {
    let (h, w) = a.dim();
    let mut rows = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let (lo, hi) = (x.saturating_sub(r), (x + r).min(w - 1));
            rows[[y, x]] = (lo..=hi).map(|i| a[[y, i]]).sum();
        }
    }
    let mut out = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        let (lo, hi) = (y.saturating_sub(r), (y + r).min(h - 1));
        for x in 0..w {
            out[[y, x]] = (lo..=hi).map(|j| rows[[j, x]]).sum();
        }
    }
    out
}

fn harris_response(gx: &Array2<f32>, gy: &Array2<f32>) -> Array2<f32> {
    let sxx = box_sum(&(gx * gx), HARRIS_RADIUS);
    let syy = box_sum(&(gy * gy), HARRIS_RADIUS);
    let sxy = box_sum(&(gx * gy), HARRIS_RADIUS);
    let mut response = Array2::zeros(gx.dim());
    Zip::from(&mut response).and(&sxx).and(&syy).and(&sxy).for_each(|r, &a, &b, &c| {
        let trace = a + b;
        *r = a * b - c * c - HARRIS_K * trace * trace;
    });
    response
}

/// 非极大值抑制后按响应从大到小选出至多 `limit` 个角点，返回 (x, y, response)
fn select_corners(response: &Array2<f32>, threshold: f32, limit: usize) -> Vec<(usize, usize, f32)> {
    let (h, w) = response.dim();
    let max = (MARGIN..h - MARGIN)
        .flat_map(|y| (MARGIN..w - MARGIN).map(move |x| (x, y)))
        .map(|(x, y)| response[[y, x]])
        .fold(0.0f32, f32::max);
    if max <= 0.0 {
        return vec![];
    }
    let threshold = max * threshold;

    let mut corners = vec![];
    for y in MARGIN..h - MARGIN {
        for x in MARGIN..w - MARGIN {
            let r = response[[y, x]];
            if r <= threshold {
                continue;
            }
            // 光栅顺序在前的邻居必须严格小于，在后的允许相等，避免平台区域重复
            let is_max = (y - 1..=y + 1).all(|ny| {
                (x - 1..=x + 1).all(|nx| {
                    let n = response[[ny, nx]];
                    match (ny, nx).cmp(&(y, x)) {
                        std::cmp::Ordering::Less => r > n,
                        std::cmp::Ordering::Equal => true,
                        std::cmp::Ordering::Greater => r >= n,
                    }
                })
            });
            if is_max {
                corners.push((x, y, r));
            }
        }
    }

    corners.sort_by(|a, b| b.2.total_cmp(&a.2).then((a.1, a.0).cmp(&(b.1, b.0))));
    corners.truncate(limit);
    corners
}

fn dominant_orientation(gx: &Array2<f32>, gy: &Array2<f32>, x: usize, y: usize) -> f32 {
    let mut hist = [0f32; ORI_BINS];
    let sigma2 = (ORI_RADIUS as f32 / 2.0).powi(2);
    for dy in -ORI_RADIUS..=ORI_RADIUS {
        for dx in -ORI_RADIUS..=ORI_RADIUS {
            let d2 = dx * dx + dy * dy;
            if d2 > ORI_RADIUS * ORI_RADIUS {
                continue;
            }
            let px = (x as i32 + dx) as usize;
            let py = (y as i32 + dy) as usize;
            let (vx, vy) = (gx[[py, px]], gy[[py, px]]);
            let mag = vx.hypot(vy);
            if mag == 0.0 {
                continue;
            }
            let angle = vy.atan2(vx).rem_euclid(TAU);
            let weight = (-(d2 as f32) / (2.0 * sigma2)).exp();
            let bin = ((angle / TAU * ORI_BINS as f32) as usize).min(ORI_BINS - 1);
            hist[bin] += mag * weight;
        }
    }

    let Some((peak, _)) = hist.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)) else {
        return 0.0;
    };
    let left = hist[(peak + ORI_BINS - 1) % ORI_BINS];
    let center = hist[peak];
    let right = hist[(peak + 1) % ORI_BINS];
    let denom = left - 2.0 * center + right;
    let offset = if denom.abs() > f32::EPSILON { 0.5 * (left - right) / denom } else { 0.0 };
    ((peak as f32 + 0.5 + offset) * TAU / ORI_BINS as f32).rem_euclid(TAU)
}

fn describe(gx: &Array2<f32>, gy: &Array2<f32>, x: usize, y: usize, angle: f32) -> Option<[f32; DESCRIPTOR_LEN]> {
    let (h, w) = gx.dim();
    let (sin, cos) = angle.sin_cos();
    let half = PATCH_SIZE as f32 / 2.0;
    let cell = PATCH_SIZE / DESC_WIDTH;
    let sigma2 = half * half;
    let mut hist = [0f32; DESCRIPTOR_LEN];

    for i in 0..PATCH_SIZE {
        for j in 0..PATCH_SIZE {
            let u = j as f32 + 0.5 - half;
            let v = i as f32 + 0.5 - half;
            let px = (x as f32 + cos * u - sin * v).round();
            let py = (y as f32 + sin * u + cos * v).round();
            if px < 0.0 || py < 0.0 || px as usize >= w || py as usize >= h {
                continue;
            }
            let (vx, vy) = (gx[[py as usize, px as usize]], gy[[py as usize, px as usize]]);
            let mag = vx.hypot(vy);
            if mag == 0.0 {
                continue;
            }
            let ori = (vy.atan2(vx) - angle).rem_euclid(TAU);
            let weight = mag * (-(u * u + v * v) / (2.0 * sigma2)).exp();
            let fbin = ori / TAU * DESC_BINS as f32;
            let frac = fbin - fbin.floor();
            let b0 = fbin.floor() as usize % DESC_BINS;
            let b1 = (b0 + 1) % DESC_BINS;
            let base = ((i / cell) * DESC_WIDTH + j / cell) * DESC_BINS;
            hist[base + b0] += weight * (1.0 - frac);
            hist[base + b1] += weight * frac;
        }
    }

    let norm = hist.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return None;
    }
    hist.iter_mut().for_each(|v| *v = (*v / norm).min(DESC_CLIP));
    let norm = hist.iter().map(|v| v * v).sum::<f32>().sqrt();
    hist.iter_mut().for_each(|v| *v = (*v / norm * DESC_SCALE).min(255.0));
    Some(hist)
}
