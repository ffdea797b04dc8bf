mod gradient;
#[cfg(feature = "opencv")]
mod opencv_sift;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
pub use gradient::{DESCRIPTOR_LEN, GradientSift};
use image::GrayImage;
use image::imageops::{self, FilterType};
use log::debug;
use ndarray::Array2;
#[cfg(feature = "opencv")]
pub use opencv_sift::OpenCvSift;

use crate::error::PipelineError;

/// 特征点，坐标为像素坐标
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// 特征点邻域直径
    pub size: f32,
    /// 主方向，单位为弧度
    pub angle: f32,
    pub response: f32,
}

impl KeyPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, size: 1.0, angle: 0.0, response: 0.0 }
    }
}

/// 一次特征提取的结果，描述符的行顺序与特征点顺序一致
#[derive(Debug, Clone)]
pub struct Features {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Array2<f32>,
    /// 特征点坐标所在图片的宽度（缩放之后）
    pub width: u32,
    /// 特征点坐标所在图片的高度（缩放之后）
    pub height: u32,
}

impl Features {
    pub fn empty(width: u32, height: u32, dim: usize) -> Self {
        Self { keypoints: vec![], descriptors: Array2::zeros((0, dim)), width, height }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// 特征提取参数
#[derive(Debug, Clone)]
pub struct ExtractParams {
    /// 最大保留特征点数量
    pub nfeatures: usize,
    /// 图片最大尺寸 (宽, 高)，超过则等比缩放
    pub max_size: (u32, u32),
    /// Harris 响应阈值，相对于图片中最强的响应
    pub harris_threshold: f32,
}

impl Default for ExtractParams {
    fn default() -> Self {
        Self { nfeatures: 1000, max_size: (1920, 1080), harris_threshold: 0.01 }
    }
}

/// 特征提取器：输入一张图片，输出特征点与固定维度的描述符
pub trait FeatureExtractor: Send {
    fn detect_and_compute(&mut self, image: &GrayImage) -> Result<Features>;

    /// 读取图片时允许的最大尺寸
    fn max_size(&self) -> (u32, u32);

    fn detect_file(&mut self, path: &Path) -> Result<Features> {
        let image = imread(path, self.max_size())?;
        let features = self.detect_and_compute(&image)?;
        debug!("{}: {} keypoints", path.display(), features.len());
        Ok(features)
    }

    /// 批量提取，任意一张图片失败则整体失败
    fn detect_files(&mut self, paths: &[PathBuf]) -> Result<Vec<Features>> {
        paths.iter().map(|path| self.detect_file(path)).collect()
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    /// 纯 Rust 实现的梯度直方图描述符
    Gradient,
    /// OpenCV SIFT，需要启用 opencv feature
    OpencvSift,
}

pub fn create_extractor(
    kind: ExtractorKind,
    params: ExtractParams,
) -> Result<Box<dyn FeatureExtractor>> {
    match kind {
        ExtractorKind::Gradient => Ok(Box::new(GradientSift::new(params))),
        #[cfg(feature = "opencv")]
        ExtractorKind::OpencvSift => Ok(Box::new(OpenCvSift::new(params)?)),
        #[cfg(not(feature = "opencv"))]
        ExtractorKind::OpencvSift => Err(anyhow::anyhow!("未启用 opencv feature")),
    }
}

/// 读取灰度图片，宽或高超过 `max_size` 时等比缩小
pub fn imread(path: impl AsRef<Path>, max_size: (u32, u32)) -> Result<GrayImage> {
    let path = path.as_ref();
    let image = image::open(path)
        .context(PipelineError::ImageRead { path: path.to_path_buf() })?
        .to_luma8();
    Ok(adjust_image_size(image, max_size))
}

pub fn adjust_image_size(image: GrayImage, (max_width, max_height): (u32, u32)) -> GrayImage {
    let (width, height) = image.dimensions();
    if width <= max_width && height <= max_height {
        return image;
    }
    let scale = (max_width as f64 / width as f64).min(max_height as f64 / height as f64);
    let new_width = ((width as f64 * scale).round() as u32).max(1);
    let new_height = ((height as f64 * scale).round() as u32).max(1);
    debug!("resize image from {width}x{height} to {new_width}x{new_height}");
    imageops::resize(&image, new_width, new_height, FilterType::Triangle)
}
