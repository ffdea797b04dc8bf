use anyhow::Result;
use image::GrayImage;
use ndarray::Array2;
use opencv::core::{KeyPoint as CvKeyPoint, Mat, Ptr, Vector};
use opencv::features2d::SIFT;
use opencv::prelude::*;

use super::{ExtractParams, FeatureExtractor, Features, KeyPoint};

/// OpenCV 的 SIFT 特征提取器
pub struct OpenCvSift {
    sift: Ptr<SIFT>,
    params: ExtractParams,
}

// SIFT 实例只在持有者的线程中使用
unsafe impl Send for OpenCvSift {}

impl OpenCvSift {
    pub fn new(params: ExtractParams) -> Result<Self> {
        let sift = SIFT::create(params.nfeatures as i32, 3, 0.04, 10., 1.6, false)?;
        Ok(Self { sift, params })
    }
}

impl FeatureExtractor for OpenCvSift {
    fn detect_and_compute(&mut self, image: &GrayImage) -> Result<Features> {
        let (width, height) = image.dimensions();
        let mat = Mat::from_slice(image.as_raw())?.reshape(1, height as i32)?.try_clone()?;

        let mask = Mat::default();
        let mut kps = Vector::<CvKeyPoint>::new();
        let mut des = Mat::default();
        self.sift.detect_and_compute(&mat, &mask, &mut kps, &mut des, false)?;

        if kps.is_empty() {
            return Ok(Features::empty(width, height, 128));
        }

        let keypoints = kps
            .iter()
            .map(|kp| KeyPoint {
                x: kp.pt().x,
                y: kp.pt().y,
                size: kp.size(),
                angle: kp.angle().to_radians(),
                response: kp.response(),
            })
            .collect::<Vec<_>>();
        let rows = des.rows() as usize;
        let cols = des.cols() as usize;
        let descriptors = Array2::from_shape_vec((rows, cols), des.data_typed::<f32>()?.to_vec())?;

        Ok(Features { keypoints, descriptors, width, height })
    }

    fn max_size(&self) -> (u32, u32) {
        self.params.max_size
    }
}
