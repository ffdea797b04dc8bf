#![allow(dead_code)]

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 随机纹理加上若干矩形色块，角点丰富且互不相似
pub fn scene(seed: u64, width: u32, height: u32) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let small = GrayImage::from_fn(width / 8, height / 8, |_, _| Luma([rng.random_range(0..=255)]));
    let mut image = imageops::resize(&small, width, height, FilterType::Triangle);
    for _ in 0..40 {
        let (w, h) = (rng.random_range(8..48), rng.random_range(8..48));
        let (x0, y0) = (rng.random_range(0..width - w), rng.random_range(0..height - h));
        let value = Luma([rng.random_range(0..=255)]);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                image.put_pixel(x, y, value);
            }
        }
    }
    image
}

pub fn view(scene: &GrayImage, x: u32, y: u32, width: u32, height: u32) -> GrayImage {
    imageops::crop_imm(scene, x, y, width, height).to_image()
}

pub fn save(image: &GrayImage, dir: &Path, name: &str) {
    image.save(dir.join(name)).unwrap();
}
