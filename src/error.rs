use std::path::PathBuf;

/// 流水线中可以被调用方识别的错误，通过 `anyhow::Error::downcast_ref` 取回
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("无法读取图片: {}", path.display())]
    ImageRead { path: PathBuf },
    #[error("描述符集合为空")]
    EmptyDescriptors,
    #[error("第 {row} 个描述符的 L1 范数为 0")]
    ZeroNormDescriptor { row: usize },
    #[error("地点 {location} 的图片没有提取到任何特征点")]
    NoFeatures { location: String },
    #[error("无效的地点标签: {0}")]
    InvalidLocation(String),
    #[error("描述符维度不一致: 期望 {expected}，实际 {found}")]
    DimensionMismatch { expected: usize, found: usize },
}
