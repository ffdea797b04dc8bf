use ndarray::{Array2, Axis};

use crate::error::PipelineError;
use crate::features::Features;

/// 将 SIFT 描述符原地转换为 RootSIFT：取绝对值、按行 L1 归一化后开平方
///
/// 该变换只应执行一次，对结果再次调用并不会得到相同的向量。
///
/// L1 范数为 0 的描述符会让每个分量都变成 NaN，此时直接返回
/// [`PipelineError::ZeroNormDescriptor`]，且不修改任何数据。
pub fn root_sift(descriptors: &mut Array2<f32>) -> Result<(), PipelineError> {
    if descriptors.is_empty() {
        return Err(PipelineError::EmptyDescriptors);
    }

    let sums = descriptors.map_axis(Axis(1), |row| row.iter().map(|v| v.abs()).sum::<f32>());
    if let Some(row) = sums.iter().position(|&s| s == 0.0) {
        return Err(PipelineError::ZeroNormDescriptor { row });
    }

    for (mut row, &sum) in descriptors.rows_mut().into_iter().zip(sums.iter()) {
        row.mapv_inplace(|v| (v.abs() / sum).sqrt());
    }
    Ok(())
}

/// 对一批图片的描述符执行 RootSIFT，没有特征点的图片会被跳过
pub fn root_sift_all(features: &mut [Features]) -> Result<(), PipelineError> {
    for f in features.iter_mut().filter(|f| !f.descriptors.is_empty()) {
        root_sift(&mut f.descriptors)?;
    }
    Ok(())
}
