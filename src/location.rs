use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// 经纬度标签，同一标签的图片属于同一个地点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationTag {
    pub lat: f64,
    pub lng: f64,
}

impl LocationTag {
    pub fn new(lat: f64, lng: f64) -> Result<Self, PipelineError> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(PipelineError::InvalidLocation(format!("{lat},{lng}")));
        }
        Ok(Self { lat, lng })
    }

    /// 从 `<lat>,<lng>,<其他>.jpg` 或 `<lat>,<lng>.jpg` 形式的文件名中解析地点
    pub fn from_filename(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let invalid = || PipelineError::InvalidLocation(path.display().to_string());
        let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(invalid)?;

        let mut parts = name.splitn(3, ',');
        let (Some(lat), Some(lng)) = (parts.next(), parts.next()) else {
            return Err(invalid());
        };
        let lng = match parts.next() {
            Some(_) => lng,
            None => Path::new(lng).file_stem().and_then(|s| s.to_str()).ok_or_else(invalid)?,
        };
        format!("{lat},{lng}").parse().map_err(|_| invalid())
    }
}

impl fmt::Display for LocationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

impl FromStr for LocationTag {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PipelineError::InvalidLocation(s.to_string());
        let (lat, lng) = s.split_once(',').ok_or_else(invalid)?;
        let lat = lat.trim().parse::<f64>().map_err(|_| invalid())?;
        let lng = lng.trim().parse::<f64>().map_err(|_| invalid())?;
        Self::new(lat, lng).map_err(|_| invalid())
    }
}
