use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::Result;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;
use crate::features::{ExtractParams, ExtractorKind, FeatureExtractor, create_extractor};
use crate::homography::RansacParams;
use crate::knn::{IndexKind, IndexParams};
use crate::location::LocationTag;
use crate::matcher::LOWE_RATIO;
use crate::verify::{MIN_AREA_RATIO, MatchParams};

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let path = ProjectDirs::from("", "placeid", "placeid")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".placeid"));
    ConfDir { path }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap_or(".placeid")
}

#[derive(Parser, Debug, Clone)]
pub struct ExtractOptions {
    /// 特征提取算法
    #[arg(long, value_enum, default_value_t = ExtractorKind::Gradient)]
    pub extractor: ExtractorKind,
    /// 特征点最大保留数量
    #[arg(short = 'n', long, value_name = "N", default_value_t = 1000)]
    pub nfeatures: usize,
    /// 图片最大尺寸，如果宽或高超过这个尺寸，则等比缩放
    #[arg(short = 'S', long, value_name = "WIDTHxHEIGHT", value_parser = parse_size, default_value = "1920x1080")]
    pub max_size: (u32, u32),
    /// Harris 角点响应阈值，相对于图片中最强的响应
    #[arg(long, value_name = "THRESHOLD", default_value_t = 0.01)]
    pub harris_threshold: f32,
}

impl ExtractOptions {
    pub fn params(&self) -> ExtractParams {
        ExtractParams {
            nfeatures: self.nfeatures,
            max_size: self.max_size,
            harris_threshold: self.harris_threshold,
        }
    }

    pub fn create(&self) -> Result<Box<dyn FeatureExtractor>> {
        create_extractor(self.extractor, self.params())
    }
}

#[derive(Parser, Debug, Clone)]
pub struct MatchOptions {
    /// Lowe 比值检验的比值
    #[arg(long, value_name = "RATIO", default_value_t = LOWE_RATIO)]
    pub ratio: f32,
    /// RANSAC 重投影误差阈值，单位为像素
    #[arg(long, value_name = "PIXELS", default_value_t = 3.0)]
    pub ransac_threshold: f64,
    /// RANSAC 最大迭代次数
    #[arg(long, value_name = "N", default_value_t = 2000)]
    pub max_iters: usize,
    /// RANSAC 置信度
    #[arg(long, default_value_t = 0.995)]
    pub confidence: f64,
    /// RANSAC 随机数种子
    #[arg(long, default_value_t = RansacParams::default().seed)]
    pub seed: u64,
    /// 单应矩阵投影面积比的下限，低于该值时丢弃全部匹配
    #[arg(long, value_name = "RATIO", default_value_t = MIN_AREA_RATIO)]
    pub min_area_ratio: f64,
}

impl From<&MatchOptions> for MatchParams {
    fn from(opts: &MatchOptions) -> Self {
        Self {
            ratio: opts.ratio,
            ransac: RansacParams {
                threshold: opts.ransac_threshold,
                max_iters: opts.max_iters,
                confidence: opts.confidence,
                seed: opts.seed,
            },
            min_area_ratio: opts.min_area_ratio,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct IndexOptions {
    /// 索引类型，加载已有索引时以记录中的类型为准
    #[arg(long, value_enum, default_value_t = IndexKind::Flat)]
    pub index_type: IndexKind,
    /// HNSW 搜索时的候选列表大小
    #[arg(long, default_value_t = 64)]
    pub ef_search: usize,
    /// HNSW 每个节点的最大连接数
    #[arg(long, default_value_t = 16)]
    pub max_connections: usize,
    /// HNSW 构建时的候选列表大小
    #[arg(long, default_value_t = 200)]
    pub ef_construction: usize,
}

impl From<&IndexOptions> for IndexParams {
    fn from(opts: &IndexOptions) -> Self {
        Self {
            kind: opts.index_type,
            max_connections: opts.max_connections,
            ef_construction: opts.ef_construction,
            ef_search: opts.ef_search,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "placeid", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 配置目录，保存索引和账本
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 提取图片特征并为每个地点建立索引
    Add(AddCommand),
    /// 统计查询图片与某个地点之间的匹配数量
    Search(SearchCommand),
    /// 在所有地点中查找最匹配的地点
    Locate(LocateCommand),
    /// 匹配两张或多张图片并做几何校验
    Match(MatchCommand),
    /// 查看描述符编号账本
    Ledger(LedgerCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回账本文件的路径
    pub fn ledger(&self) -> PathBuf {
        self.path.join("bins.txt")
    }

    /// 返回某个地点的索引目录
    pub fn record(&self, location: LocationTag) -> PathBuf {
        self.path.join(location.to_string())
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

fn parse_size(s: &str) -> Result<(u32, u32)> {
    let parts: Vec<&str> = s.split('x').collect();
    if parts.len() != 2 {
        return Err(anyhow::anyhow!("无效的尺寸: {}", s));
    }
    Ok((parts[0].parse()?, parts[1].parse()?))
}
