use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde_json::json;

use crate::cli::{OutputFormat, SubCommandExtend};
use crate::config::{ExtractOptions, MatchOptions, Opts};
use crate::homography::Homography;
use crate::rootsift::root_sift_all;
use crate::verify::{MatchParams, match_batch, match_pair};

#[derive(Parser, Debug, Clone)]
pub struct MatchCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub matching: MatchOptions,
    /// 查询图片
    pub query: PathBuf,
    /// 参考图片，指定多张时在同一个索引中匹配
    #[arg(required = true)]
    pub references: Vec<PathBuf>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for MatchCommand {
    fn run(&self, _opts: &Opts) -> Result<()> {
        let mut extractor = self.extract.create()?;
        let mut query = vec![extractor.detect_file(&self.query)?];
        let mut references = extractor.detect_files(&self.references)?;
        root_sift_all(&mut query)?;
        root_sift_all(&mut references)?;
        let params = MatchParams::from(&self.matching);

        if let [reference] = references.as_slice() {
            let result = match_pair(&query[0], reference, &params)?;
            match self.output_format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "ratio_matches": result.ratio_matches.len(),
                        "matches": result.matches,
                        "homography": result.homography.as_array(),
                        "area_ratio": result.area_ratio,
                    }))?
                ),
                OutputFormat::Table => {
                    println!("ratio matches\t{}", result.ratio_matches.len());
                    println!("verified\t{}", result.matches.len());
                    print_homography(&result.homography);
                    if let Some(ratio) = result.area_ratio {
                        println!("area ratio\t{ratio:.6}");
                    }
                }
            }
            return Ok(());
        }

        let result = match_batch(&query[0], &references, &params)?;
        match self.output_format {
            OutputFormat::Json => {
                let images = self
                    .references
                    .iter()
                    .zip(&result.counts)
                    .zip(&result.homographies)
                    .map(|((path, count), h)| {
                        json!({ "image": path, "verified": count, "homography": h.as_array() })
                    })
                    .collect::<Vec<_>>();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "ratio_matches": result.ratio_matches.len(),
                        "images": images,
                    }))?
                )
            }
            OutputFormat::Table => {
                println!("ratio matches\t{}", result.ratio_matches.len());
                for (path, count) in self.references.iter().zip(&result.counts) {
                    println!("{count}\t{}", path.display());
                }
            }
        }
        Ok(())
    }
}

fn print_homography(h: &Homography) {
    for row in h.as_array() {
        println!("{:>12.6} {:>12.6} {:>12.6}", row[0], row[1], row[2]);
    }
}
