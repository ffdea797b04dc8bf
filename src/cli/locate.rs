use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::cli::{OutputFormat, SubCommandExtend};
use crate::config::{ExtractOptions, IndexOptions, Opts};
use crate::matcher::LOWE_RATIO;
use crate::recogniser::{Locator, Ranked};

#[derive(Parser, Debug, Clone)]
pub struct LocateCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    /// Lowe 比值检验的比值
    #[arg(long, value_name = "RATIO", default_value_t = LOWE_RATIO)]
    pub ratio: f32,
    /// 被搜索的图片路径
    pub image: PathBuf,
    /// 显示的结果数量
    #[arg(long, value_name = "COUNT", default_value_t = 10)]
    pub count: usize,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for LocateCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let mut locator =
            Locator::open(opts.conf_dir.path(), self.extract.create()?, &(&self.index).into(), self.ratio)?;
        let mut result = locator.locate(&self.image)?;
        result.truncate(self.count);
        print_result(&result, self.output_format)
    }
}

fn print_result(result: &[Ranked], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            for r in result {
                println!("{}\t{}", r.count, r.location);
            }
        }
    }
    Ok(())
}
