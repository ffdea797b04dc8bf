use std::path::PathBuf;

use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, IndexOptions, Opts};
use crate::location::LocationTag;
use crate::matcher::LOWE_RATIO;
use crate::recogniser::Recogniser;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    /// Lowe 比值检验的比值
    #[arg(long, value_name = "RATIO", default_value_t = LOWE_RATIO)]
    pub ratio: f32,
    /// 地点，格式为 `<lat>,<lng>`
    #[arg(allow_hyphen_values = true)]
    pub location: LocationTag,
    /// 被搜索的图片路径
    pub image: PathBuf,
}

impl SubCommandExtend for SearchCommand {
    fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let mut recogniser = Recogniser::open(
            opts.conf_dir.record(self.location),
            self.extract.create()?,
            &(&self.index).into(),
            self.ratio,
        )?;
        let count = recogniser.query(&self.image)?;
        println!("{count}");
        Ok(())
    }
}
