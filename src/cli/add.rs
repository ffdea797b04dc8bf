use std::path::PathBuf;

use anyhow::ensure;
use clap::Parser;
use indicatif::{ParallelProgressIterator, ProgressBar};
use log::info;
use rayon::prelude::*;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, IndexOptions, Opts};
use crate::ledger::BinLedger;
use crate::store::{IndexStore, group_by_location, save_features};
use crate::utils::{pb_style, scan_images, suffix_regex};

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    /// 图片所在目录，文件名需以 `<lat>,<lng>,` 开头
    pub path: PathBuf,
    /// 冒号分隔的文件名列表，指定后只将这些图片作为同一地点添加
    /// 例：`48.85,2.29,1.jpg:48.85,2.29,2.jpg`
    #[arg(long, verbatim_doc_comment)]
    pub names: Option<String>,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,png")]
    pub suffix: String,
}

impl SubCommandExtend for AddCommand {
    fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        if let Some(names) = &self.names {
            let mut extractor = self.extract.create()?;
            let record = save_features(
                &self.path,
                names,
                opts.conf_dir.path(),
                opts.conf_dir.ledger(),
                extractor.as_mut(),
                (&self.index).into(),
            )?;
            println!("{}\t{}\t{}-{}", record.location, record.total, record.start_bin, record.end_bin);
            return Ok(());
        }

        let re_suf = suffix_regex(&self.suffix)?;
        info!("开始扫描目录: {}", self.path.display());
        let groups = group_by_location(scan_images(&self.path, &re_suf));
        info!("扫描完成，共 {} 个地点", groups.len());

        let store = IndexStore::new(
            opts.conf_dir.path(),
            BinLedger::new(opts.conf_dir.ledger()),
            (&self.index).into(),
        );
        let pb = ProgressBar::new(groups.len() as u64).with_style(pb_style());

        let failed = groups
            .par_iter()
            .progress_with(pb.clone())
            .filter(|(location, paths)| {
                let result = self
                    .extract
                    .create()
                    .and_then(|mut extractor| store.ingest(*location, paths, extractor.as_mut()));
                match result {
                    Ok(record) => {
                        pb.set_message(format!("{}: {} 个描述符", location, record.total));
                        false
                    }
                    Err(e) => {
                        pb.println(format!("添加 {location} 失败: {e:#}"));
                        true
                    }
                }
            })
            .count();

        pb.finish_with_message("图片添加完成");
        ensure!(failed == 0, "{failed} 个地点添加失败");
        Ok(())
    }
}
