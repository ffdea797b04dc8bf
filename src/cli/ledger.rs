use anyhow::{Result, anyhow};
use clap::Parser;

use crate::cli::{OutputFormat, SubCommandExtend};
use crate::config::Opts;
use crate::ledger::BinLedger;

#[derive(Parser, Debug, Clone)]
pub struct LedgerCommand {
    /// 只显示包含该描述符编号的记录
    #[arg(long, value_name = "ID")]
    pub bin: Option<u64>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for LedgerCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let ledger = BinLedger::new(opts.conf_dir.ledger());
        let entries = match self.bin {
            Some(bin) => {
                let entry = ledger.find_bin(bin)?.ok_or_else(|| anyhow!("编号 {bin} 不在账本中"))?;
                vec![entry]
            }
            None => ledger.entries()?,
        };

        match self.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
            OutputFormat::Table => {
                for entry in entries {
                    println!("{entry}");
                }
            }
        }
        Ok(())
    }
}
