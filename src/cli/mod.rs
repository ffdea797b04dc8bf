mod add;
mod ledger;
mod locate;
mod r#match;
mod search;

pub use add::*;
use clap::ValueEnum;
pub use ledger::*;
pub use locate::*;
pub use r#match::*;
pub use search::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> anyhow::Result<()>;
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}
