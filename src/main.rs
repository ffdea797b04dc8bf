use clap::Parser;
use log::debug;
use placeid::Opts;
use placeid::cli::SubCommandExtend;
use placeid::config::SubCommand;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();
    debug!("{opts:?}");

    match &opts.subcmd {
        SubCommand::Add(config) => config.run(&opts),
        SubCommand::Search(config) => config.run(&opts),
        SubCommand::Locate(config) => config.run(&opts),
        SubCommand::Match(config) => config.run(&opts),
        SubCommand::Ledger(config) => config.run(&opts),
    }
}
