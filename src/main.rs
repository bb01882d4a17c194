use clap::Parser;

use mitmqtt::cli::Args;
use mitmqtt::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    mitmqtt::bootstrap(args.log)?;

    tracing::debug!("Parsed arguments: {args:?}");

    mitmqtt::cli::main(args)
}
