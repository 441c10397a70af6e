use clap::Parser;

use classroom_tutor_lib::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    cli::init_logging(&args);

    classroom_tutor_lib::run(args).await
}
