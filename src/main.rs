mod cli;

use aes128_cli::logging;
use clap::Parser;
use tracing::{debug, error};

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();

    let ctx = match cli::load_context(&args) {
        Ok(ctx) => ctx,
        Err(err) => {
            let _guard = logging::init_default_logging();
            error!("failed to load configuration: {err}");
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    // Keep the guard alive so file logs are flushed on exit
    let _guard = logging::init_logging(args.log_options(&ctx.config));
    debug!(state_dir = %ctx.paths.dir().display(), "starting aes128-cli");

    if let Err(err) = cli::run(args, ctx).await {
        debug!("command failed: {err:?}");
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
