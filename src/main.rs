use ask::cli::Args;
use clap::Parser;
use dotenv::dotenv;
use std::process;

#[tokio::main]
async fn main() {
    dotenv().ok();
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = ask::run(args).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
