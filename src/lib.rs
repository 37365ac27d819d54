pub mod cli;
pub mod config;
pub mod history;
pub mod llm;
pub mod models;
pub mod session;
pub mod stream;

use cli::{ commands, Args, Command };
use config::Config;
use log::debug;
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = Config::load();
    debug!("Default provider: {}", config.default_provider);

    match &args.command {
        Some(Command::History { search, limit }) => commands::history(&args, search, *limit).await,
        Some(Command::Show { id }) => commands::show(&args, *id).await,
        Some(Command::Models) => commands::models(&args, &config),
        None => commands::chat(&args, &config).await,
    }
}
