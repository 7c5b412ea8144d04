use crate::command::check_available;
use crate::config::Config;
use crate::web::start_web_server;

mod command;
mod compiler;
mod config;
mod models;
mod processor;
mod web;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();

    config.ensure_staging_dirs().await?;

    match check_available(&config.ffmpeg_program).await {
        Ok(version) => log::info!("Using {version}"),
        Err(err) => log::warn!(
            "{} cannot be launched, every job will fail until it is installed: {}",
            config.ffmpeg_program,
            err
        ),
    }

    start_web_server(config).await
}
