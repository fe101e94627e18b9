mod aria2;
mod runner;
mod telegram;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use telequeue::{
    config::Config,
    notify::{LogNotifier, Notifier},
    scheduler::Scheduler,
};
use teloxide::prelude::*;
use tracing_subscriber::EnvFilter;

use aria2::Aria2Client;
use runner::{Actions, Aria2Notifier, Runner, SharedJobs};
use telegram::{BotState, TelegramNotifier};

#[derive(Parser, Debug, Default, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path of config toml file.
    #[arg(short, long)]
    pub config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,telequeue=debug")),
        )
        .init();

    let config_file = Args::parse()
        .config
        .or_else(|| {
            std::env::var("CONFIG_PATH")
                .ok()
                .and_then(|s| if s.is_empty() { None } else { Some(s) })
        })
        .unwrap_or_else(|| "config.toml".to_string());
    tracing::info!("Use config file: {config_file}");
    let config = Config::load_from(&config_file)
        .with_context(|| format!("unable to load config {config_file}"))?;
    tracing::info!("Config file {config_file} load successfully");

    let aria2_config = config
        .aria2
        .clone()
        .context("config has no [aria2] section")?;
    let client = Aria2Client::connect(&aria2_config).await?;
    tracing::info!("Connected to aria2 at {}", aria2_config.rpc_url);

    let jobs = SharedJobs::default();
    let actions = Actions::spawn(client.clone());
    let bot = config.telegram.as_ref().map(|tg| Bot::new(&tg.token));
    let relay: Arc<dyn Notifier> = match (&bot, &config.telegram) {
        (Some(bot), Some(tg)) => Arc::new(TelegramNotifier::new(
            bot.clone(),
            &tg.admins,
            jobs.clone(),
        )),
        _ => Arc::new(LogNotifier),
    };
    let notifier = Arc::new(Aria2Notifier::new(jobs.clone(), actions.clone(), relay));
    let scheduler = Arc::new(Scheduler::new(&config, notifier));

    let runner = Arc::new(Runner::new(client, scheduler.clone(), jobs.clone(), actions));
    let _runner = runner.spawn();
    let _monitor = scheduler.spawn_monitor();

    match (bot, config.telegram) {
        (Some(bot), Some(tg)) => {
            let state = Arc::new(BotState {
                scheduler,
                jobs,
                admins: tg.admins.into_iter().collect(),
            });
            let handler =
                dptree::entry().branch(Update::filter_message().endpoint(telegram::message_handler));

            tracing::info!("Bot created and running");
            Dispatcher::builder(bot, handler)
                .dependencies(dptree::deps![state])
                .enable_ctrlc_handler()
                .build()
                .dispatch()
                .await;
        }
        _ => {
            tracing::info!("No [telegram] section, running until interrupted");
            tokio::signal::ctrl_c().await?;
        }
    }
    Ok(())
}
