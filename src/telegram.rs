use std::{collections::HashSet, error::Error, sync::Arc};

use teloxide::{
    payloads::SendMessageSetters,
    prelude::*,
    types::{Me, ParseMode, ReplyParameters},
    utils::command::BotCommands,
};
use telequeue::{
    constants::TELEGRAM_MESSAGE_LIMIT,
    format::{MessageFmtBrief, MessageFmtDetailed, Notice, NoticeKind},
    notify::Notifier,
    scheduler::Scheduler,
    task::Mid,
};

use crate::runner::SharedJobs;

/// These commands are supported:
#[derive(BotCommands)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    /// Display this text
    Help,
    /// Start
    Start,
    /// Id
    Id,
    /// Running and queued tasks
    Status,
}

/// Sends every scheduler event to the configured admins.
pub struct TelegramNotifier {
    bot: Bot,
    admins: Vec<ChatId>,
    jobs: SharedJobs,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, admins: &[i64], jobs: SharedJobs) -> Self {
        Self {
            bot,
            admins: admins.iter().copied().map(ChatId).collect(),
            jobs,
        }
    }

    fn send(&self, kind: NoticeKind, mid: Mid, reason: &str) {
        let notice = Notice {
            kind,
            mid,
            name: self.jobs.read().get(mid).map(|task| task.name()),
            reason: reason.to_string(),
        };
        tracing::info!("{}", MessageFmtBrief(&notice));
        let text = MessageFmtDetailed(&notice).to_string();
        for &chat_id in self.admins.iter() {
            let bot = self.bot.clone();
            let text = text.clone();
            tokio::spawn(async move {
                if let Err(e) = bot.send_message(chat_id, text).await {
                    tracing::warn!("Failed to send notice to {chat_id}: {e}");
                }
            });
        }
    }
}

impl Notifier for TelegramNotifier {
    fn on_warn(&self, mid: Mid, reason: &str) {
        self.send(NoticeKind::Warn, mid, reason);
    }

    fn on_cancel(&self, mid: Mid, reason: &str) {
        self.send(NoticeKind::Cancel, mid, reason);
    }

    fn on_queued(&self, mid: Mid, reason: &str) {
        self.send(NoticeKind::Queued, mid, reason);
    }

    fn on_resumed(&self, mid: Mid, reason: &str) {
        self.send(NoticeKind::Resumed, mid, reason);
    }
}

pub struct BotState {
    pub scheduler: Arc<Scheduler>,
    pub jobs: SharedJobs,
    pub admins: HashSet<i64>,
}

impl BotState {
    #[inline]
    pub fn auth(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }

    fn status_text(&self) -> String {
        let counts = self.scheduler.counts();
        let level = self.scheduler.resources().constraint_level(false);
        let header = format!("Load: {level}\n{}", MessageFmtDetailed(counts));
        let jobs = self.jobs.read();
        let mut tasks: Vec<_> = jobs.iter().collect();
        tasks.sort_unstable_by_key(|task| task.mid());
        let lines: Vec<String> = tasks
            .into_iter()
            .map(|task| MessageFmtBrief(task).to_string())
            .collect();
        join_limited(header, lines, TELEGRAM_MESSAGE_LIMIT)
    }
}

/// Append `lines` to `header` while the text stays within `limit`
/// characters, ending with a count of the lines left out.
fn join_limited(header: String, lines: Vec<String>, limit: usize) -> String {
    // Room for "\n... and N more".
    const TAIL_RESERVE: usize = 32;
    let mut text = header;
    let mut len = text.chars().count();
    let total = lines.len();
    for (idx, line) in lines.into_iter().enumerate() {
        let line_len = line.chars().count() + 1;
        let reserve = if idx + 1 < total { TAIL_RESERVE } else { 0 };
        if len + line_len + reserve > limit {
            text.push_str(&format!("\n... and {} more", total - idx));
            return text;
        }
        text.push('\n');
        text.push_str(&line);
        len += line_len;
    }
    text
}

pub async fn message_handler(
    bot: Bot,
    msg: Message,
    me: Me,
    state: Arc<BotState>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let Some(cmd) = msg
        .text()
        .and_then(|text| BotCommands::parse(text, me.username()).ok())
    else {
        bot.send_message(msg.chat.id, "Command not found!").await?;
        return Ok(());
    };

    match cmd {
        Command::Help => {
            // Just send the description of all commands.
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .reply_parameters(ReplyParameters::new(msg.id))
                .await?;
        }
        Command::Start => {
            bot.send_message(
                msg.chat.id,
                "Welcome to telequeue!\nUse /help to get help.\nUse /status to see running and queued tasks.",
            )
            .await?;
        }
        Command::Id => {
            bot.send_message(msg.chat.id, format!("`{}`", msg.chat.id))
                .parse_mode(ParseMode::MarkdownV2)
                .reply_parameters(ReplyParameters::new(msg.id))
                .await?;
        }
        Command::Status => {
            if !state.auth(msg.chat.id.0) {
                bot.send_message(
                    msg.chat.id,
                    format!(
                        "User or group({}) are not authorized to use this command!",
                        msg.chat.id.0
                    ),
                )
                .await?;
                return Ok(());
            }
            bot.send_message(msg.chat.id, state.status_text())
                .reply_parameters(ReplyParameters::new(msg.id))
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_limited_keeps_short_lists() {
        let lines = vec!["a".to_string(), "b".to_string()];
        assert_eq!(join_limited("head".to_string(), lines, 100), "head\na\nb");
    }

    #[test]
    fn test_join_limited_truncates_long_lists() {
        let lines: Vec<String> = (0..1000).map(|i| format!("task line {i:04} {}", "x".repeat(40))).collect();
        let text = join_limited("head".to_string(), lines, TELEGRAM_MESSAGE_LIMIT);
        assert!(text.chars().count() <= TELEGRAM_MESSAGE_LIMIT);
        assert!(text.starts_with("head\ntask line 0000"));
        assert!(text.ends_with(" more"));
        let shown = text.lines().filter(|l| l.starts_with("task line")).count();
        assert!(text.ends_with(&format!("... and {} more", 1000 - shown)));
    }
}
