// Operator commands on the inbound channel. Commands never reach the
// ingest pipeline; every path produces a reply.

use refinery_common::{ChannelStatus, ChannelType, RefineryError};
use uuid::Uuid;

use crate::store::ContentStore;

const HELP_TEXT: &str = "\
Commands:\n\
/status - item, signal, and channel counters\n\
/add <name> <url> - register an RSS/Atom feed\n\
/ignore <id> - stop polling a channel\n\
/help - this listing";

/// Outcome classes: a normal reply, a user mistake (replied, not
/// logged as an error), or an internal failure (logged, generic reply).
#[derive(Debug)]
pub enum CommandOutcome {
    Reply(String),
    UserError(String),
    Internal(RefineryError),
}

impl CommandOutcome {
    /// The text sent back to the user in every case.
    pub fn reply_text(&self) -> String {
        match self {
            CommandOutcome::Reply(text) | CommandOutcome::UserError(text) => text.clone(),
            CommandOutcome::Internal(_) => "Command failed, please try again.".to_string(),
        }
    }
}

/// Dispatch on the first token, case-insensitively.
pub async fn dispatch(store: &ContentStore, text: &str) -> CommandOutcome {
    let mut parts = text.split_whitespace();
    let command = parts.next().unwrap_or("").to_ascii_lowercase();

    match command.as_str() {
        "/status" => match store.stats().await {
            Ok(stats) => CommandOutcome::Reply(format!(
                "items={} signals={} channels={}",
                stats.items, stats.signals, stats.channels
            )),
            Err(e) => CommandOutcome::Internal(e),
        },

        "/add" => {
            let (Some(name), Some(url)) = (parts.next(), parts.next()) else {
                return CommandOutcome::UserError("usage: /add <name> <url>".to_string());
            };
            match url::Url::parse(url) {
                Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {}
                _ => return CommandOutcome::UserError(format!("not a valid feed url: {url}")),
            }
            match store.upsert_channel(name, ChannelType::Feed, Some(url)).await {
                Ok(outcome) if outcome.inserted => {
                    CommandOutcome::Reply(format!("registered feed '{name}' ({})", outcome.id))
                }
                Ok(outcome) => {
                    CommandOutcome::Reply(format!("'{name}' already registered ({})", outcome.id))
                }
                Err(e) => CommandOutcome::Internal(e),
            }
        }

        "/ignore" => {
            let Some(id) = parts.next() else {
                return CommandOutcome::UserError("usage: /ignore <id>".to_string());
            };
            let Ok(id) = Uuid::parse_str(id) else {
                return CommandOutcome::UserError(format!("not a channel id: {id}"));
            };
            match store.set_channel_status(id, ChannelStatus::Ignored).await {
                Ok(true) => CommandOutcome::Reply(format!("channel {id} ignored")),
                Ok(false) => CommandOutcome::UserError(format!("unknown channel id: {id}")),
                Err(e) => CommandOutcome::Internal(e),
            }
        }

        "/help" => CommandOutcome::Reply(HELP_TEXT.to_string()),

        _ => CommandOutcome::UserError("unknown command".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> ContentStore {
        ContentStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn status_reports_counters() {
        let store = test_store().await;
        let outcome = dispatch(&store, "/status").await;
        assert!(matches!(&outcome, CommandOutcome::Reply(text) if text == "items=0 signals=0 channels=0"));
    }

    #[tokio::test]
    async fn status_is_case_insensitive() {
        let store = test_store().await;
        let outcome = dispatch(&store, "/STATUS").await;
        assert!(matches!(outcome, CommandOutcome::Reply(_)));
    }

    #[tokio::test]
    async fn add_registers_feed_channel() {
        let store = test_store().await;
        let outcome = dispatch(&store, "/add macro https://example.com/rss").await;
        assert!(matches!(&outcome, CommandOutcome::Reply(text) if text.contains("registered feed 'macro'")));

        let feeds = store
            .list_channels(Some(ChannelType::Feed))
            .await
            .unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].feed_url.as_deref(), Some("https://example.com/rss"));
    }

    #[tokio::test]
    async fn add_rejects_bad_arguments() {
        let store = test_store().await;
        assert!(matches!(dispatch(&store, "/add onlyname").await, CommandOutcome::UserError(_)));
        assert!(matches!(
            dispatch(&store, "/add macro ftp://example.com").await,
            CommandOutcome::UserError(_)
        ));
    }

    #[tokio::test]
    async fn ignore_flips_channel_status() {
        let store = test_store().await;
        let channel = store
            .upsert_channel("macro", ChannelType::Feed, Some("https://example.com/rss"))
            .await
            .unwrap();

        let outcome = dispatch(&store, &format!("/ignore {}", channel.id)).await;
        assert!(matches!(outcome, CommandOutcome::Reply(_)));

        let loaded = store.get_channel(channel.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ChannelStatus::Ignored);
    }

    #[tokio::test]
    async fn ignore_unknown_id_is_a_user_error() {
        let store = test_store().await;
        let outcome = dispatch(&store, &format!("/ignore {}", Uuid::new_v4())).await;
        assert!(matches!(outcome, CommandOutcome::UserError(_)));
    }

    #[tokio::test]
    async fn unknown_command_replies_unknown() {
        let store = test_store().await;
        let outcome = dispatch(&store, "/frobnicate now").await;
        assert!(matches!(&outcome, CommandOutcome::UserError(text) if text == "unknown command"));
    }
}
