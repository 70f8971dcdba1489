// Deep-dive callbacks: a user pressed a button on a mirrored signal
// card. The text form is CALLBACK:<kind>:<item_id>.

use std::sync::Arc;

use llm_client::Llm;
use tracing::warn;
use uuid::Uuid;

use crate::mirror::Mirror;
use crate::prompts;
use crate::store::ContentStore;

pub const CALLBACK_PREFIX: &str = "CALLBACK:";

const NOT_FOUND_REPLY: &str = "Signal not found or expired.";
const FAILED_REPLY: &str = "Analysis failed, please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    FactCheck,
    Synthesis,
    DeepDive,
}

impl CallbackKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "chk" => Some(Self::FactCheck),
            "syn" => Some(Self::Synthesis),
            "div" => Some(Self::DeepDive),
            _ => None,
        }
    }

    fn prompt(self) -> &'static str {
        match self {
            Self::FactCheck => prompts::FACT_CHECK,
            Self::Synthesis => prompts::SYNTHESIS,
            Self::DeepDive => prompts::DEEP_DIVE,
        }
    }
}

/// Parse `CALLBACK:<kind>:<item_id>`. `None` means the text is not a
/// callback at all; an unknown kind or bad id is reported to the user
/// by [`handle`], so the raw pieces are kept.
pub fn parse(text: &str) -> Option<(Option<CallbackKind>, String)> {
    let rest = text.strip_prefix(CALLBACK_PREFIX)?;
    let (tag, id) = rest.split_once(':')?;
    Some((CallbackKind::from_tag(tag), id.trim().to_string()))
}

/// Run one callback end to end: fetch the item, send a holding message,
/// call the model, reply with the result. Every failure becomes a
/// human-readable reply to the originating chat.
pub async fn handle(
    store: &ContentStore,
    llm: &Arc<dyn Llm>,
    mirror: &Mirror,
    chat_id: &str,
    kind: Option<CallbackKind>,
    item_id: &str,
) {
    let Some(kind) = kind else {
        mirror.reply(chat_id, "Unknown request kind.").await;
        return;
    };

    let Ok(item_id) = Uuid::parse_str(item_id) else {
        mirror.reply(chat_id, NOT_FOUND_REPLY).await;
        return;
    };

    let item = match store.get_content_item(item_id).await {
        Ok(Some(item)) => item,
        Ok(None) => {
            mirror.reply(chat_id, NOT_FOUND_REPLY).await;
            return;
        }
        Err(e) => {
            warn!(%item_id, error = %e, "Callback item lookup failed");
            mirror.reply(chat_id, FAILED_REPLY).await;
            return;
        }
    };

    mirror.reply(chat_id, prompts::HOLDING_MESSAGE).await;

    match llm.generate(&item.raw_text, kind.prompt()).await {
        Ok(answer) => mirror.reply(chat_id, &answer).await,
        Err(e) => {
            warn!(%item_id, ?kind, error = %e, "Callback analysis failed");
            store
                .log_state(
                    "callbacks",
                    "deep dive failed",
                    Some(serde_json::json!({ "item_id": item_id.to_string(), "error": e.to_string() })),
                )
                .await;
            mirror.reply(chat_id, FAILED_REPLY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::Mirror;
    use crate::store::NewContentItem;
    use crate::testing::{test_config, MockLlm, MockSender};

    #[test]
    fn parses_known_kinds() {
        let id = Uuid::new_v4().to_string();
        let (kind, parsed_id) = parse(&format!("CALLBACK:chk:{id}")).unwrap();
        assert_eq!(kind, Some(CallbackKind::FactCheck));
        assert_eq!(parsed_id, id);

        assert_eq!(parse("CALLBACK:syn:x").unwrap().0, Some(CallbackKind::Synthesis));
        assert_eq!(parse("CALLBACK:div:x").unwrap().0, Some(CallbackKind::DeepDive));
    }

    #[test]
    fn unknown_kind_is_kept_for_the_reply() {
        let (kind, _) = parse("CALLBACK:zap:123").unwrap();
        assert!(kind.is_none());
    }

    #[test]
    fn non_callback_text_does_not_parse() {
        assert!(parse("/status").is_none());
        assert!(parse("plain message").is_none());
        assert!(parse("CALLBACK:missingseparator").is_none());
    }

    struct Fixture {
        store: ContentStore,
        llm: Arc<MockLlm>,
        llm_dyn: Arc<dyn Llm>,
        sender: Arc<MockSender>,
        mirror: Mirror,
    }

    async fn fixture() -> Fixture {
        let store = ContentStore::connect("sqlite::memory:").await.unwrap();
        let llm: Arc<MockLlm> = Arc::new(MockLlm::default());
        let sender: Arc<MockSender> = Arc::new(MockSender::default());
        let mirror = Mirror::new(sender.clone(), &test_config())
            .with_retry_base(std::time::Duration::ZERO);
        Fixture { store, llm_dyn: llm.clone(), llm, sender, mirror }
    }

    #[tokio::test]
    async fn missing_item_gets_not_found_reply() {
        let f = fixture().await;
        handle(
            &f.store,
            &f.llm_dyn,
            &f.mirror,
            "user-1",
            Some(CallbackKind::FactCheck),
            &Uuid::new_v4().to_string(),
        )
        .await;

        assert_eq!(f.sender.texts(), vec![NOT_FOUND_REPLY.to_string()]);
        assert_eq!(f.llm.generate_calls(), 0);
    }

    #[tokio::test]
    async fn deep_dive_sends_holding_then_result() {
        let f = fixture().await;
        let item = f
            .store
            .upsert_content_item(NewContentItem {
                source_id: "c1".to_string(),
                source_name: "News".to_string(),
                raw_text: "Central bank hikes rates 25bp.".to_string(),
                content_hash: refinery_common::content_hash("Central bank hikes rates 25bp."),
            })
            .await
            .unwrap();

        f.llm.set_generate_response("A thorough deep dive.");
        handle(
            &f.store,
            &f.llm_dyn,
            &f.mirror,
            "user-1",
            Some(CallbackKind::DeepDive),
            &item.id.to_string(),
        )
        .await;

        let texts = f.sender.texts();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0], prompts::HOLDING_MESSAGE);
        assert_eq!(texts[1], "A thorough deep dive.");
        assert_eq!(f.llm.generate_calls(), 1);
    }

    #[tokio::test]
    async fn unknown_kind_replies_to_user() {
        let f = fixture().await;
        handle(&f.store, &f.llm_dyn, &f.mirror, "user-1", None, "whatever").await;
        assert_eq!(f.sender.texts(), vec!["Unknown request kind.".to_string()]);
    }
}
