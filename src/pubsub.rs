use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::protocol::RESP;

/// Invoked with `(channel, payload)` for every published message delivered
/// to a subscription this handler was registered for.
pub type MessageHandler = Arc<dyn Fn(&str, RESP) + Send + Sync>;

/// Invoked with `(channel, subscription count reported by the server)` when
/// a subscribe or unsubscribe confirmation arrives.
pub type SubscriptionChangeHandler = Arc<dyn Fn(&str, i64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Exact,
    Pattern,
}

impl SubscriptionKind {
    pub(crate) fn subscribe_command(&self) -> &'static str {
        match self {
            SubscriptionKind::Exact => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
        }
    }

    pub(crate) fn unsubscribe_command(&self) -> &'static str {
        match self {
            SubscriptionKind::Exact => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    Message,
    PMessage,
}

impl PushKind {
    fn from_name(name: &str) -> Option<PushKind> {
        if name.eq_ignore_ascii_case("subscribe") {
            Some(PushKind::Subscribe)
        } else if name.eq_ignore_ascii_case("unsubscribe") {
            Some(PushKind::Unsubscribe)
        } else if name.eq_ignore_ascii_case("psubscribe") {
            Some(PushKind::PSubscribe)
        } else if name.eq_ignore_ascii_case("punsubscribe") {
            Some(PushKind::PUnsubscribe)
        } else if name.eq_ignore_ascii_case("message") {
            Some(PushKind::Message)
        } else if name.eq_ignore_ascii_case("pmessage") {
            Some(PushKind::PMessage)
        } else {
            None
        }
    }
}

/// Does this frame look like a pub/sub push? Only consulted on connections
/// with subscriptions enabled; everything else pairs with the command queue.
pub(crate) fn is_push_frame(value: &RESP) -> bool {
    match value {
        RESP::Array(Some(parts)) => parts
            .first()
            .and_then(|p| p.as_text())
            .and_then(PushKind::from_name)
            .is_some(),
        _ => false,
    }
}

/// A decoded push frame. `channel` carries the pattern for p-subscription
/// confirmations and the concrete channel for everything else.
pub(crate) struct PushMessage {
    pub(crate) kind: PushKind,
    pub(crate) channel: String,
    pub(crate) pattern: Option<String>,
    pub(crate) payload: Option<RESP>,
    pub(crate) count: Option<i64>,
}

impl PushMessage {
    pub(crate) fn parse(value: RESP) -> Option<PushMessage> {
        let mut parts = match value {
            RESP::Array(Some(parts)) => parts,
            _ => return None,
        };
        let kind = parts.first().and_then(|p| p.as_text()).and_then(PushKind::from_name)?;
        match kind {
            PushKind::Subscribe
            | PushKind::Unsubscribe
            | PushKind::PSubscribe
            | PushKind::PUnsubscribe => {
                if parts.len() != 3 {
                    return None;
                }
                let count = parts[2].as_integer()?;
                let channel = parts[1].as_text()?.to_owned();
                Some(PushMessage {
                    kind,
                    channel,
                    pattern: None,
                    payload: None,
                    count: Some(count),
                })
            }
            PushKind::Message => {
                if parts.len() != 3 {
                    return None;
                }
                let payload = parts.pop();
                let channel = parts[1].as_text()?.to_owned();
                Some(PushMessage {
                    kind,
                    channel,
                    pattern: None,
                    payload,
                    count: None,
                })
            }
            PushKind::PMessage => {
                if parts.len() != 4 {
                    return None;
                }
                let payload = parts.pop();
                let channel = parts[2].as_text()?.to_owned();
                let pattern = parts[1].as_text()?.to_owned();
                Some(PushMessage {
                    kind,
                    channel,
                    pattern: Some(pattern),
                    payload,
                    count: None,
                })
            }
        }
    }

    fn is_unsubscribe(&self) -> bool {
        matches!(self.kind, PushKind::Unsubscribe | PushKind::PUnsubscribe)
    }
}

pub(crate) struct SubscriptionEntry {
    pub(crate) on_message: MessageHandler,
    pub(crate) on_subscribe: Option<SubscriptionChangeHandler>,
    pub(crate) on_unsubscribe: Option<SubscriptionChangeHandler>,
}

/// Handler bookkeeping for the pinned pub/sub connection. Keyed by exact
/// channel name or by pattern, matching the two subscribe families.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    channels: Mutex<HashMap<String, Arc<SubscriptionEntry>>>,
    patterns: Mutex<HashMap<String, Arc<SubscriptionEntry>>>,
}

impl SubscriptionRegistry {
    fn table(&self, kind: SubscriptionKind) -> &Mutex<HashMap<String, Arc<SubscriptionEntry>>> {
        match kind {
            SubscriptionKind::Exact => &self.channels,
            SubscriptionKind::Pattern => &self.patterns,
        }
    }

    pub(crate) fn register(
        &self,
        kind: SubscriptionKind,
        names: &[String],
        on_message: MessageHandler,
        on_subscribe: Option<SubscriptionChangeHandler>,
        on_unsubscribe: Option<SubscriptionChangeHandler>,
    ) {
        let mut table = self.table(kind).lock().unwrap();
        for name in names {
            table.insert(
                name.clone(),
                Arc::new(SubscriptionEntry {
                    on_message: on_message.clone(),
                    on_subscribe: on_subscribe.clone(),
                    on_unsubscribe: on_unsubscribe.clone(),
                }),
            );
        }
    }

    fn entry(&self, kind: SubscriptionKind, name: &str) -> Option<Arc<SubscriptionEntry>> {
        self.table(kind).lock().unwrap().get(name).cloned()
    }

    fn remove(&self, kind: SubscriptionKind, name: &str) -> Option<Arc<SubscriptionEntry>> {
        self.table(kind).lock().unwrap().remove(name)
    }

    fn dispatch(&self, push: &PushMessage) {
        match push.kind {
            PushKind::Message => {
                if let (Some(entry), Some(payload)) =
                    (self.entry(SubscriptionKind::Exact, &push.channel), push.payload.clone())
                {
                    (entry.on_message)(&push.channel, payload);
                } else {
                    debug!("dropping message for unsubscribed channel {}", push.channel);
                }
            }
            PushKind::PMessage => {
                let pattern = push.pattern.as_deref().unwrap_or("");
                if let (Some(entry), Some(payload)) =
                    (self.entry(SubscriptionKind::Pattern, pattern), push.payload.clone())
                {
                    (entry.on_message)(&push.channel, payload);
                } else {
                    debug!("dropping pmessage for unsubscribed pattern {}", pattern);
                }
            }
            PushKind::Subscribe | PushKind::PSubscribe => {
                let kind = if push.kind == PushKind::Subscribe {
                    SubscriptionKind::Exact
                } else {
                    SubscriptionKind::Pattern
                };
                if let Some(entry) = self.entry(kind, &push.channel) {
                    if let Some(handler) = &entry.on_subscribe {
                        handler(&push.channel, push.count.unwrap_or(0));
                    }
                }
            }
            PushKind::Unsubscribe | PushKind::PUnsubscribe => {
                let kind = if push.kind == PushKind::Unsubscribe {
                    SubscriptionKind::Exact
                } else {
                    SubscriptionKind::Pattern
                };
                if let Some(entry) = self.remove(kind, &push.channel) {
                    if let Some(handler) = &entry.on_unsubscribe {
                        handler(&push.channel, push.count.unwrap_or(0));
                    }
                }
            }
        }
    }
}

/// Consumes push frames from the pinned connection and dispatches them.
/// Returns the push receiver once the server reports zero remaining
/// subscriptions (so the connection can be unpinned and later re-pinned) or
/// once the connection goes away.
pub(crate) async fn run_push_driver(
    mut pushes: mpsc::UnboundedReceiver<RESP>,
    registry: Arc<SubscriptionRegistry>,
) -> mpsc::UnboundedReceiver<RESP> {
    loop {
        let frame = match pushes.recv().await {
            Some(frame) => frame,
            None => break,
        };
        match PushMessage::parse(frame) {
            Some(push) => {
                let drained = push.is_unsubscribe() && push.count == Some(0);
                registry.dispatch(&push);
                if drained {
                    debug!("subscription count reached zero, releasing pub/sub connection");
                    break;
                }
            }
            None => warn!("ignoring malformed push frame"),
        }
    }
    pushes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn push(parts: Vec<RESP>) -> RESP {
        RESP::Array(Some(parts))
    }

    #[test]
    fn test_push_frame_detection() {
        assert!(is_push_frame(&push(vec![
            RESP::bulk("message"),
            RESP::bulk("news"),
            RESP::bulk("hello"),
        ])));
        assert!(is_push_frame(&push(vec![
            RESP::bulk("subscribe"),
            RESP::bulk("news"),
            RESP::Integer(1),
        ])));
        assert!(!is_push_frame(&RESP::simple("OK")));
        assert!(!is_push_frame(&push(vec![RESP::bulk("GET"), RESP::bulk("k")])));
    }

    #[test]
    fn test_parse_message() {
        let parsed = PushMessage::parse(push(vec![
            RESP::bulk("message"),
            RESP::bulk("news"),
            RESP::bulk("hello"),
        ]))
        .unwrap();
        assert_eq!(parsed.kind, PushKind::Message);
        assert_eq!(parsed.channel, "news");
        assert_eq!(parsed.payload, Some(RESP::bulk("hello")));
    }

    #[test]
    fn test_parse_pmessage() {
        let parsed = PushMessage::parse(push(vec![
            RESP::bulk("pmessage"),
            RESP::bulk("news.*"),
            RESP::bulk("news.uk"),
            RESP::bulk("hello"),
        ]))
        .unwrap();
        assert_eq!(parsed.kind, PushKind::PMessage);
        assert_eq!(parsed.pattern.as_deref(), Some("news.*"));
        assert_eq!(parsed.channel, "news.uk");
    }

    #[test]
    fn test_parse_unsubscribe_count() {
        let parsed = PushMessage::parse(push(vec![
            RESP::bulk("unsubscribe"),
            RESP::bulk("news"),
            RESP::Integer(0),
        ]))
        .unwrap();
        assert_eq!(parsed.kind, PushKind::Unsubscribe);
        assert_eq!(parsed.count, Some(0));
    }

    #[test]
    fn test_registry_dispatch_and_removal() {
        let registry = SubscriptionRegistry::default();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        registry.register(
            SubscriptionKind::Exact,
            &["news".to_owned()],
            Arc::new(move |channel, _payload| {
                assert_eq!(channel, "news");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            None,
            None,
        );

        let message = PushMessage::parse(push(vec![
            RESP::bulk("message"),
            RESP::bulk("news"),
            RESP::bulk("hi"),
        ]))
        .unwrap();
        registry.dispatch(&message);
        assert_eq!(received.load(Ordering::SeqCst), 1);

        let unsubscribe = PushMessage::parse(push(vec![
            RESP::bulk("unsubscribe"),
            RESP::bulk("news"),
            RESP::Integer(0),
        ]))
        .unwrap();
        registry.dispatch(&unsubscribe);

        // handler is gone now
        registry.dispatch(&message);
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
