//! Single writer of the streaming assistant message.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::warn;

use crate::playback::RevealTick;
use crate::types::{ChatMessage, MessageId};

/// Callback the surrounding store uses to persist the message list.
pub type MessagesChangeFn = Arc<dyn Fn(&[ChatMessage]) + Send + Sync>;

#[derive(Default)]
struct Ledger {
    messages: Vec<ChatMessage>,
    /// Trailing assistant message of the in-flight turn, if any.
    open: Option<MessageId>,
}

/// Owns the session's message list.
///
/// Only the trailing assistant message of the current turn is ever mutated,
/// and only while it is open. The list is never reordered.
#[derive(Clone)]
pub struct MessageReconciler {
    ledger: Arc<Mutex<Ledger>>,
    on_change: Option<MessagesChangeFn>,
}

impl MessageReconciler {
    pub fn new(history: Vec<ChatMessage>, on_change: Option<MessagesChangeFn>) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger {
                messages: history,
                open: None,
            })),
            on_change,
        }
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock().messages.clone()
    }

    pub fn open_message(&self) -> Option<MessageId> {
        self.lock().open
    }

    /// Append the user message and an empty assistant placeholder together.
    pub fn begin_turn(&self, text: &str) -> MessageId {
        let placeholder = ChatMessage::placeholder();
        let id = placeholder.id;
        self.update(|ledger| {
            if let Some(stale) = ledger.open.take() {
                warn!(message_id = %stale, "Previous turn was never finalized");
            }
            ledger.messages.push(ChatMessage::user(text));
            ledger.messages.push(placeholder);
            ledger.open = Some(id);
            true
        });
        id
    }

    /// Write a reveal tick into the open message.
    ///
    /// Tools and duration are attached only by the settling tick.
    pub fn apply_reveal(&self, tick: &RevealTick) {
        self.update(|ledger| {
            let Some(msg) = open_slot(ledger) else {
                return false;
            };
            msg.content.clone_from(&tick.content);
            if tick.is_final {
                msg.tools_used.clone_from(&tick.tools_used);
                msg.duration_ms = tick.elapsed.map(duration_ms);
            }
            true
        });
    }

    /// Bake the final content into the open message and close it.
    pub fn finalize(&self, content: &str, tools_used: &[String], elapsed: Duration) {
        self.update(|ledger| {
            let Some(msg) = open_slot(ledger) else {
                return false;
            };
            msg.content = content.to_string();
            msg.tools_used = tools_used.to_vec();
            msg.duration_ms = Some(duration_ms(elapsed));
            ledger.open = None;
            true
        });
    }

    /// Replace the open placeholder with a visible error message and close it.
    pub fn fail(&self, error_text: &str, elapsed: Duration) {
        self.update(|ledger| {
            let Some(msg) = open_slot(ledger) else {
                return false;
            };
            msg.content = error_text.to_string();
            msg.error = true;
            msg.duration_ms = Some(duration_ms(elapsed));
            ledger.open = None;
            true
        });
    }

    /// Remove the open placeholder entirely.
    pub fn discard(&self) {
        self.update(|ledger| {
            let Some(id) = ledger.open.take() else {
                return false;
            };
            match ledger.messages.last() {
                Some(last) if last.id == id => {
                    ledger.messages.pop();
                    true
                }
                _ => false,
            }
        });
    }

    /// Remove the last user + assistant pair and return the user's text.
    ///
    /// Refuses while a turn is open.
    pub fn remove_last_turn(&self) -> Option<String> {
        let mut text = None;
        self.update(|ledger| {
            if ledger.open.is_some() {
                return false;
            }
            let Some(user_idx) = ledger.messages.iter().rposition(ChatMessage::is_user) else {
                return false;
            };
            // Only assistant replies may follow the user message being removed.
            if ledger.messages[user_idx + 1..]
                .iter()
                .any(|m| !m.is_assistant())
            {
                return false;
            }
            text = Some(ledger.messages[user_idx].content.clone());
            ledger.messages.truncate(user_idx);
            true
        });
        text
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` under the lock; notify with a snapshot after releasing it,
    /// so the callback may call back into the session.
    fn update(&self, f: impl FnOnce(&mut Ledger) -> bool) {
        let Some(on_change) = &self.on_change else {
            f(&mut self.lock());
            return;
        };
        let snapshot = {
            let mut ledger = self.lock();
            if !f(&mut ledger) {
                return;
            }
            ledger.messages.clone()
        };
        on_change(&snapshot);
    }
}

fn open_slot(ledger: &mut Ledger) -> Option<&mut ChatMessage> {
    let id = ledger.open?;
    match ledger.messages.last_mut() {
        Some(last) if last.id == id => Some(last),
        _ => {
            warn!(message_id = %id, "Open message is no longer trailing; ignoring update");
            None
        }
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    // A finalized message always reports a measurable duration.
    (elapsed.as_millis() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tick(content: &str, is_final: bool) -> RevealTick {
        RevealTick {
            content: content.to_string(),
            revealed_len: content.chars().count(),
            tools_used: vec!["search".into()],
            is_final,
            elapsed: is_final.then(|| Duration::from_millis(40)),
        }
    }

    #[test]
    fn begin_turn_appends_user_then_placeholder() {
        let reconciler = MessageReconciler::new(Vec::new(), None);
        let id = reconciler.begin_turn("hi");
        let msgs = reconciler.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[0].content, "hi");
        assert_eq!(msgs[1].id, id);
        assert_eq!(msgs[1].content, "");
        assert_eq!(reconciler.open_message(), Some(id));
    }

    #[test]
    fn partial_ticks_do_not_attach_tools_or_duration() {
        let reconciler = MessageReconciler::new(Vec::new(), None);
        reconciler.begin_turn("hi");
        reconciler.apply_reveal(&tick("Hel", false));
        let last = reconciler.messages().pop().unwrap();
        assert_eq!(last.content, "Hel");
        assert!(last.tools_used.is_empty());
        assert_eq!(last.duration_ms, None);

        reconciler.apply_reveal(&tick("Hello", true));
        let last = reconciler.messages().pop().unwrap();
        assert_eq!(last.tools_used, vec!["search".to_string()]);
        assert_eq!(last.duration_ms, Some(40));
    }

    #[test]
    fn closed_message_is_immutable() {
        let reconciler = MessageReconciler::new(Vec::new(), None);
        reconciler.begin_turn("hi");
        reconciler.finalize("done", &[], Duration::from_millis(5));
        reconciler.apply_reveal(&tick("late", false));
        reconciler.fail("boom", Duration::ZERO);
        let last = reconciler.messages().pop().unwrap();
        assert_eq!(last.content, "done");
        assert!(!last.error);
    }

    #[test]
    fn discard_removes_only_the_placeholder() {
        let reconciler = MessageReconciler::new(Vec::new(), None);
        reconciler.begin_turn("hi");
        reconciler.discard();
        let msgs = reconciler.messages();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].is_user());
        assert_eq!(reconciler.open_message(), None);
    }

    #[test]
    fn remove_last_turn_returns_user_text() {
        let reconciler = MessageReconciler::new(Vec::new(), None);
        reconciler.begin_turn("first");
        reconciler.finalize("a", &[], Duration::from_millis(1));
        reconciler.begin_turn("second");
        assert_eq!(reconciler.remove_last_turn(), None, "open turn must not be removed");
        reconciler.fail("error", Duration::from_millis(1));

        assert_eq!(reconciler.remove_last_turn().as_deref(), Some("second"));
        assert_eq!(reconciler.messages().len(), 2);
    }

    #[test]
    fn callback_can_read_the_ledger() {
        let cell: Arc<std::sync::OnceLock<MessageReconciler>> = Arc::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (reader, lens) = (cell.clone(), seen.clone());
        let reconciler = MessageReconciler::new(
            Vec::new(),
            Some(Arc::new(move |_msgs: &[ChatMessage]| {
                if let Some(r) = reader.get() {
                    lens.lock().unwrap().push(r.messages().len());
                }
            })),
        );
        let _ = cell.set(reconciler.clone());

        reconciler.begin_turn("hi");
        reconciler.apply_reveal(&tick("H", false));
        reconciler.discard();
        assert_eq!(*seen.lock().unwrap(), vec![2, 2, 1]);
    }

    #[test]
    fn every_write_notifies_the_store() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let reconciler = MessageReconciler::new(
            Vec::new(),
            Some(Arc::new(move |_msgs: &[ChatMessage]| {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        );
        reconciler.begin_turn("hi");
        reconciler.apply_reveal(&tick("H", false));
        reconciler.finalize("Hi", &[], Duration::from_millis(1));
        // No-op writes after close do not notify.
        reconciler.apply_reveal(&tick("x", false));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
