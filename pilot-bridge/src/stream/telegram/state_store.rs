//! Per-session text reconciliation state for streamed Telegram replies.

use super::role_index::RoleIndex;
use pilot_opencode::{MessageId, MessageRole, PartId, SessionId};
use std::collections::HashMap;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartMeta {
    pub message_id: MessageId,
    pub part_type: &'static str,
    pub ignored: bool,
}

impl PartMeta {
    pub fn is_streamable_text(&self) -> bool {
        self.part_type == "text" && !self.ignored
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelta {
    pub message_id: MessageId,
    pub delta: String,
}

#[derive(Debug, Default)]
pub struct TextStreamState {
    /// Telegram message being edited in place, once the first flush sent it.
    pub message_id: Option<i64>,
    pub text: String,
    pub parts: HashMap<PartId, String>,
    /// First-seen order of rendered parts, without duplicates.
    pub part_order: Vec<PartId>,
    pub pending: bool,
    pub disabled: bool,
    pub timer: Option<JoinHandle<()>>,
    pub part_meta: HashMap<PartId, PartMeta>,
    pub pending_part_deltas: HashMap<PartId, Vec<PendingDelta>>,
    /// Parts of each message in first-seen order.
    pub message_parts: HashMap<MessageId, Vec<PartId>>,
}

impl TextStreamState {
    pub fn recompute_text(&mut self) {
        self.text = self
            .part_order
            .iter()
            .map(|id| self.parts.get(id).map(String::as_str).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n");
    }

    pub fn append_part_text(&mut self, part_id: &PartId, text: &str) {
        if !self.parts.contains_key(part_id) {
            self.part_order.push(part_id.clone());
        }
        self.parts.entry(part_id.clone()).or_default().push_str(text);
        self.recompute_text();
    }

    pub fn set_part_text(&mut self, part_id: &PartId, text: String) {
        if !self.parts.contains_key(part_id) {
            self.part_order.push(part_id.clone());
        }
        self.parts.insert(part_id.clone(), text);
        self.recompute_text();
    }

    pub fn part_text(&self, part_id: &PartId) -> &str {
        self.parts.get(part_id).map(String::as_str).unwrap_or_default()
    }

    pub fn remove_part_from_render(&mut self, part_id: &PartId) {
        self.parts.remove(part_id);
        self.part_order.retain(|id| id != part_id);
        self.recompute_text();
    }

    pub fn clear_part(&mut self, part_id: &PartId) {
        self.pending_part_deltas.remove(part_id);
        self.part_meta.remove(part_id);
        self.remove_part_from_messages(part_id);
        self.remove_part_from_render(part_id);
    }

    pub fn remember_part_message(&mut self, part_id: &PartId, message_id: &MessageId) {
        let previous = self
            .message_parts
            .iter()
            .find(|(_, parts)| parts.contains(part_id))
            .map(|(owner, _)| owner.clone());
        if let Some(owner) = previous {
            if &owner == message_id {
                return;
            }
            self.detach(&owner, part_id);
        }
        self.message_parts
            .entry(message_id.clone())
            .or_default()
            .push(part_id.clone());
    }

    fn remove_part_from_messages(&mut self, part_id: &PartId) {
        let owner = self
            .message_parts
            .iter()
            .find(|(_, parts)| parts.contains(part_id))
            .map(|(owner, _)| owner.clone());
        if let Some(owner) = owner {
            self.detach(&owner, part_id);
        }
    }

    fn detach(&mut self, owner: &MessageId, part_id: &PartId) {
        if let Some(parts) = self.message_parts.get_mut(owner) {
            parts.retain(|id| id != part_id);
            if parts.is_empty() {
                self.message_parts.remove(owner);
            }
        }
    }

    pub fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Applies buffered deltas once the part is known to be assistant text.
    /// Returns whether rendered text changed.
    pub fn apply_pending_deltas_if_eligible(
        &mut self,
        session_id: &str,
        part_id: &PartId,
        roles: &RoleIndex,
    ) -> bool {
        let Some(meta) = self.part_meta.get(part_id).cloned() else {
            self.pending_part_deltas.remove(part_id);
            return false;
        };
        if !meta.is_streamable_text() {
            self.pending_part_deltas.remove(part_id);
            return false;
        }

        match roles.resolve(session_id, &meta.message_id) {
            Some(MessageRole::Assistant) => {}
            Some(_) => {
                self.pending_part_deltas.remove(part_id);
                return false;
            }
            None => return false,
        }

        let Some(queue) = self.pending_part_deltas.remove(part_id) else {
            return false;
        };
        if queue.is_empty() {
            return false;
        }
        let appended: String = queue
            .iter()
            .filter(|item| item.message_id == meta.message_id)
            .map(|item| item.delta.as_str())
            .collect();
        self.append_part_text(part_id, &appended);
        true
    }

    pub fn on_role_resolved(
        &mut self,
        session_id: &str,
        message_id: &MessageId,
        role: MessageRole,
        roles: &RoleIndex,
    ) -> bool {
        let Some(part_ids) = self.message_parts.get(message_id).cloned() else {
            return false;
        };
        if part_ids.is_empty() {
            return false;
        }

        if role != MessageRole::Assistant {
            for part_id in &part_ids {
                self.pending_part_deltas.remove(part_id);
                self.remove_part_from_render(part_id);
            }
            return false;
        }

        let mut should_flush = false;
        for part_id in &part_ids {
            let streamable = self
                .part_meta
                .get(part_id)
                .is_some_and(PartMeta::is_streamable_text);
            if !streamable {
                self.pending_part_deltas.remove(part_id);
                continue;
            }
            if !self.part_text(part_id).trim().is_empty() {
                should_flush = true;
            }
            if self.apply_pending_deltas_if_eligible(session_id, part_id, roles) {
                should_flush = true;
            }
        }
        if should_flush {
            self.pending = true;
        }
        should_flush
    }
}

/// Keeps the longer previous text when the new snapshot is a strict prefix
/// of it (a truncated replay); otherwise adopts the snapshot.
pub fn merge_text_prefer_non_regressing(previous: &str, next: &str) -> String {
    if previous.len() > next.len() && previous.starts_with(next) {
        previous.to_string()
    } else {
        next.to_string()
    }
}

#[derive(Debug, Default)]
pub struct StreamStateStore {
    states: HashMap<SessionId, TextStreamState>,
}

impl StreamStateStore {
    pub fn get(&self, session_id: &str) -> Option<&TextStreamState> {
        self.states.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut TextStreamState> {
        self.states.get_mut(session_id)
    }

    pub fn ensure(&mut self, session_id: &SessionId) -> &mut TextStreamState {
        self.states.entry(session_id.clone()).or_default()
    }

    pub fn clear_session(&mut self, session_id: &str) {
        if let Some(mut state) = self.states.remove(session_id) {
            state.stop_timer();
        }
    }
}
