//! Bounded `(session, message) -> role` lookup.

use pilot_opencode::{MessageId, MessageRole, SessionId};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
struct SessionRoles {
    roles: HashMap<MessageId, MessageRole>,
    order: VecDeque<MessageId>,
}

/// Roles arrive on `message.updated`, independently of part text, so they are
/// remembered here until the parts that need them show up.
#[derive(Debug)]
pub struct RoleIndex {
    sessions: HashMap<SessionId, SessionRoles>,
    max_entries: usize,
}

impl RoleIndex {
    pub fn new(max_entries: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Records a role, evicting the session's oldest entries past capacity.
    pub fn remember(&mut self, session_id: &SessionId, message_id: &MessageId, role: MessageRole) {
        let state = self.sessions.entry(session_id.clone()).or_default();
        if state.roles.insert(message_id.clone(), role).is_none() {
            state.order.push_back(message_id.clone());
        }
        while state.order.len() > self.max_entries {
            let Some(evicted) = state.order.pop_front() else {
                break;
            };
            state.roles.remove(&evicted);
        }
    }

    pub fn resolve(&self, session_id: &str, message_id: &str) -> Option<MessageRole> {
        self.sessions
            .get(session_id)
            .and_then(|state| state.roles.get(message_id))
            .copied()
    }

    pub fn clear_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}
