//! Applies part events to the stream state. Each handler returns whether the
//! session now has renderable changes and should schedule a flush.

use super::TelegramRunView;
use super::role_index::RoleIndex;
use super::state_store::{
    PartMeta, PendingDelta, StreamStateStore, TextStreamState, merge_text_prefer_non_regressing,
};
use pilot_opencode::{MessageId, MessagePartDelta, MessagePartUpdated, MessageRole, PartId, PartKind};

/// Stands in for parts that arrive without an id.
const FALLBACK_PART_ID: &str = "__single_text_part__";

pub fn handle_part_delta(
    store: &mut StreamStateStore,
    roles: &RoleIndex,
    run: &TelegramRunView,
    event: &MessagePartDelta,
) -> bool {
    let session_id = &event.session_id;
    if run.streaming_suppressed {
        if let (Some(state), Some(part_id)) = (store.get_mut(session_id), event.part_id.as_ref()) {
            state.clear_part(part_id);
        }
        return false;
    }

    let (Some(message_id), Some(part_id)) = (event.message_id.as_ref(), event.part_id.as_ref())
    else {
        return false;
    };
    if event.field != "text" || event.delta.is_empty() {
        return false;
    }

    let state = store.ensure(session_id);
    let role = roles.resolve(session_id, message_id);
    if matches!(role, Some(role) if role != MessageRole::Assistant) {
        state.pending_part_deltas.remove(part_id);
        return false;
    }

    forget_if_message_switched(state, part_id, message_id);

    if let Some(meta) = state.part_meta.get(part_id) {
        if !meta.is_streamable_text() {
            state.pending_part_deltas.remove(part_id);
            return false;
        }
        if role == Some(MessageRole::Assistant) {
            state.append_part_text(part_id, &event.delta);
            return true;
        }
    }

    // Classification or role still unknown: hold the delta until both are.
    state
        .pending_part_deltas
        .entry(part_id.clone())
        .or_default()
        .push(PendingDelta {
            message_id: message_id.clone(),
            delta: event.delta.clone(),
        });
    false
}

pub fn handle_part_updated(
    store: &mut StreamStateStore,
    roles: &RoleIndex,
    run: &TelegramRunView,
    event: &MessagePartUpdated,
) -> bool {
    let part = &event.part;
    let session_id = &part.session_id;
    if session_id.is_empty() {
        return false;
    }
    let part_id = part
        .id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| PartId::new(FALLBACK_PART_ID));

    if run.streaming_suppressed {
        if let Some(state) = store.get_mut(session_id) {
            state.clear_part(&part_id);
        }
        return false;
    }

    let Some(message_id) = part.message_id.as_ref() else {
        return false;
    };
    let delta = event.delta.as_deref().unwrap_or_default();

    let state = store.ensure(session_id);
    forget_if_message_switched(state, &part_id, message_id);
    state.remember_part_message(&part_id, message_id);

    let (text, ignored) = match &part.kind {
        PartKind::Text { text, ignored } => (Some(text.as_str()), *ignored),
        _ => (None, false),
    };
    state.part_meta.insert(
        part_id.clone(),
        PartMeta {
            message_id: message_id.clone(),
            part_type: part.kind.type_name(),
            ignored,
        },
    );

    let Some(text) = text.filter(|_| !ignored) else {
        state.pending_part_deltas.remove(&part_id);
        state.remove_part_from_render(&part_id);
        return false;
    };

    match roles.resolve(session_id, message_id) {
        Some(MessageRole::Assistant) => {}
        None => {
            // Keep buffered deltas; the role may still turn out to be assistant.
            state.remove_part_from_render(&part_id);
            return false;
        }
        Some(_) => {
            state.pending_part_deltas.remove(&part_id);
            state.remove_part_from_render(&part_id);
            return false;
        }
    }

    let mut next = merge_text_prefer_non_regressing(state.part_text(&part_id), text);
    next.push_str(delta);
    state.set_part_text(&part_id, next);

    let mut should_flush = !state.part_text(&part_id).trim().is_empty() || !delta.is_empty();
    if state.apply_pending_deltas_if_eligible(session_id, &part_id, roles) {
        should_flush = true;
    }
    should_flush
}

// A part reported under a different message starts over.
fn forget_if_message_switched(state: &mut TextStreamState, part_id: &PartId, message_id: &MessageId) {
    let switched = state
        .part_meta
        .get(part_id)
        .is_some_and(|meta| &meta.message_id != message_id);
    if switched {
        state.part_meta.remove(part_id);
        state.pending_part_deltas.remove(part_id);
        state.remove_part_from_render(part_id);
    }
}
