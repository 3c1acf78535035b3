use pilot_opencode::ModelRef;
use std::time::Duration;

pub const TYPING_INTERVAL: Duration = Duration::from_millis(6000);

/// Display label for a backend tool name; unknown tools keep their own name.
pub fn tool_label(tool: &str) -> &str {
    match tool {
        "bash" => "bash",
        "read" => "read",
        "write" => "write",
        "edit" | "multiedit" => "edit",
        "patch" => "patch",
        "grep" => "grep",
        "glob" => "glob",
        "task" => "agent",
        "webfetch" => "webfetch",
        other => other,
    }
}

/// Slash-command shortcuts that switch the peer's model.
pub const MODEL_PRESETS: [(&str, &str, &str); 2] = [
    ("opus", "anthropic", "claude-opus-4-5-20251101"),
    ("codex", "openai", "gpt-5.2-codex"),
];

pub fn model_preset(name: &str) -> Option<ModelRef> {
    MODEL_PRESETS
        .iter()
        .find(|(preset, _, _)| *preset == name)
        .map(|(_, provider, model)| ModelRef::new(*provider, *model))
}
