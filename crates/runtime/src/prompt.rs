//! System prompt template substitution.
//!
//! Agents carry a prompt with a small closed set of named placeholders.
//! Placeholders missing from the template are tolerated; placeholder names
//! outside the set stay as literal text.  There is no expression evaluation.

/// Values substituted into an agent's prompt template.
#[derive(Debug, Clone, Default)]
pub struct PromptVars {
    pub datetime: String,
    pub memories: String,
    pub user_preferences: String,
    pub known_people: String,
    pub agent_knowledge: String,
}

/// The closed placeholder set.
pub const PLACEHOLDERS: &[&str] =
    &["{datetime}", "{memories}", "{user_preferences}", "{known_people}", "{agent_knowledge}"];

/// Render the template by replacing known placeholders with their values.
pub fn render_system_prompt(template: &str, vars: &PromptVars) -> String {
    template
        .replace("{datetime}", &vars.datetime)
        .replace("{memories}", &vars.memories)
        .replace("{user_preferences}", &vars.user_preferences)
        .replace("{known_people}", &vars.known_people)
        .replace("{agent_knowledge}", &vars.agent_knowledge)
}

/// Format retrieved memories for the `{memories}` placeholder.  Each line
/// carries the memory id so the model can update instead of duplicating.
pub fn format_memories_block(memories: &[(String, String)]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let lines = memories
        .iter()
        .map(|(id, text)| format!("- [id:{id}] {text}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Existing memories (use id to update):\n{lines}")
}
