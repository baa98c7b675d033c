//! Naming conventions shared across the orchestrator.
//!
//! Session names follow `forge__{project}__{id}` with a double underscore
//! delimiter; several components parse them back, so the format is fixed
//! here and nowhere else.

use uuid::Uuid;

/// Session name prefix for every agent-owned tmux session.
pub const SESSION_PREFIX: &str = "forge";

/// Maximum length of the task slug used in branch names.
const SLUG_MAX_LEN: usize = 50;

/// Generates a 6-character lowercase hex agent id.
pub fn new_agent_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..6].to_string()
}

/// Builds the tmux session name for an agent.
pub fn session_name(project: &str, agent_id: &str) -> String {
    format!("{SESSION_PREFIX}__{project}__{agent_id}")
}

/// Parses a session name back into `(project, agent_id)`.
pub fn parse_session_name(name: &str) -> Option<(&str, &str)> {
    let mut parts = name.splitn(3, "__");
    let prefix = parts.next()?;
    let project = parts.next()?;
    let agent_id = parts.next()?;
    if prefix != SESSION_PREFIX || project.is_empty() || agent_id.is_empty() {
        return None;
    }
    Some((project, agent_id))
}

/// Sanitizes free text into a branch-safe slug: lower-cased, runs of
/// non-alphanumerics collapsed to single dashes, trimmed, length-capped.
/// Falls back to `"task"` when nothing survives.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = true;
    for ch in text.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() || ch == '_' {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-');
    let mut slug = slug.to_string();
    slug.truncate(SLUG_MAX_LEN);
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// Builds the branch name `{prefix}/{id}/{task-slug}` for a spawn.
pub fn branch_name(prefix: &str, agent_id: &str, task: &str) -> String {
    format!("{prefix}/{agent_id}/{}", slugify(task))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_ids_are_six_lowercase_hex() {
        for _ in 0..32 {
            let id = new_agent_id();
            assert_eq!(id.len(), 6);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn session_name_round_trips() {
        let name = session_name("api", "a1b2c3");
        assert_eq!(name, "forge__api__a1b2c3");
        assert_eq!(parse_session_name(&name), Some(("api", "a1b2c3")));
    }

    #[test]
    fn parse_rejects_foreign_sessions() {
        assert_eq!(parse_session_name("main"), None);
        assert_eq!(parse_session_name("forge__api"), None);
        assert_eq!(parse_session_name("other__api__a1b2c3"), None);
        assert_eq!(parse_session_name("forge____a1b2c3"), None);
    }

    #[test]
    fn slugify_collapses_and_caps() {
        assert_eq!(slugify("Fix the N+1 query!"), "fix-the-n-1-query");
        assert_eq!(slugify("  "), "task");
        assert_eq!(slugify(""), "task");
        assert_eq!(slugify("under_score kept"), "under_score-kept");
        let long = "x".repeat(200);
        assert_eq!(slugify(&long).len(), 50);
    }

    #[test]
    fn branch_name_matches_convention() {
        assert_eq!(
            branch_name("agent", "a1b2c3", "Fix the N+1 query!"),
            "agent/a1b2c3/fix-the-n-1-query"
        );
        assert_eq!(branch_name("compare", "ff00aa", ""), "compare/ff00aa/task");
    }
}
