//! Output-driven status inference.
//!
//! Classifies a captured pane into a discrete status and extracts the
//! free-text pieces the rest of the system relays: the pending prompt, an
//! activity summary, and the agent's most recent response between known
//! markers. Everything here is a pure function of its inputs; the same
//! engine serves the polling scheduler and recovery.

use once_cell::sync::Lazy;
use regex::Regex;

use forge_agent::AgentStatus;

/// Only this many trailing characters are inspected for prompt/error
/// markers; old scrollback must not re-trigger them.
const TAIL_WINDOW: usize = 2000;

/// Bound on extracted responses.
const RESPONSE_CAP: usize = 4096;

static ANSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "\\x1b(?:\\[[0-9;?]*[a-zA-Z]|\\][^\\x07]*\\x07|\\][^\\x1b]*\\x1b\\\\|[()#][0-9a-zA-Z]|[a-zA-Z><=])",
    )
    .expect("ansi regex")
});

// Spinner frames, separators, tool chrome, and other redraw noise that
// must not leak into summaries or responses.
static NOISE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        ^\s*[>❯$\#]\s*$
        |^\s*[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏⣾⣽⣻⢿⡿⣟⣯⣷]
        |^\s*[|/\-\\]\s\S.{0,30}$
        |^[\s─━=~_*]{6,}$
        |^[\s\-]{6,}$
        |^\s*⏵
        |^\s*[❯>]\s+\S
        |^\s*[✢-✿]
        |^\s*⏺\s*$
        |^\s*[·.…↑↓←→]+\s*$
        |^\s*·\s+\S+…\s*$
        |^\s*\w+…\s*$
        |^\s*\w*\(thinking\)\s*$
        |^\s*Thinking\.*\s*$
        |^\s*\d+[,.]?\d*\s*tokens?\s*$
        |^\s*⎿
        |^\s*…\s*\+\d+\s+lines?\s*\(ctrl\+o
        ",
    )
    .expect("noise regex")
});

static BLOCK_MARKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*⏺\s?").expect("marker regex"));

static TOOL_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:Bash|Read|Edit|Write|Grep|Glob|Task|MultiEdit|NotebookEdit|WebFetch|WebSearch|AskUser|Skill|EnterPlan|ExitPlan)\(",
    )
    .expect("tool header regex")
});

static TOOL_OUTPUT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*⎿").expect("tool output regex"));

/// Ordered classification rules. Deployments tune the pattern lists when
/// an agent CLI changes its prompts; the rule *order* is fixed.
pub struct StatusRuleset {
    input: Vec<Regex>,
    error: Vec<Regex>,
    idle: Vec<Regex>,
}

impl StatusRuleset {
    pub fn new(input: Vec<Regex>, error: Vec<Regex>, idle: Vec<Regex>) -> Self {
        Self { input, error, idle }
    }

    /// Classifies a capture given the previous capture and the previously
    /// known status. Pure; call it from anywhere.
    ///
    /// Rule order: permission prompt, error marker, idle prompt on the
    /// last line, changed output means working, otherwise the prior
    /// status stands.
    pub fn detect(&self, current: &str, previous: &str, prior: AgentStatus) -> AgentStatus {
        let tail = tail_chars(current, TAIL_WINDOW);

        if self.input.iter().any(|re| re.is_match(tail)) {
            return AgentStatus::WaitingInput;
        }
        if self.error.iter().any(|re| re.is_match(tail)) {
            return AgentStatus::Error;
        }
        if let Some(last_line) = tail.trim_end().lines().last() {
            if self.idle.iter().any(|re| re.is_match(last_line)) {
                return AgentStatus::Idle;
            }
        }
        if current.trim_end() != previous.trim_end() {
            return AgentStatus::Working;
        }
        prior
    }
}

impl Default for StatusRuleset {
    fn default() -> Self {
        let compile = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("ruleset pattern"))
                .collect()
        };
        Self {
            input: compile(&[
                r"(?i)\bdo you want\b",
                r"(?i)❯ 1\. yes",
                r"(?i)\ballow\b",
                r"\bY/n\b",
                r"\by/N\b",
                r"(?i)\byes/no\b",
                r"(?i)\[y/n\]",
                r"(?i)\(y/n\)",
            ]),
            error: compile(&[
                r"(?i)\berror:",
                r"(?i)\bfatal:",
                r"\bFAILED\b",
                r"panicked at",
                r"Traceback \(most recent call last\)",
            ]),
            idle: compile(&[r"[>❯]\s*$", r"\$\s*$"]),
        }
    }
}

/// Strips ANSI escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Last `n` characters of a string, on char boundaries.
fn tail_chars(text: &str, n: usize) -> &str {
    match text.char_indices().rev().nth(n.saturating_sub(1)) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Extracts the prompt/question an agent is blocked on: the last line
/// matching an input pattern plus up to three lines of leading context.
pub fn extract_prompt_text(ruleset: &StatusRuleset, output: &str) -> String {
    if output.is_empty() {
        return String::new();
    }
    let cleaned = strip_ansi(output);
    let lines: Vec<&str> = cleaned.trim_end().lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    let start = lines.len().saturating_sub(30);
    let search = &lines[start..];
    let match_idx = search
        .iter()
        .rposition(|line| ruleset.input.iter().any(|re| re.is_match(line)));
    let Some(match_idx) = match_idx else {
        return String::new();
    };

    let context_start = match_idx.saturating_sub(3);
    let mut context: Vec<&str> = search[context_start..=match_idx].to_vec();
    while context.first().is_some_and(|line| line.trim().is_empty()) {
        context.remove(0);
    }
    context.join("\n")
}

/// Short activity summary: the last meaningful lines of the pane with
/// spinners, separators, and tool chrome filtered out.
pub fn extract_activity_summary(output: &str) -> String {
    if output.trim().is_empty() {
        return String::new();
    }
    let cleaned = strip_ansi(output);
    let lines: Vec<&str> = cleaned.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return String::new();
    }

    let tail_start = lines.len().saturating_sub(40);
    let meaningful: Vec<&str> = lines[tail_start..]
        .iter()
        .copied()
        .filter(|line| !NOISE_RE.is_match(line))
        .collect();
    if meaningful.is_empty() {
        return String::new();
    }

    let start = meaningful.len().saturating_sub(15);
    meaningful[start..]
        .iter()
        .map(|line| truncate_chars(line, 120))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extracts the most recent agent response from a pane capture.
///
/// Walks backward for the last `⏺`-marked text block that is not a tool
/// invocation and emits it up to the next block or tool marker. Falls
/// back to the filtered tail when no block is found. Best-effort; the
/// bound keeps relayed messages sane.
pub fn extract_last_response(output: &str) -> String {
    let cleaned = strip_ansi(output);
    let lines: Vec<&str> = cleaned.lines().filter(|l| !l.trim().is_empty()).collect();

    let block_start = lines.iter().rposition(|line| {
        let stripped = line.trim();
        if !BLOCK_MARKER_RE.is_match(stripped) {
            return false;
        }
        let after = BLOCK_MARKER_RE.replace(stripped, "");
        let after = after.trim();
        !after.is_empty() && !TOOL_HEADER_RE.is_match(after)
    });

    if let Some(start) = block_start {
        let mut block: Vec<String> = Vec::new();
        for (offset, line) in lines[start..].iter().enumerate() {
            let stripped = line.trim();
            if offset == 0 {
                let first = BLOCK_MARKER_RE.replace(line, "");
                if !first.trim().is_empty() {
                    block.push(truncate_chars(first.trim_end(), 200));
                }
                continue;
            }
            if BLOCK_MARKER_RE.is_match(stripped) {
                let after = BLOCK_MARKER_RE.replace(stripped, "");
                if after.trim().is_empty() {
                    continue;
                }
                break;
            }
            if TOOL_HEADER_RE.is_match(stripped) || TOOL_OUTPUT_RE.is_match(stripped) {
                break;
            }
            if NOISE_RE.is_match(line) {
                continue;
            }
            block.push(truncate_chars(line, 200));
        }
        if !block.is_empty() {
            return truncate_chars(&block.join("\n"), RESPONSE_CAP);
        }
    }

    // Fallback: filtered tail, redraw duplicates and tool blocks removed.
    let mut meaningful: Vec<String> = Vec::new();
    let mut in_tool_block = false;
    for line in &lines {
        let unmarked = BLOCK_MARKER_RE.replace(line, "");
        let unmarked = unmarked.trim_end();
        if unmarked.trim().is_empty() {
            continue;
        }
        if TOOL_HEADER_RE.is_match(unmarked.trim_start()) {
            in_tool_block = true;
            continue;
        }
        if in_tool_block {
            if TOOL_OUTPUT_RE.is_match(unmarked) {
                continue;
            }
            in_tool_block = false;
        }
        if NOISE_RE.is_match(unmarked) {
            continue;
        }
        if meaningful.last().map(|l: &String| l.trim()) == Some(unmarked.trim()) {
            continue;
        }
        meaningful.push(truncate_chars(unmarked, 200));
    }
    let start = meaningful.len().saturating_sub(30);
    truncate_chars(&meaningful[start..].join("\n"), RESPONSE_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(current: &str, previous: &str, prior: AgentStatus) -> AgentStatus {
        StatusRuleset::default().detect(current, previous, prior)
    }

    #[test]
    fn permission_prompt_wins() {
        let status = detect(
            "Bash(rm -rf build)\nDo you want to proceed?\n❯ 1. Yes\n  2. No",
            "",
            AgentStatus::Working,
        );
        assert_eq!(status, AgentStatus::WaitingInput);
    }

    #[test]
    fn error_marker_beats_change_detection() {
        let status = detect(
            "building...\nerror: expected `;` at line 4",
            "building...",
            AgentStatus::Working,
        );
        assert_eq!(status, AgentStatus::Error);
    }

    #[test]
    fn idle_prompt_on_last_line_wins_over_change() {
        // Pane content changed, but the new content is just the idle
        // prompt; the agent finished rather than started working.
        let status = detect("❯ ", "Do you want to proceed?", AgentStatus::WaitingInput);
        assert_eq!(status, AgentStatus::Idle);
    }

    #[test]
    fn appended_line_means_working() {
        let previous = "compiling module a\n❯ done";
        let current = "compiling module a\n❯ done\ncompiling module b";
        assert_eq!(detect(current, previous, AgentStatus::Idle), AgentStatus::Working);
    }

    #[test]
    fn unchanged_output_retains_prior_status() {
        let pane = "halfway through a long build";
        assert_eq!(detect(pane, pane, AgentStatus::Working), AgentStatus::Working);
        assert_eq!(detect(pane, pane, AgentStatus::Starting), AgentStatus::Starting);
    }

    #[test]
    fn trailing_blank_lines_do_not_count_as_change() {
        let previous = "same content";
        let current = "same content\n\n\n";
        assert_eq!(detect(current, previous, AgentStatus::Idle), AgentStatus::Idle);
    }

    #[test]
    fn markers_outside_tail_window_are_ignored() {
        let mut pane = String::from("Do you want to proceed?\n");
        pane.push_str(&"filler line of output\n".repeat(200));
        assert_eq!(
            detect(&pane, "", AgentStatus::Working),
            AgentStatus::Working
        );
    }

    #[test]
    fn prompt_text_includes_context() {
        let ruleset = StatusRuleset::default();
        let pane = "\
Edit(src/main.rs)
This will overwrite your changes.
Do you want to proceed? (y/n)";
        let prompt = extract_prompt_text(&ruleset, pane);
        assert!(prompt.contains("overwrite your changes"));
        assert!(prompt.ends_with("(y/n)"));
    }

    #[test]
    fn prompt_text_empty_without_match() {
        let ruleset = StatusRuleset::default();
        assert_eq!(extract_prompt_text(&ruleset, "just some output"), "");
        assert_eq!(extract_prompt_text(&ruleset, ""), "");
    }

    #[test]
    fn summary_filters_noise() {
        let pane = "\
⠋ spinning
──────────
real work happened here
❯ tool invocation line
tests passed: 14";
        let summary = extract_activity_summary(pane);
        assert!(summary.contains("real work happened here"));
        assert!(summary.contains("tests passed: 14"));
        assert!(!summary.contains("spinning"));
        assert!(!summary.contains("──"));
        assert!(!summary.contains("tool invocation"));
    }

    #[test]
    fn response_extraction_finds_last_marked_block() {
        let pane = "\
⏺ Bash(cargo test)
  ⎿ running 12 tests
⏺ All tests pass now.
The fix was a missing await in the poller.";
        let response = extract_last_response(pane);
        assert!(response.starts_with("All tests pass now."));
        assert!(response.contains("missing await"));
        assert!(!response.contains("cargo test"));
    }

    #[test]
    fn response_extraction_stops_at_next_tool_call() {
        let pane = "\
⏺ Here is my summary of the change.
⏺ Bash(git status)
  ⎿ clean";
        let response = extract_last_response(pane);
        assert_eq!(response, "Here is my summary of the change.");
    }

    #[test]
    fn response_falls_back_to_filtered_tail() {
        let pane = "\
plain output line one
plain output line one
plain output line two";
        let response = extract_last_response(pane);
        // Redraw duplicate collapsed, both distinct lines kept.
        assert_eq!(response, "plain output line one\nplain output line two");
    }

    #[test]
    fn ansi_codes_are_stripped() {
        let pane = "\x1b[32mgreen text\x1b[0m and \x1b]0;title\x07plain";
        assert_eq!(strip_ansi(pane), "green text and plain");
    }

    #[test]
    fn response_is_bounded() {
        let pane = format!("⏺ summary\n{}", "detail line\n".repeat(1000));
        assert!(extract_last_response(&pane).len() <= RESPONSE_CAP);
    }
}
