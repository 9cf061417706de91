use std::sync::Arc;

use tracing::{debug, warn};

use troupe_core::context::{LlmContext, SystemBlock, SystemBlockLabel};
use troupe_core::messages::Message;
use troupe_core::provider::{LlmProvider, StreamOptions};
use troupe_core::trace::Plan;

const SEQUENCING_WORDS: &[&str] = &[
    "first",
    "then",
    "next",
    "after that",
    "afterwards",
    "finally",
    "step",
    "before",
    "once done",
];

const PLANNING_INSTRUCTION: &str = "Break the user's request into a short ordered list of \
concrete steps. Reply with one numbered step per line and nothing else.";

/// Pre-assessment of whether a task deserves a plan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assessment {
    pub sub_goals: usize,
    pub sequencing: bool,
    /// Tool names referenced by the prompt.
    pub expected_tools: Vec<String>,
}

impl Assessment {
    pub fn is_trivial(&self) -> bool {
        self.sub_goals < 2 && !self.sequencing && self.expected_tools.len() < 2
    }
}

/// Judge a prompt against the tool names visible this turn.
pub fn assess(prompt: &str, tool_names: &[String]) -> Assessment {
    let lower = prompt.to_lowercase();
    let questions = prompt.matches('?').count();
    let numbered = prompt.lines().filter(|l| is_list_item(l.trim_start())).count();
    let chained = lower.matches(" and then ").count() + lower.matches("; ").count();
    let sub_goals = questions.max(numbered).max(if chained > 0 { chained + 1 } else { 0 });

    let sequencing = SEQUENCING_WORDS.iter().any(|w| contains_word(&lower, w));

    let expected_tools = tool_names
        .iter()
        .filter(|name| contains_word(&lower, &name.to_lowercase()))
        .cloned()
        .collect();

    Assessment {
        sub_goals,
        sequencing,
        expected_tools,
    }
}

/// How a plan is produced for a non-trivial task.
#[derive(Clone, Default)]
pub enum PlanStrategy {
    /// Split the prompt into clauses.
    #[default]
    Heuristic,
    /// Ask a model for the steps; falls back to the heuristic on failure.
    Model(Arc<dyn LlmProvider>),
}

impl std::fmt::Debug for PlanStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heuristic => f.write_str("Heuristic"),
            Self::Model(p) => write!(f, "Model({})", p.model()),
        }
    }
}

impl PlanStrategy {
    pub async fn plan(&self, prompt: &str, assessment: &Assessment) -> Plan {
        match self {
            Self::Heuristic => decompose(prompt, assessment),
            Self::Model(provider) => {
                let context = LlmContext {
                    messages: vec![Message::user_text(prompt)],
                    system_blocks: vec![SystemBlock::new(
                        SystemBlockLabel::Custom("planner".into()),
                        PLANNING_INSTRUCTION,
                    )],
                    tools: Vec::new(),
                };
                match provider.invoke(&context, &StreamOptions::default()).await {
                    Ok(reply) => {
                        let steps = parse_steps(&reply.message().text_content());
                        if steps.is_empty() {
                            debug!("planner reply had no steps, using heuristic plan");
                            decompose(prompt, assessment)
                        } else {
                            Plan::new(steps)
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "planning model failed, using heuristic plan");
                        decompose(prompt, assessment)
                    }
                }
            }
        }
    }
}

/// Heuristic decomposition: list items, then sentences and chained clauses.
pub fn decompose(prompt: &str, assessment: &Assessment) -> Plan {
    let listed = parse_steps(prompt);
    if listed.len() >= 2 && prompt.lines().filter(|l| is_list_item(l.trim_start())).count() >= 2 {
        return Plan::new(listed);
    }

    let mut steps: Vec<String> = Vec::new();
    for sentence in prompt.split_inclusive(['.', '?', '!', ';', '\n']) {
        let mut rest = sentence.trim().trim_end_matches(['.', ';']).trim().to_string();
        loop {
            let lower = rest.to_ascii_lowercase();
            let cut = [" and then ", ", then ", " then "]
                .iter()
                .filter_map(|sep| lower.find(sep).map(|i| (i, sep.len())))
                .min();
            match cut {
                Some((i, len)) => {
                    push_step(&mut steps, &rest[..i]);
                    rest = rest[i + len..].to_string();
                }
                None => {
                    push_step(&mut steps, &rest);
                    break;
                }
            }
        }
    }

    if steps.len() < 2 {
        steps = assessment
            .expected_tools
            .iter()
            .map(|t| format!("Use {t}"))
            .collect();
        if steps.is_empty() {
            push_step(&mut steps, prompt);
        } else {
            steps.push("Combine the results into an answer".into());
        }
    }
    Plan::new(steps)
}

fn push_step(steps: &mut Vec<String>, text: &str) {
    let step = strip_leading_sequencer(text.trim());
    if !step.is_empty() {
        steps.push(capitalize(step));
    }
}

fn strip_leading_sequencer(text: &str) -> &str {
    let lower = text.to_ascii_lowercase();
    for word in ["first,", "first", "then", "next,", "next", "finally,", "finally"] {
        if lower.starts_with(word)
            && text[word.len()..].starts_with(|c: char| c.is_whitespace())
        {
            return text[word.len()..].trim_start();
        }
    }
    text
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Steps from numbered or bulleted lines. Plain lines count when nothing is marked.
fn parse_steps(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let marked: Vec<String> = lines
        .iter()
        .filter(|l| is_list_item(l))
        .map(|l| strip_marker(l).to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if !marked.is_empty() {
        return marked;
    }
    if lines.len() > 1 {
        return lines.into_iter().map(str::to_string).collect();
    }
    Vec::new()
}

fn is_list_item(line: &str) -> bool {
    if line.starts_with("- ") || line.starts_with("* ") {
        return true;
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && line[digits..].starts_with(['.', ')'])
}

fn strip_marker(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return rest.trim();
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    line[digits..].trim_start_matches(['.', ')']).trim()
}

fn contains_word(haystack: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    haystack.match_indices(word).any(|(i, _)| {
        let before = haystack[..i].chars().next_back();
        let after = haystack[i + word.len()..].chars().next();
        let boundary = |c: Option<char>| c.map_or(true, |c| !c.is_alphanumeric() && c != '_');
        boundary(before) && boundary(after)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_core::errors::GatewayError;
    use troupe_llm::{MockProvider, MockResponse};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn simple_greeting_is_trivial() {
        let a = assess("Hi there", &names(&["search"]));
        assert!(a.is_trivial());
        assert_eq!(a.sub_goals, 0);
        assert!(!a.sequencing);
    }

    #[test]
    fn sequencing_language_is_non_trivial() {
        let a = assess("First find the file, then summarize it", &[]);
        assert!(a.sequencing);
        assert!(!a.is_trivial());
    }

    #[test]
    fn multiple_questions_are_non_trivial() {
        let a = assess("What is the weather in Paris? And in Rome?", &[]);
        assert_eq!(a.sub_goals, 2);
        assert!(!a.is_trivial());
    }

    #[test]
    fn several_tools_expected() {
        let a = assess("use search and calculator", &names(&["search", "calculator", "map"]));
        assert_eq!(a.expected_tools, names(&["search", "calculator"]));
        assert!(!a.is_trivial());
    }

    #[test]
    fn words_match_on_boundaries_only() {
        assert!(!contains_word("steppe", "step"));
        assert!(contains_word("step one", "step"));
        assert!(!contains_word("authentication", "then"));
        assert!(!assess("Authenticate me", &[]).sequencing);
    }

    #[test]
    fn decompose_numbered_list() {
        let prompt = "Please:\n1. fetch the data\n2) clean it\n3. chart it";
        let plan = decompose(prompt, &assess(prompt, &[]));
        assert_eq!(plan.steps, names(&["fetch the data", "clean it", "chart it"]));
    }

    #[test]
    fn decompose_chained_clauses() {
        let prompt = "First look up the order, then refund it and then email the customer.";
        let plan = decompose(prompt, &assess(prompt, &[]));
        assert_eq!(
            plan.steps,
            names(&["Look up the order", "Refund it", "Email the customer"])
        );
    }

    #[test]
    fn decompose_by_tools_when_single_clause() {
        let prompt = "compare search with calculator";
        let a = assess(prompt, &names(&["search", "calculator"]));
        let plan = decompose(prompt, &a);
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0], "Use search");
    }

    #[tokio::test]
    async fn model_strategy_parses_numbered_reply() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text(
            "1. Gather inputs\n2. Compute\n3. Report",
        )]));
        let strategy = PlanStrategy::Model(provider.clone());
        let plan = strategy.plan("do it then report", &Assessment::default()).await;
        assert_eq!(plan.steps, names(&["Gather inputs", "Compute", "Report"]));
        let ctx = provider.last_context().unwrap();
        assert!(ctx.system_prompt().contains("numbered step"));
        assert!(ctx.tools.is_empty());
    }

    #[tokio::test]
    async fn model_strategy_falls_back_on_error() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_error(
            GatewayError::ServerError {
                status: 500,
                body: "down".into(),
            },
        )]));
        let prompt = "find it, then fix it";
        let plan = PlanStrategy::Model(provider)
            .plan(prompt, &assess(prompt, &[]))
            .await;
        assert_eq!(plan.steps, names(&["Find it", "Fix it"]));
    }
}
