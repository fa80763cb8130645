//! Prompt rendering for query generation and refinement.

use crate::connectors::Dialect;
use crate::generator::context::QueryContext;
use crate::llm::GenerationPrompt;

/// The failed attempt fed back to the model on a healing retry.
#[derive(Debug, Clone)]
pub struct HealingHint {
    pub failed_query: String,
    pub error: String,
}

fn system_prompt(dialect: Dialect, max_rows: usize) -> String {
    match dialect {
        Dialect::Document => format!(
            "You are an expert MongoDB analyst. Translate the user's question into one read-only \
             MongoDB query over the collections described. Express it as a JSON object: \
             {{\"collection\": \"...\", \"filter\": {{...}}, \"projection\": {{...}}, \"sort\": {{...}}, \"limit\": n}} \
             or, for grouping, {{\"collection\": \"...\", \"pipeline\": [...]}}. Never write data \
             ($out and $merge are forbidden). Return at most {max_rows} documents.\n\
             Respond with JSON only: {{\"sql_query\": <the query object>, \"explanation\": \"...\", \"confidence\": 0.0-1.0}}"
        ),
        _ => format!(
            "You are an expert {dialect} analyst. Translate the user's question into a single \
             read-only {dialect} SELECT statement using only the tables and columns in the schema. \
             Never modify data or schema. Limit results to at most {max_rows} rows.\n\
             Respond with JSON only: {{\"sql_query\": \"...\", \"explanation\": \"...\", \"confidence\": 0.0-1.0}}. \
             The confidence is how sure you are that the query answers the question.",
            dialect = dialect.label()
        ),
    }
}

const STRICT_SUFFIX: &str = "\n\nYour previous reply could not be used. Reply with exactly one JSON object \
     containing the keys sql_query, explanation and confidence. No markdown, no prose.";

pub fn build_generation_prompt(
    ctx: &QueryContext,
    max_rows: usize,
    history_char_budget: usize,
    hint: Option<&HealingHint>,
    strict: bool,
) -> GenerationPrompt {
    let mut system = system_prompt(ctx.dialect(), max_rows);
    if strict {
        system.push_str(STRICT_SUFFIX);
    }

    let mut user = String::new();
    user.push_str("Schema:\n");
    user.push_str(&ctx.schema().render_for_prompt(ctx.focus_tables()));

    let history = ctx.history_for_prompt(history_char_budget);
    if !history.is_empty() {
        user.push_str("\nConversation so far (oldest first):\n");
        for turn in history {
            user.push_str(&turn.render());
        }
        user.push_str("Resolve references in the new question against this conversation.\n");
    }

    if let Some(hint) = hint {
        user.push_str(&format!(
            "\nThe previous query failed.\nQuery: {}\nError: {}\nReturn a corrected query.\n",
            hint.failed_query, hint.error
        ));
    }

    user.push_str(&format!("\nQuestion: {}\n", ctx.question()));
    GenerationPrompt { system, user }
}

pub fn build_refine_prompt(ctx: &QueryContext) -> GenerationPrompt {
    GenerationPrompt {
        system: "You help users phrase questions about their data. Suggest up to 3 clearer \
                 rephrasings of the question that can be answered from the schema. \
                 Respond with JSON only: {\"suggestions\": [\"...\"]}"
            .to_string(),
        user: format!(
            "Schema:\n{}\nQuestion: {}\n",
            ctx.schema().render_for_prompt(ctx.focus_tables()),
            ctx.question()
        ),
    }
}
