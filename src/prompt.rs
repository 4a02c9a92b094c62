//! Prompt Builder
//!
//! Renders the question, the catalog and recent conversation turns into a chat prompt that fits a
//! token budget. When the budget is tight, descriptions are dropped longest-first; table and
//! column names are never dropped. Output is a pure function of the inputs.

use crate::error::{GenerationErrorKind, NlSqlError, Result};
use crate::metadata::SchemaCatalog;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

const INSTRUCTIONS: &str = "You are an expert SQL analyst translating questions into BigQuery \
Standard SQL.
Rules:
- Answer with exactly one read-only SELECT statement (WITH clauses are allowed).
- Never write INSERT, UPDATE, DELETE, MERGE, CREATE, ALTER, DROP or TRUNCATE.
- Use only the tables and columns listed in the schema, referenced by their bare names.
- Do not include comments or more than one statement.
- Add ORDER BY whenever the question implies an ordering.
- Return only the SQL, with no explanation.";

/// One earlier exchange in the same conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    #[serde(default)]
    pub sql: Option<String>,
}

/// A description that may be elided. `column` is None for the table description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DescriptionSlot {
    table: usize,
    column: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub estimated_tokens: usize,
    /// Descriptions dropped to fit the budget, rendered as `table` or `table.column`.
    pub elided: Vec<String>,
    /// SHA-256 of the rendered prompt, recorded in generation provenance.
    pub hash: String,
}

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    max_tokens: usize,
    max_history_turns: usize,
}

impl PromptBuilder {
    pub fn new(max_tokens: usize, max_history_turns: usize) -> Self {
        Self {
            max_tokens,
            max_history_turns,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn build(
        &self,
        question: &str,
        catalog: &SchemaCatalog,
        history: &[ConversationTurn],
    ) -> Result<Prompt> {
        let question = question.trim();
        if question.is_empty() {
            return Err(NlSqlError::generation(
                GenerationErrorKind::Rejected,
                "question is empty",
            ));
        }

        let history = self.render_history(history);
        let mut elided: HashSet<DescriptionSlot> = HashSet::new();
        let mut candidates = Self::elision_order(catalog).into_iter();

        loop {
            let user = format!(
                "{}{}Question: {}\nSQL:",
                Self::render_schema(catalog, &elided),
                history,
                question
            );
            let estimated_tokens = estimate_tokens(INSTRUCTIONS) + estimate_tokens(&user);
            if estimated_tokens <= self.max_tokens {
                let elided = Self::elided_names(catalog, &elided);
                if !elided.is_empty() {
                    debug!(
                        "Elided {} description(s) to fit {} tokens",
                        elided.len(),
                        self.max_tokens
                    );
                }
                let hash = hex::encode(Sha256::digest(format!("{}\n{}", INSTRUCTIONS, user)));
                return Ok(Prompt {
                    system: INSTRUCTIONS.to_string(),
                    user,
                    estimated_tokens,
                    elided,
                    hash,
                });
            }
            match candidates.next() {
                Some(slot) => {
                    elided.insert(slot);
                }
                None => {
                    return Err(NlSqlError::generation(
                        GenerationErrorKind::PromptTooLarge,
                        format!(
                            "prompt needs ~{} tokens with every description elided, budget is {}",
                            estimated_tokens, self.max_tokens
                        ),
                    ))
                }
            }
        }
    }

    /// Longest description first; ties broken by catalog position so the order is stable.
    fn elision_order(catalog: &SchemaCatalog) -> Vec<DescriptionSlot> {
        let mut slots: Vec<(usize, DescriptionSlot)> = Vec::new();
        for (t, table) in catalog.describe().iter().enumerate() {
            if let Some(description) = &table.description {
                slots.push((description.len(), DescriptionSlot { table: t, column: None }));
            }
            for (c, column) in table.columns.iter().enumerate() {
                if let Some(description) = &column.description {
                    slots.push((
                        description.len(),
                        DescriptionSlot {
                            table: t,
                            column: Some(c),
                        },
                    ));
                }
            }
        }
        slots.sort_by(|(a_len, a), (b_len, b)| {
            b_len
                .cmp(a_len)
                .then(a.table.cmp(&b.table))
                .then(a.column.cmp(&b.column))
        });
        slots.into_iter().map(|(_, slot)| slot).collect()
    }

    fn render_schema(catalog: &SchemaCatalog, elided: &HashSet<DescriptionSlot>) -> String {
        let mut out = String::from("Schema:\n");
        for (t, table) in catalog.describe().iter().enumerate() {
            out.push_str(&format!("Table {}", table.table));
            if let Some(description) = &table.description {
                if !elided.contains(&DescriptionSlot { table: t, column: None }) {
                    out.push_str(&format!(": {}", description));
                }
            }
            out.push('\n');
            for (c, column) in table.columns.iter().enumerate() {
                out.push_str(&format!("  - {} ({})", column.name, column.data_type));
                if let Some(description) = &column.description {
                    let slot = DescriptionSlot {
                        table: t,
                        column: Some(c),
                    };
                    if !elided.contains(&slot) {
                        out.push_str(&format!(": {}", description));
                    }
                }
                out.push('\n');
            }
        }
        out.push('\n');
        out
    }

    /// The trailing turns a prompt includes.
    pub fn recent_turns<'h>(&self, history: &'h [ConversationTurn]) -> &'h [ConversationTurn] {
        let skip = history.len().saturating_sub(self.max_history_turns);
        &history[skip..]
    }

    fn render_history(&self, history: &[ConversationTurn]) -> String {
        let recent = self.recent_turns(history);
        if recent.is_empty() {
            return String::new();
        }
        let mut out = String::from("Previous turns:\n");
        for turn in recent {
            out.push_str(&format!("Q: {}\n", turn.question.trim()));
            if let Some(sql) = &turn.sql {
                out.push_str(&format!("SQL: {}\n", sql.trim()));
            }
        }
        out.push('\n');
        out
    }

    fn elided_names(catalog: &SchemaCatalog, elided: &HashSet<DescriptionSlot>) -> Vec<String> {
        let mut names: Vec<String> = elided
            .iter()
            .filter_map(|slot| {
                let table = catalog.describe().get(slot.table)?;
                match slot.column {
                    None => Some(table.table.clone()),
                    Some(c) => table
                        .columns
                        .get(c)
                        .map(|col| format!("{}.{}", table.table, col.name)),
                }
            })
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{corpus_stats_fixture, ColumnDescriptor, SchemaDescriptor};

    #[test]
    fn test_prompt_lists_schema_and_question() {
        let builder = PromptBuilder::new(3000, 3);
        let prompt = builder
            .build("Total words per year?", &corpus_stats_fixture(), &[])
            .unwrap();
        assert!(prompt.user.contains("Table corpus_stats"));
        assert!(prompt.user.contains("word_count (INT64)"));
        assert!(prompt.user.ends_with("Question: Total words per year?\nSQL:"));
        assert!(prompt.system.contains("read-only SELECT"));
        assert!(prompt.elided.is_empty());
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = PromptBuilder::new(3000, 3);
        let catalog = corpus_stats_fixture();
        let a = builder.build("q", &catalog, &[]).unwrap();
        let b = builder.build("q", &catalog, &[]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_longest_descriptions_elided_first() {
        let catalog = SchemaCatalog::new(vec![SchemaDescriptor {
            table: "t".to_string(),
            description: Some("short".to_string()),
            columns: vec![
                ColumnDescriptor {
                    name: "a".to_string(),
                    data_type: "STRING".to_string(),
                    description: Some("x".repeat(400)),
                },
                ColumnDescriptor {
                    name: "b".to_string(),
                    data_type: "STRING".to_string(),
                    description: Some("tiny".to_string()),
                },
            ],
        }])
        .unwrap();
        let full = PromptBuilder::new(10_000, 3).build("q", &catalog, &[]).unwrap();
        let budget = full.estimated_tokens - 50;

        let prompt = PromptBuilder::new(budget, 3).build("q", &catalog, &[]).unwrap();
        assert_eq!(prompt.elided, vec!["t.a".to_string()]);
        assert!(prompt.user.contains("tiny"));
        assert!(prompt.estimated_tokens <= budget);
    }

    #[test]
    fn test_prompt_too_large_after_elision() {
        let err = PromptBuilder::new(10, 3)
            .build("Total words per year?", &corpus_stats_fixture(), &[])
            .unwrap_err();
        assert!(matches!(
            err,
            NlSqlError::Generation {
                kind: GenerationErrorKind::PromptTooLarge,
                ..
            }
        ));
    }

    #[test]
    fn test_history_limited_to_recent_turns() {
        let history: Vec<ConversationTurn> = (0..5)
            .map(|i| ConversationTurn {
                question: format!("question {}", i),
                sql: Some(format!("SELECT {}", i)),
            })
            .collect();
        let prompt = PromptBuilder::new(3000, 2)
            .build("and now?", &corpus_stats_fixture(), &history)
            .unwrap();
        assert!(!prompt.user.contains("question 2"));
        assert!(prompt.user.contains("question 3"));
        assert!(prompt.user.contains("SQL: SELECT 4"));

        let builder = PromptBuilder::new(3000, 2);
        let recent = builder.recent_turns(&history);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].question, "question 3");
        assert!(PromptBuilder::new(3000, 0).recent_turns(&history).is_empty());
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
