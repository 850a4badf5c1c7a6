//! Prompt template collaborator.
//!
//! Templates use `{{name}}` placeholders. Every placeholder of the selected
//! template must be bound; extra bindings are ignored.

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

pub mod tasks {
    pub const RELEVANCE_SCORING: &str = "relevance_scoring";
    pub const KNOWLEDGE_EXTRACTION: &str = "knowledge_extraction";
    pub const CLAIM_DECOMPOSITION: &str = "claim_decomposition";
    pub const FACT_VERIFICATION: &str = "fact_verification";
    pub const RESPONSE_GENERATION: &str = "response_generation";
    pub const RESPONSE_REVISION: &str = "response_revision";
}

pub const DEFAULT_VARIANT: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown prompt task: {0}")]
    UnknownTask(String),

    #[error("prompt task {task} is missing binding `{name}`")]
    MissingBinding { task: String, name: String },
}

#[derive(Debug, Clone, Default)]
pub struct Bindings(BTreeMap<String, String>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

pub trait PromptRenderer: Send + Sync {
    fn render(&self, task: &str, variant: &str, bindings: &Bindings)
    -> Result<String, TemplateError>;
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([a-z_]+)\s*\}\}").expect("placeholder pattern is valid")
});

/// Templates compiled into the binary.
pub struct BuiltinTemplates {
    templates: HashMap<(&'static str, &'static str), &'static str>,
}

impl Default for BuiltinTemplates {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinTemplates {
    pub fn new() -> Self {
        let templates = HashMap::from([
            ((tasks::RELEVANCE_SCORING, DEFAULT_VARIANT), RELEVANCE_DEFAULT),
            ((tasks::RELEVANCE_SCORING, "strict"), RELEVANCE_STRICT),
            ((tasks::KNOWLEDGE_EXTRACTION, DEFAULT_VARIANT), KNOWLEDGE_EXTRACTION),
            ((tasks::CLAIM_DECOMPOSITION, DEFAULT_VARIANT), CLAIM_DECOMPOSITION),
            ((tasks::FACT_VERIFICATION, DEFAULT_VARIANT), FACT_VERIFICATION),
            ((tasks::RESPONSE_GENERATION, DEFAULT_VARIANT), RESPONSE_DEFAULT),
            ((tasks::RESPONSE_GENERATION, "creative"), RESPONSE_CREATIVE),
            ((tasks::RESPONSE_REVISION, DEFAULT_VARIANT), RESPONSE_REVISION),
        ]);
        Self { templates }
    }

    fn lookup(&self, task: &str, variant: &str) -> Option<&'static str> {
        self.templates
            .get(&(task, variant))
            .or_else(|| self.templates.get(&(task, DEFAULT_VARIANT)))
            .copied()
    }
}

impl PromptRenderer for BuiltinTemplates {
    fn render(
        &self,
        task: &str,
        variant: &str,
        bindings: &Bindings,
    ) -> Result<String, TemplateError> {
        let template = self
            .lookup(task, variant)
            .ok_or_else(|| TemplateError::UnknownTask(task.to_string()))?;

        if let Some(missing) = PLACEHOLDER
            .captures_iter(template)
            .map(|c| c[1].to_string())
            .find(|name| bindings.get(name).is_none())
        {
            return Err(TemplateError::MissingBinding {
                task: task.to_string(),
                name: missing,
            });
        }

        Ok(PLACEHOLDER
            .replace_all(template, |caps: &regex::Captures| {
                bindings.get(&caps[1]).unwrap_or_default().to_string()
            })
            .into_owned())
    }
}

const SCORING_BANDS: &str = "SCORING BANDS:
- 0.9-1.0: the chunk directly answers the query
- 0.7-0.8: strong supporting information
- 0.5-0.6: useful background context
- 0.3-0.4: tangentially related
- 0.0-0.2: irrelevant";

const RELEVANCE_DEFAULT: &str = "Score how relevant each chunk is to the query.

QUERY: {{query}}

WORKING MEMORY:
{{memory}}

{{bands}}

RULES:
- Prefer precision over recall: when uncertain, score lower
- Score every chunk exactly once, using its chunk_index
- Keep the reasoning to one sentence

CHUNKS TO SCORE:
{{chunks}}";

const RELEVANCE_STRICT: &str = "Score how relevant each chunk is to the query. Be strict.

QUERY: {{query}}

WORKING MEMORY:
{{memory}}

{{bands}}

RULES:
- Only a chunk that states the answer itself may score above 0.8
- Background that does not mention the subject of the query scores at most 0.4
- When uncertain, score lower
- Score every chunk exactly once, using its chunk_index

CHUNKS TO SCORE:
{{chunks}}";

const KNOWLEDGE_EXTRACTION: &str = "Extract entities and relationships from the following text.

INSTRUCTIONS:
1. Entity types must be one of: {{entity_types}}
2. Relation types must be one of: {{relation_types}}
3. Give each entity and relation a confidence between 0 and 1
4. List the exact surface forms of each entity under mentions
5. Evidence must be a direct quote from the text

TEXT:
{{text}}";

const CLAIM_DECOMPOSITION: &str = "Break the following answer into atomic claims.
Each claim must be a single factual assertion that can be checked on its own.
Skip statements that only say information is missing.

ANSWER:
{{answer}}";

const FACT_VERIFICATION: &str = "Decide whether the context supports the claim.

VERDICTS:
- VERIFIED: the context states the claim
- REFUTED: the context contradicts the claim
- UNSUPPORTED: the context neither states nor contradicts the claim

The evidence must be quoted verbatim from the context. Use an empty string when there is none.

CLAIM TO VERIFY: {{claim}}

CONTEXT:
{{context}}";

const RESPONSE_DEFAULT: &str = "Answer the question using ONLY the numbered context chunks below.
Cite the chunk numbers you used in sources_used.
If the context does not contain enough information, say so explicitly instead of guessing.

QUESTION: {{query}}

CONTEXT:
{{context}}

KNOWN ENTITIES AND RELATIONS:
{{graph}}

WORKING MEMORY:
{{memory}}";

const RESPONSE_CREATIVE: &str = "Answer the question using ONLY the numbered context chunks below, in a clear and engaging style.
You may restructure and summarise, but add no facts that the context does not state.
Cite the chunk numbers you used in sources_used.
If the context does not contain enough information, say so explicitly.

QUESTION: {{query}}

CONTEXT:
{{context}}

KNOWN ENTITIES AND RELATIONS:
{{graph}}

WORKING MEMORY:
{{memory}}";

const RESPONSE_REVISION: &str = "Revise the draft answer so it no longer makes the refuted claims.
Use ONLY the numbered context chunks below and cite the chunk numbers you used in sources_used.

QUESTION: {{query}}

DRAFT ANSWER:
{{draft}}

REFUTED CLAIMS:
{{refuted}}

CONTEXT:
{{context}}";

/// The scoring bands, for binding into relevance prompts.
pub fn scoring_bands() -> &'static str {
    SCORING_BANDS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relevance_bindings() -> Bindings {
        Bindings::new()
            .with("query", "Who founded Acme?")
            .with("memory", "(none)")
            .with("bands", scoring_bands())
            .with("chunks", "[0] Acme was founded by Jane.")
    }

    #[test]
    fn renders_all_placeholders() {
        let templates = BuiltinTemplates::new();
        let prompt = templates
            .render(tasks::RELEVANCE_SCORING, DEFAULT_VARIANT, &relevance_bindings())
            .unwrap();

        assert!(prompt.contains("QUERY: Who founded Acme?"));
        assert!(prompt.contains("0.9-1.0"));
        assert!(prompt.contains("CHUNKS TO SCORE:\n[0] Acme was founded by Jane."));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn unknown_variant_falls_back_to_default() {
        let templates = BuiltinTemplates::new();
        let bindings = relevance_bindings();
        let strict = templates
            .render(tasks::RELEVANCE_SCORING, "strict", &bindings)
            .unwrap();
        let fallback = templates
            .render(tasks::RELEVANCE_SCORING, "no-such-variant", &bindings)
            .unwrap();
        let default = templates
            .render(tasks::RELEVANCE_SCORING, DEFAULT_VARIANT, &bindings)
            .unwrap();

        assert!(strict.contains("Be strict"));
        assert_eq!(fallback, default);
    }

    #[test]
    fn reports_unknown_task_and_missing_binding() {
        let templates = BuiltinTemplates::new();
        assert_eq!(
            templates.render("summarise", DEFAULT_VARIANT, &Bindings::new()),
            Err(TemplateError::UnknownTask("summarise".into()))
        );

        let err = templates
            .render(
                tasks::CLAIM_DECOMPOSITION,
                DEFAULT_VARIANT,
                &Bindings::new().with("query", "x"),
            )
            .unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingBinding {
                task: tasks::CLAIM_DECOMPOSITION.into(),
                name: "answer".into()
            }
        );
    }
}
