//! Wire schemas for schema-validated gateway calls.
//!
//! The JSON documents here are handed to providers with native structured
//! output and spelled out in the prompt for providers without it. Decoding
//! into the caller's serde type is the validation step: unknown fields are
//! ignored, missing required fields fail.

use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct Schema {
    pub name: &'static str,
    pub json: Value,
}

impl Schema {
    pub fn new(name: &'static str, json: Value) -> Self {
        Self { name, json }
    }

    /// `{entities:[{name,type,confidence,mentions}], relations:[{from_entity,to_entity,relation_type,confidence,evidence}]}`
    pub fn entity_extraction() -> Self {
        Self::new(
            "entity_extraction",
            json!({
                "type": "object",
                "properties": {
                    "entities": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string"},
                                "type": {"type": "string"},
                                "confidence": {"type": "number"},
                                "mentions": {"type": "array", "items": {"type": "string"}}
                            },
                            "required": ["name", "type", "confidence", "mentions"]
                        }
                    },
                    "relations": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "from_entity": {"type": "string"},
                                "to_entity": {"type": "string"},
                                "relation_type": {"type": "string"},
                                "confidence": {"type": "number"},
                                "evidence": {"type": "string"}
                            },
                            "required": ["from_entity", "to_entity", "relation_type", "confidence", "evidence"]
                        }
                    }
                },
                "required": ["entities", "relations"]
            }),
        )
    }

    /// `{chunks:[{chunk_index,relevance_score,reasoning}]}`
    pub fn relevance() -> Self {
        Self::new(
            "relevance",
            json!({
                "type": "object",
                "properties": {
                    "chunks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "chunk_index": {"type": "integer"},
                                "relevance_score": {"type": "number"},
                                "reasoning": {"type": "string"}
                            },
                            "required": ["chunk_index", "relevance_score", "reasoning"]
                        }
                    }
                },
                "required": ["chunks"]
            }),
        )
    }

    /// `{answer, sources_used:[string], confidence_score}`
    pub fn answer() -> Self {
        Self::new(
            "answer",
            json!({
                "type": "object",
                "properties": {
                    "answer": {"type": "string"},
                    "sources_used": {"type": "array", "items": {"type": "string"}},
                    "confidence_score": {"type": "number"}
                },
                "required": ["answer", "sources_used", "confidence_score"]
            }),
        )
    }

    /// `{claims:[string]}`
    pub fn claim_decomposition() -> Self {
        Self::new(
            "claim_decomposition",
            json!({
                "type": "object",
                "properties": {
                    "claims": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["claims"]
            }),
        )
    }

    /// `{verdict, evidence, confidence}`
    pub fn claim_verdict() -> Self {
        Self::new(
            "claim_verdict",
            json!({
                "type": "object",
                "properties": {
                    "verdict": {"type": "string", "enum": ["VERIFIED", "REFUTED", "UNSUPPORTED"]},
                    "evidence": {"type": "string"},
                    "confidence": {"type": "number"}
                },
                "required": ["verdict", "evidence", "confidence"]
            }),
        )
    }

    /// Append output-format instructions for providers without native
    /// structured output.
    pub fn with_instructions(&self, prompt: &str) -> String {
        format!(
            "{}\n\nRespond with a single JSON object matching this JSON schema:\n{}\nOutput ONLY the JSON object, no markdown, no explanations.",
            prompt,
            self.pretty()
        )
    }

    /// Prompt used for the one retry after a validation failure.
    pub fn reinforce(&self, prompt: &str, error: &str) -> String {
        format!(
            "{}\n\nIMPORTANT: your previous response was rejected ({}).\n\
             Output ONLY valid JSON with no markdown formatting, no code blocks, no explanations.\n\
             Every required field must be present. Required schema:\n{}",
            prompt,
            error,
            self.pretty()
        )
    }

    fn pretty(&self) -> String {
        serde_json::to_string_pretty(&self.json).unwrap_or_else(|_| self.json.to_string())
    }
}

/// Parse a JSON object out of free model text, tolerating code fences and
/// leading/trailing prose.
pub fn parse_json_text(text: &str) -> Result<Value, serde_json::Error> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    match serde_json::from_str(unfenced) {
        Ok(value) => Ok(value),
        Err(err) => match (unfenced.find('{'), unfenced.rfind('}')) {
            (Some(start), Some(end)) if start < end => serde_json::from_str(&unfenced[start..=end]),
            _ => Err(err),
        },
    }
}
