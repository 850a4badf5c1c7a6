use regex::Regex;
use std::sync::LazyLock;

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.,!?;:']").expect("punctuation pattern is valid"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Dedup key for entities: lowercase, punctuation stripped, whitespace collapsed.
///
/// The mapping is stateless: a surface form maps to the same key whichever
/// branch saw it first.
pub fn normalize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let stripped = PUNCTUATION.replace_all(&lower, "");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

pub fn normalize_entity_type(entity_type: &str) -> String {
    entity_type.trim().to_uppercase()
}

/// `works for` and `Works-For` style variants collapse to `WORKS_FOR`.
pub fn normalize_relation_type(relation_type: &str) -> String {
    let upper = relation_type.trim().to_uppercase();
    WHITESPACE
        .replace_all(&upper, "_")
        .replace('-', "_")
}
