use serde::{Deserialize, Serialize};

/// Wire shape of an entity-extraction reply. Extra fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub mentions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub from_entity: String,
    pub to_entity: String,
    pub relation_type: String,
    pub confidence: f64,
    pub evidence: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_unknown_fields_and_rejects_missing_ones() {
        let ok: ExtractionResult = serde_json::from_str(
            r#"{"entities":[{"name":"Acme","type":"ORGANIZATION","confidence":0.9,"id":"E1"}],
                "relations":[],"notes":"extra"}"#,
        )
        .unwrap();
        assert_eq!(ok.entities[0].entity_type, "ORGANIZATION");
        assert!(ok.entities[0].mentions.is_empty());

        let missing = serde_json::from_str::<ExtractionResult>(r#"{"entities":[]}"#);
        assert!(missing.is_err());
    }
}
