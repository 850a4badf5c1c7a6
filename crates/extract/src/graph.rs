use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::normalizer::{normalize_entity_type, normalize_name, normalize_relation_type};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Normalized name; the dedup key
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub confidence: f64,
    pub mentions: BTreeSet<String>,
}

impl Entity {
    pub fn new<I, S>(name: &str, entity_type: &str, confidence: f64, mentions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: normalize_name(name),
            entity_type: normalize_entity_type(entity_type),
            confidence: clamp_confidence(confidence),
            mentions: mentions
                .into_iter()
                .map(|m| m.as_ref().trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    fn absorb(&mut self, other: Entity) {
        if other.confidence > self.confidence
            || (other.confidence == self.confidence && other.entity_type < self.entity_type)
        {
            self.entity_type = other.entity_type;
        }
        self.confidence = self.confidence.max(other.confidence);
        self.mentions.extend(other.mentions);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationKey {
    pub from_entity: String,
    pub to_entity: String,
    pub relation_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub from_entity: String,
    pub to_entity: String,
    pub relation_type: String,
    pub confidence: f64,
    pub evidence: String,
}

impl Relation {
    pub fn new(from: &str, to: &str, relation_type: &str, confidence: f64, evidence: &str) -> Self {
        Self {
            from_entity: normalize_name(from),
            to_entity: normalize_name(to),
            relation_type: normalize_relation_type(relation_type),
            confidence: clamp_confidence(confidence),
            evidence: evidence.trim().to_string(),
        }
    }

    pub fn key(&self) -> RelationKey {
        RelationKey {
            from_entity: self.from_entity.clone(),
            to_entity: self.to_entity.clone(),
            relation_type: self.relation_type.clone(),
        }
    }

    fn absorb(&mut self, other: Relation) {
        if other.confidence > self.confidence
            || (other.confidence == self.confidence && other.evidence < self.evidence)
        {
            self.confidence = other.confidence;
            self.evidence = other.evidence;
        }
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Entities keyed by normalized name plus relations keyed by
/// `(from, to, type)`. Every merge is commutative and idempotent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "GraphRecord", into = "GraphRecord")]
pub struct KnowledgeGraph {
    entities: BTreeMap<String, Entity>,
    relations: BTreeMap<RelationKey, Relation>,
}

#[derive(Serialize, Deserialize)]
struct GraphRecord {
    entities: Vec<Entity>,
    relations: Vec<Relation>,
}

impl From<KnowledgeGraph> for GraphRecord {
    fn from(graph: KnowledgeGraph) -> Self {
        Self {
            entities: graph.entities.into_values().collect(),
            relations: graph.relations.into_values().collect(),
        }
    }
}

impl From<GraphRecord> for KnowledgeGraph {
    fn from(record: GraphRecord) -> Self {
        let mut graph = KnowledgeGraph::new();
        record.entities.into_iter().for_each(|e| graph.merge_entity(e));
        record.relations.into_iter().for_each(|r| graph.merge_relation(r));
        graph
    }
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_entity(&mut self, entity: Entity) {
        if entity.name.is_empty() {
            return;
        }
        match self.entities.get_mut(&entity.name) {
            Some(existing) => existing.absorb(entity),
            None => {
                self.entities.insert(entity.name.clone(), entity);
            }
        }
    }

    pub fn merge_relation(&mut self, relation: Relation) {
        if relation.from_entity.is_empty() || relation.to_entity.is_empty() {
            return;
        }
        match self.relations.get_mut(&relation.key()) {
            Some(existing) => existing.absorb(relation),
            None => {
                self.relations.insert(relation.key(), relation);
            }
        }
    }

    /// Union of two graphs.
    pub fn merge(&mut self, other: KnowledgeGraph) {
        other.entities.into_values().for_each(|e| self.merge_entity(e));
        other.relations.into_values().for_each(|r| self.merge_relation(r));
    }

    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.entities.get(&normalize_name(name))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    pub fn entity_names(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }

    /// Compact text form for prompts, highest-confidence facts first.
    pub fn summary(&self, limit: usize) -> String {
        if self.is_empty() {
            return "(none)".to_string();
        }

        let mut entities: Vec<&Entity> = self.entities.values().collect();
        entities.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut relations: Vec<&Relation> = self.relations.values().collect();
        relations.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut lines: Vec<String> = entities
            .into_iter()
            .take(limit)
            .map(|e| format!("- {} ({})", e.name, e.entity_type))
            .collect();
        lines.extend(relations.into_iter().take(limit).map(|r| {
            format!(
                "- {} -[{}]-> {}: \"{}\"",
                r.from_entity, r.relation_type, r.to_entity, r.evidence
            )
        }));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> Entity {
        Entity::new("Acme Corp", "ORG", 0.8, ["Acme"])
    }

    #[test]
    fn merging_same_entity_twice_is_idempotent() {
        let mut graph = KnowledgeGraph::new();
        graph.merge_entity(acme());
        graph.merge_entity(acme());

        assert_eq!(graph.entity_count(), 1);
        let entity = graph.get("Acme Corp").unwrap();
        assert_eq!(entity.confidence, 0.8);
        assert_eq!(entity.mentions, BTreeSet::from(["Acme".to_string()]));
    }

    #[test]
    fn entity_merge_unions_mentions_and_keeps_max_confidence() {
        let mut graph = KnowledgeGraph::new();
        graph.merge_entity(acme());
        graph.merge_entity(Entity::new("acme  corp.", "ORGANIZATION", 0.95, ["Acme Corporation"]));

        let entity = graph.get("ACME CORP").unwrap();
        assert_eq!(graph.entity_count(), 1);
        assert_eq!(entity.confidence, 0.95);
        assert_eq!(entity.entity_type, "ORGANIZATION");
        assert_eq!(entity.mentions.len(), 2);
    }

    #[test]
    fn merge_order_does_not_matter() {
        let items = vec![
            Entity::new("Acme", "ORGANIZATION", 0.9, ["Acme"]),
            Entity::new("acme", "COMPANY", 0.9, ["ACME Inc"]),
            Entity::new("Jane Doe", "PERSON", 0.85, ["Jane"]),
        ];
        let relations = vec![
            Relation::new("Jane Doe", "Acme", "founded", 0.9, "Jane founded Acme."),
            Relation::new("jane doe", "acme", "FOUNDED", 0.9, "Acme was founded by Jane."),
        ];

        let mut forward = KnowledgeGraph::new();
        items.iter().cloned().for_each(|e| forward.merge_entity(e));
        relations.iter().cloned().for_each(|r| forward.merge_relation(r));

        let mut backward = KnowledgeGraph::new();
        items.iter().rev().cloned().for_each(|e| backward.merge_entity(e));
        relations.iter().rev().cloned().for_each(|r| backward.merge_relation(r));

        assert_eq!(forward, backward);
        assert_eq!(forward.get("acme").unwrap().entity_type, "COMPANY");
        assert_eq!(forward.relation_count(), 1);
        assert_eq!(
            forward.relations().next().unwrap().evidence,
            "Acme was founded by Jane."
        );
    }

    #[test]
    fn relation_keeps_higher_confidence_evidence() {
        let mut graph = KnowledgeGraph::new();
        graph.merge_relation(Relation::new("Acme", "Rockets", "develops", 0.7, "weak"));
        graph.merge_relation(Relation::new("Acme", "Rockets", "DEVELOPS", 0.9, "strong"));
        graph.merge_relation(Relation::new("Acme", "Rockets", "develops", 0.8, "middle"));

        let relation = graph.relations().next().unwrap();
        assert_eq!(graph.relation_count(), 1);
        assert_eq!(relation.confidence, 0.9);
        assert_eq!(relation.evidence, "strong");
    }

    #[test]
    fn serializes_as_entity_and_relation_lists() {
        let mut graph = KnowledgeGraph::new();
        graph.merge_entity(acme());
        graph.merge_relation(Relation::new("Acme Corp", "Rockets", "develops", 0.9, "Acme builds rockets."));

        let json = serde_json::to_value(&graph).unwrap();
        assert_eq!(json["entities"][0]["name"], "acme corp");
        assert_eq!(json["entities"][0]["type"], "ORG");
        assert_eq!(json["relations"][0]["relation_type"], "DEVELOPS");

        let back: KnowledgeGraph = serde_json::from_value(json).unwrap();
        assert_eq!(back, graph);
    }
}
