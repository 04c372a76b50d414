//! Typed knowledge graph of entities and relations.
//!
//! Nodes are entities keyed by id (the same ids as the `entities` table, so
//! graph walks and store joins agree); edges carry a label and optional
//! confidence. The graph lives in memory behind a read-write lock
//! (single-writer, many-reader) and snapshots to disk alongside the vector
//! index.
//!
//! The core operation is bounded simple-path search: breadth-first over an
//! undirected view of the edge set, no node revisited within a path, at most
//! `max_hops` edges per path, truncated shortest-first to a configured cap.
//! Adjacency lists keep insertion order, which makes traversal deterministic
//! for a fixed graph.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::llm::LanguageModel;
use crate::store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub label: String,
    pub confidence: Option<f64>,
    pub chunk_id: Option<String>,
}

/// Edge direction for neighbor queries. Path search always expands `Both`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relation_count: usize,
}

#[derive(Default, Serialize, Deserialize)]
struct GraphState {
    nodes: HashMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
    /// Node id → indices into `edges`, in insertion order. Each edge is
    /// listed under both endpoints (undirected expansion).
    adjacency: HashMap<String, Vec<usize>>,
    /// `(name, entity_type)` → node id; enforces upsert idempotence.
    by_key: HashMap<(String, String), String>,
    /// Name → first node id registered under that name; used to resolve
    /// query entities.
    by_name: HashMap<String, String>,
}

pub struct KnowledgeGraph {
    state: RwLock<GraphState>,
}

impl Default for KnowledgeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Insert a node if `(name, entity_type)` is new, otherwise return the
    /// existing node's id. The bool reports whether a node was created.
    pub fn upsert_node(
        &self,
        id: &str,
        name: &str,
        entity_type: &str,
        aliases: &[String],
    ) -> (String, bool) {
        let mut state = self.state.write();
        let key = (name.to_string(), entity_type.to_string());

        if let Some(existing) = state.by_key.get(&key) {
            return (existing.clone(), false);
        }

        state.nodes.insert(
            id.to_string(),
            GraphNode {
                id: id.to_string(),
                name: name.to_string(),
                entity_type: entity_type.to_string(),
                aliases: aliases.to_vec(),
            },
        );
        state.by_key.insert(key, id.to_string());
        state
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| id.to_string());

        (id.to_string(), true)
    }

    /// Add a directed labeled edge. Both endpoints must already be nodes.
    pub fn add_edge(
        &self,
        source: &str,
        target: &str,
        label: &str,
        confidence: Option<f64>,
        chunk_id: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write();

        if !state.nodes.contains_key(source) {
            return Err(EngineError::InvalidInput(format!(
                "unknown relation source entity: {}",
                source
            )));
        }
        if !state.nodes.contains_key(target) {
            return Err(EngineError::InvalidInput(format!(
                "unknown relation target entity: {}",
                target
            )));
        }

        let idx = state.edges.len();
        state.edges.push(GraphEdge {
            source: source.to_string(),
            target: target.to_string(),
            label: label.to_string(),
            confidence,
            chunk_id,
        });
        state
            .adjacency
            .entry(source.to_string())
            .or_default()
            .push(idx);
        if source != target {
            state
                .adjacency
                .entry(target.to_string())
                .or_default()
                .push(idx);
        }

        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Option<GraphNode> {
        self.state.read().nodes.get(id).cloned()
    }

    /// Map a path of node ids to node names, dropping ids that no longer
    /// resolve.
    pub fn node_names(&self, ids: &[String]) -> Vec<String> {
        let state = self.state.read();
        ids.iter()
            .filter_map(|id| state.nodes.get(id).map(|n| n.name.clone()))
            .collect()
    }

    /// Neighboring node ids in edge insertion order, deduplicated.
    pub fn neighbors(&self, id: &str, direction: Direction) -> Vec<String> {
        let state = self.state.read();
        let mut seen = Vec::new();
        if let Some(edge_indices) = state.adjacency.get(id) {
            for &idx in edge_indices {
                let edge = &state.edges[idx];
                let other = match direction {
                    Direction::Outgoing if edge.source == id => &edge.target,
                    Direction::Incoming if edge.target == id => &edge.source,
                    Direction::Both => {
                        if edge.source == id {
                            &edge.target
                        } else {
                            &edge.source
                        }
                    }
                    _ => continue,
                };
                if !seen.contains(other) {
                    seen.push(other.clone());
                }
            }
        }
        seen
    }

    /// Enumerate simple paths from `start` (a node id or an entity name) of
    /// 1..=`max_hops` edges, breadth-first. Unknown start yields no paths.
    /// Results are truncated to `max_paths`, shortest first, ties broken by
    /// edge insertion order.
    pub fn find_paths(&self, start: &str, max_hops: usize, max_paths: usize) -> Vec<Vec<String>> {
        let state = self.state.read();

        let start_id = if state.nodes.contains_key(start) {
            start.to_string()
        } else if let Some(id) = state.by_name.get(start) {
            id.clone()
        } else {
            return Vec::new();
        };

        if max_hops == 0 || max_paths == 0 {
            return Vec::new();
        }

        let mut results: Vec<Vec<String>> = Vec::new();
        let mut queue: VecDeque<Vec<String>> = VecDeque::new();
        queue.push_back(vec![start_id]);

        while let Some(path) = queue.pop_front() {
            if path.len() - 1 >= max_hops {
                continue;
            }
            let Some(last) = path.last() else {
                continue;
            };

            let Some(edge_indices) = state.adjacency.get(last) else {
                continue;
            };

            for &idx in edge_indices {
                let edge = &state.edges[idx];
                let next = if edge.source == *last {
                    &edge.target
                } else {
                    &edge.source
                };

                if path.contains(next) {
                    continue;
                }

                let mut extended = path.clone();
                extended.push(next.clone());
                results.push(extended.clone());
                if results.len() >= max_paths {
                    return results;
                }
                queue.push_back(extended);
            }
        }

        results
    }

    /// Mine entities and relations from `text` via the LM, insert them into
    /// the graph and the entity tables, and record entity-chunk provenance
    /// links. Returns `(entities_added, relations_added)`. Idempotent on
    /// `(name, entity_type)`; relation inserts are additive.
    pub async fn extract_and_add(
        &self,
        lm: &dyn LanguageModel,
        pool: &SqlitePool,
        text: &str,
        doc_id: &str,
        chunk_id: &str,
    ) -> Result<(usize, usize)> {
        let extraction = lm.extract_entities(text).await?;

        let mut entities_added = 0usize;
        let mut relations_added = 0usize;
        let mut name_to_id: HashMap<String, String> = HashMap::new();

        for entity in &extraction.entities {
            let candidate_id = Uuid::new_v4().to_string();
            let (row, created) = store::upsert_entity(
                pool,
                &candidate_id,
                &entity.name,
                &entity.entity_type,
                &[],
            )
            .await?;

            self.upsert_node(&row.id, &row.name, &row.entity_type, &row.aliases);
            store::link_entity_chunk(pool, &row.id, chunk_id).await?;

            if created {
                entities_added += 1;
            }
            name_to_id.entry(row.name.clone()).or_insert(row.id);
        }

        for relation in &extraction.relations {
            let source_id = match self.resolve_name(&name_to_id, &relation.source) {
                Some(id) => id,
                None => continue,
            };
            let target_id = match self.resolve_name(&name_to_id, &relation.target) {
                Some(id) => id,
                None => continue,
            };

            let record = crate::models::Relation {
                id: Uuid::new_v4().to_string(),
                source_id: source_id.clone(),
                target_id: target_id.clone(),
                label: relation.label.clone(),
                confidence: relation.confidence,
                chunk_id: Some(chunk_id.to_string()),
            };
            store::insert_relation(pool, &record).await?;
            self.add_edge(
                &source_id,
                &target_id,
                &relation.label,
                relation.confidence,
                Some(chunk_id.to_string()),
            )?;
            relations_added += 1;
        }

        tracing::debug!(
            doc_id,
            chunk_id,
            entities_added,
            relations_added,
            "knowledge graph updated"
        );

        Ok((entities_added, relations_added))
    }

    fn resolve_name(&self, local: &HashMap<String, String>, name: &str) -> Option<String> {
        if let Some(id) = local.get(name) {
            return Some(id.clone());
        }
        self.state.read().by_name.get(name).cloned()
    }

    pub fn stats(&self) -> GraphStats {
        let state = self.state.read();
        GraphStats {
            entity_count: state.nodes.len(),
            relation_count: state.edges.len(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = {
            let state = self.state.read();
            bincode::serialize(&*state)
                .map_err(|e| EngineError::Index(format!("graph snapshot encode failed: {}", e)))?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;

        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let state: GraphState = bincode::deserialize(&bytes)
            .map_err(|e| EngineError::Index(format!("graph snapshot decode failed: {}", e)))?;

        Ok(Self {
            state: RwLock::new(state),
        })
    }
}
