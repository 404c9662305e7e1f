//! Per-task in-memory vector stores
//!
//! A task creates named collections of fixed dimension and searches them
//! by cosine similarity. Store ids are positions in the task's list, so
//! deleting a store shifts the ids of the ones after it.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::task::TaskId;

#[derive(Debug, Error, PartialEq)]
pub enum VectorStoreError {
    #[error("store with name {0} already exists")]
    Duplicate(String),
    #[error("vector store {0} not found")]
    NotFound(usize),
    #[error("dimension mismatch: store has {expected}, vector has {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("dimensions must be positive")]
    ZeroDimensions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorStoreCreateRequest {
    pub name: String,
    pub dimensions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorStoreIdRequest {
    pub vid: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorStoreInsertRequest {
    pub vid: usize,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorStoreSearchRequest {
    pub vid: usize,
    pub vector: Vec<f32>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: u64,
    pub score: f32,
    pub vector: Vec<f32>,
    pub data: String,
}

#[derive(Debug, Clone)]
struct Point {
    id: u64,
    vector: Vec<f32>,
    data: String,
}

#[derive(Debug, Clone)]
struct VectorStore {
    name: String,
    dimensions: usize,
    next_id: u64,
    points: Vec<Point>,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[derive(Default)]
pub struct VectorStoreRegistry {
    stores: RwLock<HashMap<TaskId, Vec<VectorStore>>>,
}

impl VectorStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, task_id: &TaskId, name: &str, dimensions: usize) -> Result<usize, VectorStoreError> {
        if dimensions == 0 {
            return Err(VectorStoreError::ZeroDimensions);
        }
        let mut all = self.stores.write().unwrap_or_else(|p| p.into_inner());
        let stores = all.entry(task_id.clone()).or_default();
        if stores.iter().any(|s| s.name == name) {
            return Err(VectorStoreError::Duplicate(name.to_string()));
        }
        info!(task_id = %task_id, name, dimensions, "Creating vector store");
        stores.push(VectorStore {
            name: name.to_string(),
            dimensions,
            next_id: 1,
            points: Vec::new(),
        });
        Ok(stores.len() - 1)
    }

    pub fn delete(&self, task_id: &TaskId, vid: usize) -> Result<(), VectorStoreError> {
        let mut all = self.stores.write().unwrap_or_else(|p| p.into_inner());
        let stores = all
            .get_mut(task_id)
            .filter(|s| vid < s.len())
            .ok_or(VectorStoreError::NotFound(vid))?;
        let removed = stores.remove(vid);
        info!(task_id = %task_id, vid, name = %removed.name, "Deleted vector store");
        Ok(())
    }

    /// Returns the id assigned to the point
    pub fn insert(
        &self,
        task_id: &TaskId,
        vid: usize,
        vector: Vec<f32>,
        data: String,
    ) -> Result<u64, VectorStoreError> {
        let mut all = self.stores.write().unwrap_or_else(|p| p.into_inner());
        let store = all
            .get_mut(task_id)
            .and_then(|s| s.get_mut(vid))
            .ok_or(VectorStoreError::NotFound(vid))?;
        if vector.len() != store.dimensions {
            return Err(VectorStoreError::Dimension {
                expected: store.dimensions,
                actual: vector.len(),
            });
        }
        let id = store.next_id;
        store.next_id += 1;
        store.points.push(Point { id, vector, data });
        debug!(task_id = %task_id, vid, point = id, "Inserted vector");
        Ok(id)
    }

    /// Best matches first
    pub fn search(
        &self,
        task_id: &TaskId,
        vid: usize,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        let all = self.stores.read().unwrap_or_else(|p| p.into_inner());
        let store = all
            .get(task_id)
            .and_then(|s| s.get(vid))
            .ok_or(VectorStoreError::NotFound(vid))?;
        if vector.len() != store.dimensions {
            return Err(VectorStoreError::Dimension {
                expected: store.dimensions,
                actual: vector.len(),
            });
        }
        let mut hits: Vec<SearchHit> = store
            .points
            .iter()
            .map(|p| SearchHit {
                id: p.id,
                score: cosine_similarity(vector, &p.vector),
                vector: p.vector.clone(),
                data: p.data.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    pub fn store_count(&self, task_id: &TaskId) -> usize {
        self.stores
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn clear_task(&self, task_id: &TaskId) {
        self.stores
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskId {
        "task-1".to_string()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let reg = VectorStoreRegistry::new();
        assert_eq!(reg.create(&task(), "docs", 3).unwrap(), 0);
        assert_eq!(
            reg.create(&task(), "docs", 3),
            Err(VectorStoreError::Duplicate("docs".to_string()))
        );
        // same name in another task is fine
        assert_eq!(reg.create(&"task-2".to_string(), "docs", 3).unwrap(), 0);
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let reg = VectorStoreRegistry::new();
        let vid = reg.create(&task(), "docs", 2).unwrap();
        reg.insert(&task(), vid, vec![1.0, 0.0], "east".into()).unwrap();
        reg.insert(&task(), vid, vec![0.0, 1.0], "north".into()).unwrap();
        reg.insert(&task(), vid, vec![0.7, 0.7], "north-east".into()).unwrap();

        let hits = reg.search(&task(), vid, &[1.0, 0.1], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].data, "east");
        assert_eq!(hits[1].data, "north-east");
        assert_eq!(hits[0].id, 1);
    }

    #[test]
    fn test_dimension_mismatch() {
        let reg = VectorStoreRegistry::new();
        let vid = reg.create(&task(), "docs", 3).unwrap();
        assert_eq!(
            reg.insert(&task(), vid, vec![1.0], String::new()),
            Err(VectorStoreError::Dimension {
                expected: 3,
                actual: 1
            })
        );
        assert!(reg.search(&task(), vid, &[1.0, 2.0], 1).is_err());
        assert_eq!(reg.create(&task(), "empty", 0), Err(VectorStoreError::ZeroDimensions));
    }

    #[test]
    fn test_delete_shifts_later_ids() {
        let reg = VectorStoreRegistry::new();
        reg.create(&task(), "a", 1).unwrap();
        reg.create(&task(), "b", 1).unwrap();
        reg.delete(&task(), 0).unwrap();
        assert_eq!(reg.store_count(&task()), 1);
        // "b" now lives at 0
        reg.insert(&task(), 0, vec![1.0], "x".into()).unwrap();
        assert_eq!(reg.delete(&task(), 5), Err(VectorStoreError::NotFound(5)));
    }

    #[test]
    fn test_clear_task_releases_stores() {
        let reg = VectorStoreRegistry::new();
        reg.create(&task(), "a", 1).unwrap();
        reg.clear_task(&task());
        assert_eq!(reg.store_count(&task()), 0);
    }
}
