use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::limits::*;
use crate::model::ResourceId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub name: String,
}

/// Static id → name table of bookable fields. Loaded once at start-up;
/// the scheduler never mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    resources: Vec<ResourceInfo>,
}

impl Catalog {
    /// Validates ids are unique and names are present; keeps id order.
    pub fn new(mut resources: Vec<ResourceInfo>) -> Result<Self, CatalogError> {
        if resources.is_empty() {
            return Err(CatalogError::Empty);
        }
        if resources.len() > MAX_RESOURCES {
            return Err(CatalogError::TooLarge(resources.len()));
        }
        let mut seen = HashSet::new();
        for r in &resources {
            if !seen.insert(r.id) {
                return Err(CatalogError::DuplicateId(r.id));
            }
            if r.name.trim().is_empty() || r.name.len() > MAX_RESOURCE_NAME_LEN {
                return Err(CatalogError::BadName(r.id));
            }
        }
        resources.sort_by_key(|r| r.id);
        Ok(Self { resources })
    }

    /// The fields the club has always offered.
    pub fn builtin() -> Self {
        let kinds = ["Football Field", "Basketball Court", "Volleyball Court"];
        let resources = kinds
            .iter()
            .enumerate()
            .flat_map(|(k, kind)| {
                (1..=5).map(move |n| ResourceInfo {
                    id: (k as ResourceId) * 5 + n,
                    name: format!("{kind} {n}"),
                })
            })
            .collect();
        Self { resources }
    }

    /// JSON array of `{"id": .., "name": ..}` objects.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let resources: Vec<ResourceInfo> =
            serde_json::from_str(json).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::new(resources)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceInfo> {
        self.resources.iter()
    }

    pub fn name(&self, id: ResourceId) -> Option<&str> {
        self.resources
            .binary_search_by_key(&id, |r| r.id)
            .ok()
            .map(|i| self.resources[i].name.as_str())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[derive(Debug)]
pub enum CatalogError {
    Empty,
    TooLarge(usize),
    DuplicateId(ResourceId),
    BadName(ResourceId),
    Parse(String),
    Io(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Empty => write!(f, "catalog has no resources"),
            CatalogError::TooLarge(n) => write!(f, "catalog too large: {n} resources"),
            CatalogError::DuplicateId(id) => write!(f, "duplicate resource id {id}"),
            CatalogError::BadName(id) => write!(f, "resource {id} has an empty or oversized name"),
            CatalogError::Parse(e) => write!(f, "catalog parse error: {e}"),
            CatalogError::Io(e) => write!(f, "catalog read error: {e}"),
        }
    }
}

impl std::error::Error for CatalogError {}
