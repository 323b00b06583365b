//! Macro store
//!
//! Named G-code snippets the `loadmacro` command resolves against. The
//! JSON-backed store persists across sessions; the in-memory store backs
//! tests and embedders that manage persistence themselves.

use cncbridge_core::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A stored G-code macro
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macro {
    /// Stable identifier used by `loadmacro`
    pub id: String,
    /// Display name
    pub name: String,
    /// The G-code body
    pub content: String,
}

/// Lookup interface the controllers resolve `loadmacro` against
pub trait MacroStore: Send + Sync {
    /// Fetch a macro by id
    fn get(&self, id: &str) -> Option<Macro>;

    /// All stored macros
    fn all(&self) -> Vec<Macro>;
}

/// In-memory macro store
#[derive(Default)]
pub struct InMemoryMacroStore {
    macros: RwLock<HashMap<String, Macro>>,
}

impl InMemoryMacroStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a macro
    pub fn insert(&self, m: Macro) {
        self.macros.write().insert(m.id.clone(), m);
    }

    /// Remove a macro by id
    pub fn remove(&self, id: &str) -> Option<Macro> {
        self.macros.write().remove(id)
    }
}

impl MacroStore for InMemoryMacroStore {
    fn get(&self, id: &str) -> Option<Macro> {
        self.macros.read().get(id).cloned()
    }

    fn all(&self) -> Vec<Macro> {
        self.macros.read().values().cloned().collect()
    }
}

/// JSON-file persisted macro store
pub struct JsonMacroStore {
    path: PathBuf,
    macros: RwLock<HashMap<String, Macro>>,
}

impl JsonMacroStore {
    /// Load the store from a JSON file, starting empty if it is missing
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let macros = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let list: Vec<Macro> = serde_json::from_str(&content)
                .map_err(|e| Error::other(format!("Invalid macro file {:?}: {}", path, e)))?;
            list.into_iter().map(|m| (m.id.clone(), m)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            macros: RwLock::new(macros),
        })
    }

    /// Insert or replace a macro and persist
    pub fn insert(&self, m: Macro) -> Result<()> {
        self.macros.write().insert(m.id.clone(), m);
        self.save()
    }

    /// Remove a macro by id and persist
    pub fn remove(&self, id: &str) -> Result<Option<Macro>> {
        let removed = self.macros.write().remove(id);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> Result<()> {
        let mut list: Vec<Macro> = self.macros.read().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        let json = serde_json::to_string_pretty(&list)
            .map_err(|e| Error::other(format!("Failed to serialize macros: {}", e)))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl MacroStore for JsonMacroStore {
    fn get(&self, id: &str) -> Option<Macro> {
        self.macros.read().get(id).cloned()
    }

    fn all(&self) -> Vec<Macro> {
        self.macros.read().values().cloned().collect()
    }
}
