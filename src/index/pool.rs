//! Interned path components
//!
//! Component ids are shared by every container, so the pool keeps its own
//! autocommit connection: an id handed out here is durable even if the
//! manifest transaction that wanted it rolls back.

use std::collections::HashMap;

use crate::catalog::Catalog;
use crate::error::Result;

pub struct StringPool {
    catalog: Catalog,
    cache: HashMap<String, i64>,
}

impl StringPool {
    /// Wrap a dedicated connection; the empty component is interned
    /// up front since nearly every path uses it
    pub fn new(catalog: Catalog) -> Result<Self> {
        let mut pool = Self {
            catalog,
            cache: HashMap::new(),
        };
        pool.id("")?;
        Ok(pool)
    }

    pub fn id(&mut self, component: &str) -> Result<i64> {
        if let Some(&id) = self.cache.get(component) {
            return Ok(id);
        }
        let id = self.catalog.intern(component)?;
        self.cache.insert(component.to_string(), id);
        Ok(id)
    }

    pub fn ids(&mut self, segments: &[String]) -> Result<Vec<i64>> {
        segments.iter().map(|s| self.id(s)).collect()
    }
}

#[cfg(test)]
impl StringPool {
    /// Number of cached components
    fn len(&self) -> usize {
        self.cache.len()
    }
}
