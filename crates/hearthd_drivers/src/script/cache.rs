use std::collections::HashMap;
use std::hash::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Mutex;
use std::sync::PoisonError;

use tracing::debug;

use super::AnalyzedProgram;
use super::CompiledUnit;
use super::EngineError;
use super::ScriptEngine;

/// Stable-within-process digest of a script source.
pub fn source_digest(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

struct CacheEntry {
    digest: u64,
    unit: CompiledUnit,
}

/// Compiled units keyed by program id.
///
/// Each entry remembers the digest of the source it was compiled from; a
/// lookup with a different digest misses, so editing a script never runs the
/// stale unit.
#[derive(Default)]
pub struct CompileCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CompileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, program_id: &str, digest: u64) -> Option<CompiledUnit> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(program_id)
            .filter(|entry| entry.digest == digest)
            .map(|entry| entry.unit.clone())
    }

    pub fn insert(&self, program_id: &str, digest: u64, unit: CompiledUnit) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(program_id.to_string(), CacheEntry { digest, unit });
    }

    pub fn invalidate(&self, program_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(program_id).is_some() {
            debug!("[{}] Compiled unit invalidated", program_id);
        }
    }

    /// Return the cached unit for `digest`, compiling `program` on a miss.
    pub fn get_or_compile(
        &self,
        engine: &dyn ScriptEngine,
        program: &AnalyzedProgram,
        digest: u64,
    ) -> Result<CompiledUnit, EngineError> {
        if let Some(unit) = self.get(&program.program_id, digest) {
            return Ok(unit);
        }

        // Compiling outside the lock; two racing callers both compile and the
        // last insert wins, which is harmless.
        debug!("[{}] Compiling", program.program_id);
        let unit = engine.compile(program)?;
        self.insert(&program.program_id, digest, unit.clone());
        Ok(unit)
    }
}
