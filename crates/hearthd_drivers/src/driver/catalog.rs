use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use tracing::debug;
use tracing::warn;

use super::DeviceDriver;
use super::DriverIdentity;
use super::Error;
use crate::schema::extract_driver_info;
use crate::schema::DriverInfo;
use crate::schema::Extraction;
use crate::script::format_script_diagnostics;
use crate::script::source_digest;
use crate::script::AnalyzedProgram;
use crate::script::CompileCache;
use crate::script::CompiledUnit;
use crate::script::EngineError;
use crate::script::ScriptEngine;

struct CatalogEntry {
    digest: u64,
    extraction: Arc<Extraction>,
}

/// A valid driver, ready to be invoked.
#[derive(Debug, Clone)]
pub struct PreparedDriver {
    pub unit: CompiledUnit,
    pub info: DriverInfo,
    pub program: AnalyzedProgram,
}

/// Per-revision cache of driver analysis results and compiled units.
///
/// Entries are keyed by driver identity and remember the digest of the source
/// they were derived from; editing a driver's source makes the next lookup
/// re-analyze it.
pub struct DriverCatalog {
    engine: Arc<dyn ScriptEngine>,
    entries: RwLock<HashMap<DriverIdentity, CatalogEntry>>,
    compiled: CompileCache,
}

impl DriverCatalog {
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        Self {
            engine,
            entries: RwLock::new(HashMap::new()),
            compiled: CompileCache::new(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ScriptEngine> {
        &self.engine
    }

    pub fn compile_cache(&self) -> &CompileCache {
        &self.compiled
    }

    /// Extraction result for the driver's current source.
    pub fn extraction(&self, driver: &DeviceDriver) -> Result<Arc<Extraction>, EngineError> {
        let digest = source_digest(&driver.source);
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(&driver.identity) {
                if entry.digest == digest {
                    return Ok(entry.extraction.clone());
                }
            }
        }

        debug!("[{}] Analyzing driver script", driver.identity);
        let extraction = Arc::new(extract_driver_info(
            self.engine.as_ref(),
            &driver.identity.program_id(),
            &driver.source,
        )?);
        if let Extraction::Invalid { diagnostics } = extraction.as_ref() {
            warn!(
                "[{}] Driver script is invalid:\n{}",
                driver.identity,
                format_script_diagnostics(diagnostics, &driver.source, &driver.identity.program_id())
            );
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            driver.identity.clone(),
            CatalogEntry {
                digest,
                extraction: extraction.clone(),
            },
        );
        Ok(extraction)
    }

    /// Compile a valid driver, or report why it cannot be invoked.
    pub fn prepare(&self, driver: &DeviceDriver) -> Result<PreparedDriver, Error> {
        let extraction = self.extraction(driver)?;
        match extraction.as_ref() {
            Extraction::Valid { info, program, .. } => {
                let unit = self.compiled.get_or_compile(
                    self.engine.as_ref(),
                    program,
                    source_digest(&driver.source),
                )?;
                Ok(PreparedDriver {
                    unit,
                    info: info.clone(),
                    program: program.clone(),
                })
            }
            Extraction::Invalid { diagnostics } => Err(Error::DriverInvalid {
                id: driver.identity.clone(),
                diagnostics: diagnostics.clone(),
            }),
        }
    }

    /// Forget everything cached for `id`.
    pub fn invalidate(&self, id: &DriverIdentity) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(id);
        self.compiled.invalidate(&id.program_id());
    }
}
