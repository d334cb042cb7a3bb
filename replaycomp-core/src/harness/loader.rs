//! Loading traces for replay

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::declarations::Declarations;
use crate::error::{ReplayCompError, Result};
use crate::persistence::{Platform, RecordedUnit, TracePersistence};
use crate::provider::LocalEnvironment;
use crate::proxy::{ReplayOptions, ReplayProxies};

/// A trace ready for replay: the document plus the proxies answering it
#[derive(Debug)]
pub struct LoadedUnit {
    pub path: PathBuf,
    pub unit: RecordedUnit,
    pub proxies: ReplayProxies,
}

/// Loads trace files into fresh [`ReplayProxies`]
pub struct TraceLoader {
    declarations: Arc<Declarations>,
    persistence: TracePersistence,
    options: ReplayOptions,
    environment: Option<Arc<dyn LocalEnvironment>>,
    check_platform: bool,
}

impl TraceLoader {
    pub fn new(declarations: Arc<Declarations>) -> Result<Self> {
        let persistence = TracePersistence::new(&declarations)?;
        Ok(Self {
            declarations,
            persistence,
            options: ReplayOptions::default(),
            environment: None,
            check_platform: true,
        })
    }

    pub fn with_options(mut self, options: ReplayOptions) -> Self {
        self.options = options;
        self
    }

    /// Environment searched for local mirrors after each load
    pub fn with_environment(mut self, environment: Arc<dyn LocalEnvironment>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Accept traces recorded on another platform
    pub fn skip_platform_check(mut self) -> Self {
        self.check_platform = false;
        self
    }

    pub fn declarations(&self) -> &Arc<Declarations> {
        &self.declarations
    }

    pub fn persistence(&self) -> &TracePersistence {
        &self.persistence
    }

    pub fn options(&self) -> ReplayOptions {
        self.options
    }

    /// Load `path`, install its operations and locate local mirrors
    ///
    /// # Errors
    ///
    /// `TraceIncomplete` for truncated files, `IncompatibleTrace` when the
    /// trace was recorded on another platform, and the usual persistence
    /// errors otherwise.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<LoadedUnit> {
        let path = path.as_ref();
        let proxies = ReplayProxies::new(Arc::clone(&self.declarations), self.options);
        let unit = self.persistence.load(path, &proxies)?;

        let host = Platform::host();
        if self.check_platform && unit.platform != host {
            return Err(ReplayCompError::IncompatibleTrace {
                expected: host.to_string(),
                found: unit.platform.to_string(),
            });
        }

        proxies.install(&unit.operations)?;
        if let Some(environment) = &self.environment {
            let located = proxies.find_local_mirrors(environment.as_ref());
            debug!(path = %path.display(), located, "Located local mirrors");
        }
        info!(
            path = %path.display(),
            unit_id = unit.unit_id,
            operations = unit.operations.len(),
            "Loaded unit for replay"
        );
        Ok(LoadedUnit {
            path: path.to_path_buf(),
            unit,
            proxies,
        })
    }
}

impl fmt::Debug for TraceLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceLoader")
            .field("declarations", &self.declarations.len())
            .field("options", &self.options)
            .field("has_environment", &self.environment.is_some())
            .field("check_platform", &self.check_platform)
            .finish()
    }
}
