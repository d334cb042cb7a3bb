//! Recording one unit of work
//!
//! A [`RecordingSession`] holds the unit scope of its recorder for as long
//! as it lives. Dropping a session without finishing it discards everything
//! the unit recorded; the global scope is kept.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::RecordingConfig;
use crate::error::Result;
use crate::persistence::{RecordedUnit, TracePersistence};
use crate::provider::ProviderRef;
use crate::proxy::RecordingProxies;
use crate::recorder::ScopeGuard;
use crate::value::Value;

/// The recording of a single unit of work on the current thread
#[derive(Debug)]
pub struct RecordingSession {
    proxies: RecordingProxies,
    unit_name: String,
    unit_id: i32,
    output_dir: PathBuf,
    _scope: ScopeGuard,
}

impl RecordingSession {
    /// Start recording `unit_name`
    ///
    /// Returns `None` when recording is disabled or the filter does not
    /// select the unit.
    pub fn begin(
        config: &RecordingConfig,
        proxies: &RecordingProxies,
        unit_name: &str,
        unit_id: i32,
    ) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        if !config.unit_filter()?.matches(unit_name) {
            debug!(unit = unit_name, "Unit not selected for recording");
            return Ok(None);
        }
        info!(unit = unit_name, unit_id, "Recording unit");
        Ok(Some(Self {
            proxies: proxies.clone(),
            unit_name: unit_name.to_string(),
            unit_id,
            output_dir: config.output_dir.clone(),
            _scope: proxies.recorder().enter_unit_scope(),
        }))
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub fn unit_id(&self) -> i32 {
        self.unit_id
    }

    pub fn proxies(&self) -> &RecordingProxies {
        &self.proxies
    }

    /// Wrap a provider instance for the consumer
    pub fn proxify(&self, instance: &ProviderRef) -> Result<ProviderRef> {
        self.proxies.proxify(instance)
    }

    /// Where [`RecordingSession::finish_and_save`] writes this unit
    pub fn trace_path(&self) -> PathBuf {
        trace_path(&self.output_dir, self.unit_id)
    }

    /// Collect everything the unit recorded into a trace document
    ///
    /// `receiver` is the root provider of the unit; its own pre-recorded
    /// calls are collected even if the consumer never called it.
    pub fn finish(self, receiver: &ProviderRef, configuration: &str) -> Result<RecordedUnit> {
        let root = self.proxies.proxify(receiver)?;
        let operations = self.proxies.collect_reachable_from(std::slice::from_ref(&root))?;
        let mut unit = RecordedUnit::new(Value::Provider(root), configuration, self.unit_id);
        unit.operations = operations;
        info!(
            unit = %self.unit_name,
            operations = unit.operations.len(),
            "Finished recording unit"
        );
        Ok(unit)
    }

    /// Finish the unit and save it as `<unitId>.json` in the output directory
    pub fn finish_and_save(
        self,
        persistence: &TracePersistence,
        receiver: &ProviderRef,
        configuration: &str,
        final_artifact: Option<String>,
    ) -> Result<(RecordedUnit, PathBuf)> {
        let path = self.trace_path();
        let mut unit = self.finish(receiver, configuration)?;
        unit.final_artifact = final_artifact;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        persistence.save(&unit, &path)?;
        Ok((unit, path))
    }
}

fn trace_path(output_dir: &Path, unit_id: i32) -> PathBuf {
    output_dir.join(format!("{}.json", unit_id))
}
