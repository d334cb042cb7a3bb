//! # Replaycomp - record once, replay offline
//!
//! Replaycomp captures every observable interaction between a consumer and
//! the provider objects it talks to while one unit of work runs, persists
//! that interaction as a trace, and later replays the trace against the
//! consumer without the original providers being present.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use replaycomp_core::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let naming = TypeDescriptor::new("Naming");
//!     let declarations = Arc::new(
//!         Declarations::builder()
//!             .register(RegistrationBuilder::new(naming.clone()))?
//!             .build(),
//!     );
//!
//!     // Recording: the consumer only ever sees proxies
//!     let recorder = Arc::new(OperationRecorder::new());
//!     let proxies = RecordingProxies::new(Arc::clone(&declarations), recorder);
//!     let real = StubProvider::new(naming, "Naming#1").into_ref();
//!     let _unit = proxies.recorder().enter_unit_scope();
//!     let proxy = proxies.proxify(&real)?;
//!     let _ = proxy.invoke(&Operation::new("nameOf", &["int"]), &[Value::Int(1)]);
//!
//!     let operations = proxies.collect_for_serialization()?;
//!     let persistence = TracePersistence::new(&declarations)?;
//!     let mut unit = RecordedUnit::new(Value::Provider(proxy), "default", 1);
//!     unit.operations = operations;
//!     persistence.save(&unit, "1.json")?;
//!
//!     // Replay: answers come from the trace
//!     let replay = ReplayProxies::new(declarations, ReplayOptions::strict());
//!     let loaded = persistence.load("1.json", &replay)?;
//!     replay.install(&loaded.operations)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Declarations**: which provider types are intercepted and how each
//!   operation is recorded and replayed
//! - **Operation recorder**: memoized outcomes in global, unit and ignored
//!   scopes
//! - **Proxies**: recording proxies in front of real providers, replay
//!   proxies answering from a flattened table
//! - **Graph mapper**: swaps providers and proxies inside composite values
//! - **Persistence**: the tagged JSON trace format
//! - **Harness**: batch replay and benchmarking of trace directories

pub mod config;
pub mod declarations;
pub mod error;
pub mod harness;
pub mod manifest;
pub mod mapper;
pub mod persistence;
pub mod provider;
pub mod proxy;
pub mod recorder;
pub mod session;
pub mod special;
pub mod stub;
pub mod value;

pub use error::{ReplayCompError, Result};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{RecordingConfig, RecordingFilter, ReplayCompConfig, ReplayConfig};
    pub use crate::declarations::{
        Declarations, DeclarationsBuilder, MethodCallToRecord, MethodStrategy, Registration,
        RegistrationBuilder, dispatching_invokable,
    };
    pub use crate::error::{Divergence, ReplayCompError, Result};
    pub use crate::harness::{
        BenchmarkConfig, BenchmarkReport, LoadedUnit, ReplayStatus, ReplaySummary, TraceLoader,
        TraceVerifier, UnitReplayer, discover_traces, run_benchmark, run_replay,
    };
    pub use crate::manifest::DeclarationManifest;
    pub use crate::mapper::ProxyGraphMapper;
    pub use crate::persistence::{
        Linkage, LinkageTable, ObjectSerializer, Platform, RecordedUnit, SerializerRegistry,
        TracePersistence,
    };
    pub use crate::provider::{EmptyEnvironment, LocalEnvironment, Provider, ProviderRef};
    pub use crate::proxy::{ProxyFactory, RecordingProxies, ReplayOptions, ReplayProxies};
    pub use crate::recorder::{OperationKey, OperationRecorder, RecordedOperation, ScopeKind};
    pub use crate::session::RecordingSession;
    pub use crate::special::{ResultOrMarker, SpecialResult};
    pub use crate::stub::StubProvider;
    pub use crate::value::{
        ElementType, Operation, Record, ThrownError, TypeDescriptor, Value, ValueGraph,
    };
}
