//! Recording and replay proxies
//!
//! Both factories hand out [`ProviderRef`]s whose [`Provider::invoke`] routes
//! every call through a single interception hook:
//!
//! - [`RecordingProxies`] wrap real providers, memoize every recorded outcome
//!   in an [`crate::recorder::OperationRecorder`] and collect the closure of
//!   operations a trace needs.
//! - [`ReplayProxies`] answer from a flattened [`ReplayTable`] loaded from a
//!   trace, falling back to live local mirrors, declared fallbacks and
//!   default values.
//!
//! [`Provider::invoke`]: crate::provider::Provider::invoke

mod recording;
mod replay;
mod table;

pub use recording::RecordingProxies;
pub use replay::{ReplayOptions, ReplayProxies};
pub use table::ReplayTable;

use std::sync::Arc;
use tracing::error;

use crate::declarations::{Declarations, Registration};
use crate::error::{ReplayCompError, Result};
use crate::provider::ProviderRef;
use crate::value::ThrownError;

/// Creates proxies for provider references read from a trace
pub trait ProxyFactory {
    /// Registry the proxies are created from
    fn declarations(&self) -> &Declarations;

    /// Create a fresh proxy for `registration`
    fn create_proxy(&self, registration: &Arc<Registration>) -> Result<ProviderRef>;
}

/// Convert a framework failure inside an intercepted call into a thrown value
pub(crate) fn framework_error(error: ReplayCompError) -> ThrownError {
    error!(error = %error, "Framework error inside intercepted call");
    ThrownError::framework(error)
}
