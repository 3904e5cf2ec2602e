use crate::fare::RatePolicy;
use crate::session::StoreError;
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage backend for rate policies.
pub trait RateSource: Send + Sync {
    /// The most recently created active policy, if any.
    fn find_active_rate(&self) -> Result<Option<RatePolicy>, StoreError>;

    fn insert_rate(&self, policy: RatePolicy) -> Result<RatePolicy, StoreError>;
}

/// Pick the newest active policy from an unordered set.
pub fn newest_active<'a, I>(policies: I) -> Option<&'a RatePolicy>
where
    I: IntoIterator<Item = &'a RatePolicy>,
{
    policies
        .into_iter()
        .filter(|policy| policy.is_active)
        .max_by_key(|policy| policy.created_at)
}

/// Resolves the rate policy in effect, never failing.
#[derive(Clone)]
pub struct RateProvider {
    source: Arc<dyn RateSource>,
}

impl RateProvider {
    pub fn new(source: Arc<dyn RateSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn RateSource> {
        &self.source
    }

    /// Returns the active policy, or the built-in default when none is active
    /// or the lookup fails.
    pub fn active_rate(&self) -> RatePolicy {
        match self.source.find_active_rate() {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                debug!("No active rate policy configured, using default");
                RatePolicy::fallback()
            }
            Err(err) => {
                warn!(error = %err, "Rate policy lookup failed, using default");
                RatePolicy::fallback()
            }
        }
    }
}

impl std::fmt::Debug for RateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateProvider").finish_non_exhaustive()
    }
}
