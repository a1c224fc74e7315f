//! Copy engine trait.
//!
//! The [`CopyEngine`] trait is the whole contract the scheduler core uses
//! to drive the external bulk-copy engine:
//!
//! ```text
//!   submit() ──→ lookup()/report() ──→ wait() ──→ report.is_successful()
//!                       │
//!                       └──→ kill()
//! ```
//!
//! | Method | Kind | Required | Returns |
//! |--------|------|----------|---------|
//! | `name()` | sync | yes | `&str` |
//! | `submit()` | async | yes | `EngineResult<CopyJobId>` |
//! | `lookup()` | async | yes | `EngineResult<Option<CopyJobReport>>` |
//! | `kill()` | async | yes | `EngineResult<()>` |
//! | `report()` | async | provided | `EngineResult<CopyJobReport>` |
//! | `wait()` | async | provided | `EngineResult<CopyJobReport>` |

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::job::{CopyJobId, CopyJobReport};
use crate::options::CopyOptions;

/// Handle to an external bulk-copy engine.
#[async_trait]
pub trait CopyEngine: Send + Sync {
    /// Engine name, used in logs.
    fn name(&self) -> &str;

    /// Submit a copy job and return its engine-assigned identifier.
    async fn submit(&self, options: &CopyOptions) -> EngineResult<CopyJobId>;

    /// Look up a copy job.
    ///
    /// Returns `Ok(None)` when the engine does not (yet) resolve the
    /// identifier, which happens for a while after an engine restart.
    async fn lookup(&self, job_id: &CopyJobId) -> EngineResult<Option<CopyJobReport>>;

    /// Kill a running copy job. Killing a finished job is a no-op.
    async fn kill(&self, job_id: &CopyJobId) -> EngineResult<()>;

    /// Get the current report of a known copy job.
    async fn report(&self, job_id: &CopyJobId) -> EngineResult<CopyJobReport> {
        self.lookup(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    /// Block until the copy job reaches a terminal state.
    ///
    /// Returns the final report whether the job succeeded or not; callers
    /// inspect [`CopyJobReport::is_successful`].
    async fn wait(
        &self,
        job_id: &CopyJobId,
        poll_interval: Duration,
    ) -> EngineResult<CopyJobReport> {
        loop {
            let report = self.report(job_id).await?;
            if report.is_complete() {
                return Ok(report);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
