use log::debug;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::backlog::Backlog;
use crate::config::{ArrivalPolicy, ConfigError};
use crate::dataset::Request;
use crate::distribution::ArrivalPacer;

/// What the scheduler did during a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReleaseStats {
    pub released: usize,
    /// Time between the first and the last enqueue.
    pub span: std::time::Duration,
}

/// Releases requests into the backlog in source order.
pub struct ArrivalScheduler {
    pacer: ArrivalPacer,
}

impl ArrivalScheduler {
    pub fn new(policy: ArrivalPolicy, seed: u64) -> Result<Self, ConfigError> {
        Ok(Self {
            pacer: ArrivalPacer::new(policy, seed)?,
        })
    }

    pub fn pacing_name(&self) -> &'static str {
        self.pacer.name()
    }

    /// Runs until every request is enqueued or the run is cancelled.
    ///
    /// A delay is drawn before each request, the first one included. A full
    /// backlog suspends the scheduler until a worker makes room.
    pub async fn release(
        mut self,
        requests: Vec<Request>,
        backlog: Backlog,
        cancel: CancellationToken,
    ) -> ReleaseStats {
        let mut first: Option<Instant> = None;
        let mut last: Option<Instant> = None;
        let mut released = 0;

        for request in requests {
            if let Some(delay) = self.pacer.next_delay() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }

            let pushed = tokio::select! {
                _ = cancel.cancelled() => break,
                pushed = backlog.push(request) => pushed,
            };
            if pushed.is_err() {
                debug!("Backlog closed, stopping release after {} requests", released);
                break;
            }

            let now = Instant::now();
            first.get_or_insert(now);
            last = Some(now);
            released += 1;
        }

        let span = match (first, last) {
            (Some(first), Some(last)) => last.duration_since(first),
            _ => std::time::Duration::ZERO,
        };

        debug!("Released {} requests over {:.3}s", released, span.as_secs_f64());
        ReleaseStats { released, span }
    }
}
