use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

use crate::aggregator::{FailedRequest, LatencyAggregator};
use crate::backlog::Backlog;
use crate::client::{RequestTransport, TransportError};
use crate::config::FailurePolicy;
use crate::metrics::Metrics;
use crate::progress::Progress;

/// Requests left in the run plus the signal that fires when none are left.
///
/// Whichever worker takes the count to zero cancels the token; every other
/// worker and the scheduler watch the same token and wind down.
#[derive(Debug)]
pub struct Completion {
    remaining: AtomicUsize,
    signal: CancellationToken,
}

impl Completion {
    pub fn new(total: usize) -> Self {
        let signal = CancellationToken::new();
        if total == 0 {
            signal.cancel();
        }
        Self {
            remaining: AtomicUsize::new(total),
            signal,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Marks one request as done and returns how many are left.
    pub fn complete_one(&self) -> usize {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => {
                let left = previous - 1;
                if left == 0 {
                    self.signal.cancel();
                }
                left
            }
            Err(_) => {
                warn!("Completion recorded after the run had already finished");
                0
            }
        }
    }

    /// Ends the run early without the count reaching zero.
    pub fn abort(&self) {
        self.signal.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.signal.clone()
    }
}

/// One member of the worker pool.
pub struct Worker<T: RequestTransport> {
    pub id: usize,
    pub transport: Arc<T>,
    pub backlog: Backlog,
    pub aggregator: Arc<LatencyAggregator>,
    pub completion: Arc<Completion>,
    pub failure_policy: FailurePolicy,
    pub progress: Progress,
}

impl<T: RequestTransport> Worker<T> {
    /// Pulls requests until the run completes. Returns the number handled.
    ///
    /// Under `FailFast` the first transport error ends the run and is
    /// returned; the failed request is not counted as completed.
    pub async fn run(self) -> Result<usize, TransportError> {
        let signal = self.completion.token();
        let mut handled = 0;

        loop {
            let request = tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                request = self.backlog.pop() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let in_flight = Metrics::record_request_sent();
            let outcome = self.transport.send(&request).await;
            drop(in_flight);
            match outcome {
                Ok(sample) => {
                    Metrics::record_success(
                        sample.latency,
                        sample.prompt_len as u64,
                        sample.output_len as u64,
                    );
                    self.aggregator.record(sample);
                }
                Err(error) => {
                    Metrics::record_failure(&error);
                    match self.failure_policy {
                        FailurePolicy::FailFast => {
                            warn!("Worker {} request failed, aborting run: {}", self.id, error);
                            self.completion.abort();
                            return Err(error);
                        }
                        FailurePolicy::Continue => {
                            warn!("Worker {} request failed: {}", self.id, error);
                            self.aggregator.record_failure(FailedRequest::new(
                                request.prompt_len,
                                request.output_len,
                                &error,
                            ));
                        }
                    }
                }
            }

            handled += 1;
            let left = self.completion.complete_one();
            Metrics::record_remaining(left);
            self.progress.update(left);
        }

        debug!("Worker {} exiting after {} requests", self.id, handled);
        Ok(handled)
    }
}
