//! The reconciling poll loop.
//!
//! After enumerating interfaces once, the poller sweeps every
//! (metric, interface) pair sequentially, metric outer and interface inner,
//! and feeds each observation through [`TrackedState::apply`]. The resulting
//! delta is added to the sink. Sweeps are separated by a fixed idle delay that
//! does not account for the duration of the sweep itself.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::{Clock, RetryError};
use crate::client::{FetchError, INVALID_INTERFACE_BODY, ResilientFetcher, Transport};
use crate::collector::{CounterLabels, CounterSink};
use crate::enumerator::{EnumerationError, EnumerationPolicy, InterfaceId, enumerate_interfaces};
use crate::metrics::{TrackedMetric, extract_counter};
use crate::reconcile::{Outcome, TrackedState};

/// Errors that stop the poller.
#[derive(Debug, Error)]
pub enum PollerError {
    /// A response body could not be read; the stream is considered broken.
    #[error("Unrecoverable upstream read error: {0}")]
    Fatal(FetchError),
    #[error("Interface enumeration failed: {0}")]
    Enumeration(#[from] EnumerationError),
}

/// Provides the `hostname` label value.
pub trait HostnameSource: Send + Sync {
    fn hostname(&self) -> io::Result<String>;
}

/// Resolves the local hostname on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHostname;

impl HostnameSource for SystemHostname {
    fn hostname(&self) -> io::Result<String> {
        hostname::get()?
            .into_string()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "hostname is not valid UTF-8"))
    }
}

/// Always reports the same hostname.
#[derive(Debug, Clone)]
pub struct FixedHostname(pub String);

impl HostnameSource for FixedHostname {
    fn hostname(&self) -> io::Result<String> {
        Ok(self.0.clone())
    }
}

/// Outcome counts of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Observations applied to the tracked state.
    pub updated: u64,
    /// Pairs skipped for this cycle (invalid payload, hostname failure).
    pub skipped: u64,
    /// Pairs whose fetch failed after all retries.
    pub failed: u64,
    /// Upstream counter resets detected.
    pub resets: u64,
}

/// Poller tuning.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub metrics: Vec<TrackedMetric>,
    pub idle_delay: Duration,
    pub enumeration_policy: EnumerationPolicy,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            metrics: TrackedMetric::ALL.to_vec(),
            idle_delay: Duration::from_secs(2),
            enumeration_policy: EnumerationPolicy::default(),
        }
    }
}

/// Polls ntopng and republishes reconciled deltas.
pub struct ReconcilingPoller<T, C, S> {
    fetcher: ResilientFetcher<T, C>,
    sink: S,
    hostname: Box<dyn HostnameSource>,
    settings: PollerSettings,
    interfaces: Vec<InterfaceId>,
    state: TrackedState,
}

impl<T, C, S> ReconcilingPoller<T, C, S>
where
    T: Transport,
    C: Clock,
    S: CounterSink,
{
    pub fn new(
        fetcher: ResilientFetcher<T, C>,
        sink: S,
        hostname: Box<dyn HostnameSource>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            fetcher,
            sink,
            hostname,
            settings,
            interfaces: Vec::new(),
            state: TrackedState::default(),
        }
    }

    /// Interfaces being polled.
    pub fn interfaces(&self) -> &[InterfaceId] {
        &self.interfaces
    }

    pub fn state(&self) -> &TrackedState {
        &self.state
    }

    /// Enumerate interfaces and allocate tracked state.
    ///
    /// With [`EnumerationPolicy::Degrade`] an enumeration failure leaves the
    /// poller running with no interfaces.
    pub async fn initialize(&mut self) -> Result<(), PollerError> {
        let interfaces = match enumerate_interfaces(&self.fetcher).await {
            Ok(interfaces) => interfaces,
            Err(EnumerationError::Fetch(RetryError::Aborted(e @ FetchError::Body { .. }))) => {
                return Err(PollerError::Fatal(e));
            }
            Err(e) => match self.settings.enumeration_policy {
                EnumerationPolicy::FailFast => return Err(e.into()),
                EnumerationPolicy::Degrade => {
                    error!(
                        error = %e,
                        "Interface enumeration failed, continuing without interfaces"
                    );
                    Vec::new()
                }
            },
        };

        self.start_with(interfaces);
        Ok(())
    }

    /// Allocate tracked state for `interfaces`, every value starting at zero.
    pub fn start_with(&mut self, interfaces: Vec<InterfaceId>) {
        self.state = TrackedState::new(&self.settings.metrics, &interfaces);
        self.sink.record_initialized(interfaces.len());
        self.interfaces = interfaces;

        info!(
            interfaces = self.interfaces.len(),
            metrics = self.settings.metrics.len(),
            tracked = self.state.len(),
            "Tracked state initialized"
        );
    }

    /// Run one sweep over all (metric, interface) pairs.
    pub async fn poll_cycle(&mut self) -> Result<CycleReport, PollerError> {
        let mut report = CycleReport::default();
        let pairs: Vec<(TrackedMetric, InterfaceId)> = self
            .settings
            .metrics
            .iter()
            .flat_map(|m| self.interfaces.iter().map(move |i| (*m, *i)))
            .collect();

        for (metric, interface) in pairs {
            self.poll_item(metric, interface, &mut report).await?;
        }

        Ok(report)
    }

    async fn poll_item(
        &mut self,
        metric: TrackedMetric,
        interface: InterfaceId,
        report: &mut CycleReport,
    ) -> Result<(), PollerError> {
        let body = match self.fetcher.fetch_interface_data(interface).await {
            Ok(body) => body,
            Err(RetryError::Aborted(e @ FetchError::Body { .. })) => {
                return Err(PollerError::Fatal(e));
            }
            Err(e) => {
                warn!(
                    metric = %metric,
                    interface_id = %interface,
                    error = %e,
                    "Failed to query ntopng for interface data"
                );
                report.failed += 1;
                return Ok(());
            }
        };

        if body == INVALID_INTERFACE_BODY {
            warn!(metric = %metric, interface_id = %interface, "ntopng rejected interface, skipping");
            report.skipped += 1;
            return Ok(());
        }

        let hostname = match self.hostname.hostname() {
            Ok(hostname) => hostname,
            Err(e) => {
                warn!(error = %e, "Unable to resolve hostname, dropping update");
                report.skipped += 1;
                return Ok(());
            }
        };

        let observed = match extract_counter(&body, metric) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    metric = %metric,
                    interface_id = %interface,
                    error = %e,
                    "Unusable interface data, skipping"
                );
                report.skipped += 1;
                return Ok(());
            }
        };

        let Some(reconciled) = self.state.apply(metric, interface, observed) else {
            warn!(metric = %metric, interface_id = %interface, "Pair is not tracked");
            report.skipped += 1;
            return Ok(());
        };

        if reconciled.outcome == Outcome::Reset {
            info!(
                metric = %metric,
                interface_id = %interface,
                observed,
                "Upstream counter reset detected"
            );
            report.resets += 1;
        }

        let labels = CounterLabels::new(hostname, interface);
        self.sink.add(metric, &labels, reconciled.delta);
        report.updated += 1;

        Ok(())
    }

    /// Initialize, then poll until `shutdown` flips to `true`.
    ///
    /// Shutdown is only observed between cycles; a cycle in progress runs to
    /// completion. During interface enumeration it is observed immediately and
    /// the pending request, including any retry wait, is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PollerError> {
        if *shutdown.borrow() {
            return Ok(());
        }

        tokio::select! {
            result = self.initialize() => result?,
            _ = shutdown_requested(&mut shutdown) => {
                info!("Shutdown requested during interface enumeration");
                return Ok(());
            }
        }

        info!(
            idle_delay_secs = self.settings.idle_delay.as_secs_f64(),
            "Starting poll loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = self.fetcher.clock().sleep(self.settings.idle_delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            let report = self.poll_cycle().await?;
            self.sink.record_cycle(&report);
            debug!(
                updated = report.updated,
                skipped = report.skipped,
                failed = report.failed,
                resets = report.resets,
                "Poll cycle complete"
            );
        }

        info!("Poller stopped");
        Ok(())
    }
}

/// Resolves once the flag is `true` or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
