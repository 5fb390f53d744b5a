//! Prometheus exporter for ntopng ZMQ interface counters.
//!
//! The exporter polls the ntopng REST API for the `zmqRecvStats` of every
//! interface and republishes them as monotonic Prometheus counters, absorbing
//! upstream counter resets and riding out upstream outages with bounded
//! exponential back-off.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  ntopng REST    │────>│     Poller      │────>│   HTTP Server   │
//! │  (retry/backoff)│     │  (reconcile)    │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! NTOPNG_API_URL=http://ntopng NTOPNG_PASSWORD=... nettel-exporter
//! nettel-exporter --config nettel.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod backoff;
pub mod client;
pub mod collector;
pub mod config;
pub mod enumerator;
pub mod http;
pub mod metrics;
pub mod poller;
pub mod reconcile;

pub use backoff::{Clock, RetryError, RetryPolicy, TokioClock, retry_with_backoff};
pub use client::{BasicCredential, HttpTransport, NtopngEndpoints, ResilientFetcher, Transport};
pub use collector::{CounterLabels, CounterSink, MetricCollector, SharedCollector};
pub use config::ExporterConfig;
pub use enumerator::{EnumerationPolicy, InterfaceId};
pub use http::HttpServer;
pub use metrics::TrackedMetric;
pub use poller::{CycleReport, PollerError, ReconcilingPoller};
pub use reconcile::{Outcome, Reconciled, TrackedState, reconcile};
