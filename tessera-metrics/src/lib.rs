#![deny(missing_docs)]
//! Metrics recorded by Tessera stream queues and readers.
//!
//! Every queue and reader records into a [`TesseraMetrics`] registry under the names in
//! [`names`]. Hosts read them back through [`TesseraMetrics::registry`].

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use witchcraft_metrics::MetricRegistry;
// re-export exposed metric types
pub use witchcraft_metrics::{Counter, Histogram, MetricId, Timer};

/// Names of the metrics Tessera records.
pub mod names {
    /// Blocks a stream worker read and published.
    pub const STREAM_PUBLISHED: &str = "tessera.stream.blocks.published";
    /// Blocks a stream worker failed to read.
    pub const STREAM_FAILED: &str = "tessera.stream.blocks.failed";
    /// Blocks handed to the consumer.
    pub const STREAM_DELIVERED: &str = "tessera.stream.blocks.delivered";
    /// Blocks that arrived ahead of their turn in an ordered stream.
    pub const STREAM_REORDERED: &str = "tessera.stream.blocks.reordered";
    /// Blocks parked in the side table of an ordered stream, sampled on every arrival.
    pub const STREAM_REORDER_DEPTH: &str = "tessera.stream.reorder.depth";
    /// Time spent by a stream worker reading one block.
    pub const STREAM_BLOCK_READ: &str = "tessera.stream.block.read";
    /// Time the consumer spent waiting for the next block.
    pub const STREAM_ACQUIRE_READY: &str = "tessera.stream.acquire_ready";
    /// Requests scheduled on a reader.
    pub const READER_SUBMITTED: &str = "tessera.reader.requests.submitted";
    /// Requests a reader served.
    pub const READER_RESOLVED: &str = "tessera.reader.requests.resolved";
    /// Requests that failed.
    pub const READER_FAILED: &str = "tessera.reader.requests.failed";
    /// Bytes written into stages.
    pub const READER_BYTES: &str = "tessera.reader.bytes";
    /// Rows per served request.
    pub const READER_REQUEST_ROWS: &str = "tessera.reader.request.rows";
    /// Time a reader worker spent serving one request.
    pub const READER_SERVICE: &str = "tessera.reader.request.service";
}

/// A metric registry shared by stream queues and readers.
///
/// Clones share the same registry, so one instance can be handed to several queues and
/// readers and read back in one place.
#[derive(Clone, Default)]
pub struct TesseraMetrics {
    registry: Arc<MetricRegistry>,
}

impl Debug for TesseraMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TesseraMetrics")
            .field("metrics", &self.registry.metrics().iter().count())
            .finish()
    }
}

impl TesseraMetrics {
    /// Records into an existing registry, for hosts that already export one.
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self { registry }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    /// Returns the counter with the specified ID, creating a default instance if absent.
    ///
    /// # Panics
    ///
    /// Panics if a metric is registered with the ID that is not a counter.
    pub fn counter<T>(&self, id: T) -> Arc<Counter>
    where
        T: Into<MetricId>,
    {
        self.registry.counter(id)
    }

    /// Returns the histogram with the specified ID, creating a default instance if absent.
    ///
    /// # Panics
    ///
    /// Panics if a metric is registered with the ID that is not a histogram.
    pub fn histogram<T>(&self, id: T) -> Arc<Histogram>
    where
        T: Into<MetricId>,
    {
        self.registry.histogram(id)
    }

    /// Returns the timer with the specified ID, creating a default instance if absent.
    ///
    /// # Panics
    ///
    /// Panics if a metric is registered with the ID that is not a timer.
    pub fn timer<T>(&self, id: T) -> Arc<Timer>
    where
        T: Into<MetricId>,
    {
        self.registry.timer(id)
    }

    /// The metrics a stream queue records.
    pub fn stream(&self) -> StreamMetrics {
        StreamMetrics {
            published: self.counter(names::STREAM_PUBLISHED),
            failed: self.counter(names::STREAM_FAILED),
            delivered: self.counter(names::STREAM_DELIVERED),
            reordered: self.counter(names::STREAM_REORDERED),
            reorder_depth: self.histogram(names::STREAM_REORDER_DEPTH),
            block_read: self.timer(names::STREAM_BLOCK_READ),
            acquire_ready: self.timer(names::STREAM_ACQUIRE_READY),
        }
    }

    /// The metrics a reader records.
    pub fn reader(&self) -> ReaderMetrics {
        ReaderMetrics {
            submitted: self.counter(names::READER_SUBMITTED),
            resolved: self.counter(names::READER_RESOLVED),
            failed: self.counter(names::READER_FAILED),
            bytes: self.counter(names::READER_BYTES),
            request_rows: self.histogram(names::READER_REQUEST_ROWS),
            service: self.timer(names::READER_SERVICE),
        }
    }
}

/// Handles to the metrics of one stream queue. See [`names`] for what each one counts.
#[derive(Clone)]
#[allow(missing_docs)]
pub struct StreamMetrics {
    pub published: Arc<Counter>,
    pub failed: Arc<Counter>,
    pub delivered: Arc<Counter>,
    pub reordered: Arc<Counter>,
    pub reorder_depth: Arc<Histogram>,
    pub block_read: Arc<Timer>,
    pub acquire_ready: Arc<Timer>,
}

/// Handles to the metrics of one reader. See [`names`] for what each one counts.
#[derive(Clone)]
#[allow(missing_docs)]
pub struct ReaderMetrics {
    pub submitted: Arc<Counter>,
    pub resolved: Arc<Counter>,
    pub failed: Arc<Counter>,
    pub bytes: Arc<Counter>,
    pub request_rows: Arc<Histogram>,
    pub service: Arc<Timer>,
}
