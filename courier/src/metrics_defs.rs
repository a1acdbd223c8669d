use shared::metrics_defs::{MetricDef, MetricType};

pub const RECORDS_INGESTED: MetricDef = MetricDef {
    name: "records.ingested",
    metric_type: MetricType::Counter,
    description: "Number of location records appended to the queue. Tagged with provenance.",
};

pub const RECORDS_PRUNED: MetricDef = MetricDef {
    name: "records.pruned",
    metric_type: MetricType::Counter,
    description: "Number of queued records removed by retention",
};

pub const QUEUE_LENGTH: MetricDef = MetricDef {
    name: "queue.length",
    metric_type: MetricType::Gauge,
    description: "Number of records currently queued",
};

pub const STORE_DEGRADED: MetricDef = MetricDef {
    name: "store.degraded",
    metric_type: MetricType::Counter,
    description: "Persistent store could not be opened and the in-memory store was used instead",
};

pub const STORE_WRITE_FAILED: MetricDef = MetricDef {
    name: "store.write_failed",
    metric_type: MetricType::Counter,
    description: "Number of failed attempts to append records to the store",
};

pub const FLUSH_ROUNDS: MetricDef = MetricDef {
    name: "flush.rounds",
    metric_type: MetricType::Counter,
    description: "Number of completed flush rounds. Tagged with outcome.",
};

pub const FLUSH_SKIPPED: MetricDef = MetricDef {
    name: "flush.skipped",
    metric_type: MetricType::Counter,
    description: "Number of flush evaluations that did not start a round. Tagged with reason.",
};

pub const FLUSH_DURATION: MetricDef = MetricDef {
    name: "flush.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a flush round in seconds",
};

pub const BATCH_SIZE: MetricDef = MetricDef {
    name: "flush.batch_size",
    metric_type: MetricType::Histogram,
    description: "Number of records acknowledged by an endpoint in one round",
};

pub const ENDPOINT_DELIVERY_FAILED: MetricDef = MetricDef {
    name: "endpoint.delivery_failed",
    metric_type: MetricType::Counter,
    description: "Number of batches an endpoint did not acknowledge",
};

pub const BACKGROUND_SLOT_EXPIRED: MetricDef = MetricDef {
    name: "background.slot_expired",
    metric_type: MetricType::Counter,
    description: "Number of flush rounds cut short by the host reclaiming the execution slot",
};

pub const ALL_METRICS: &[MetricDef] = &[
    RECORDS_INGESTED,
    RECORDS_PRUNED,
    QUEUE_LENGTH,
    STORE_DEGRADED,
    STORE_WRITE_FAILED,
    FLUSH_ROUNDS,
    FLUSH_SKIPPED,
    FLUSH_DURATION,
    BATCH_SIZE,
    ENDPOINT_DELIVERY_FAILED,
    BACKGROUND_SLOT_EXPIRED,
];
