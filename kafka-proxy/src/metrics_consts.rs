// ==== Consumption engine ====
/// Histogram for the duration of a single broker poll
pub const POLL_DURATION_HISTOGRAM: &str = "kafka_proxy_poll_duration_seconds";

/// Counter for records fetched from the broker
pub const RECORDS_RECEIVED_COUNTER: &str = "kafka_proxy_records_received_total";

/// Counter for broker fetch errors, labelled with `kind` (topic_missing/transient)
pub const FETCH_ERRORS_COUNTER: &str = "kafka_proxy_fetch_errors_total";

/// Counter for listener or strategy failures
pub const DISPATCH_ERRORS_COUNTER: &str = "kafka_proxy_dispatch_errors_total";

/// Counter for records rejected by the key/value serializers
pub const POISON_PILL_COUNTER: &str = "kafka_proxy_poison_pills_total";

/// Counter for offset commits issued, one per partition
pub const COMMITS_COUNTER: &str = "kafka_proxy_commits_total";

/// Counter for commits the broker reported as failed
pub const COMMIT_FAILURES_COUNTER: &str = "kafka_proxy_commit_failures_total";

/// Counter for poll loop restarts after a panic
pub const POLL_LOOP_RESTARTS_COUNTER: &str = "kafka_proxy_poll_loop_restarts_total";

/// Gauge for partitions with a live cursor
pub const ASSIGNED_PARTITIONS_GAUGE: &str = "kafka_proxy_assigned_partitions";

// ==== Relay ====
/// Counter for tickets sent to a remote client, including redeliveries
pub const TICKETS_DISPATCHED_COUNTER: &str = "kafka_proxy_tickets_dispatched_total";

/// Counter for tickets acknowledged by a remote client
pub const TICKETS_ACKED_COUNTER: &str = "kafka_proxy_tickets_acked_total";

/// Counter for acks refused, labelled with `reason` (unknown_ticket/not_delivered)
pub const ACKS_REJECTED_COUNTER: &str = "kafka_proxy_acks_rejected_total";

/// Counter for tickets requeued, labelled with `reason`
pub const TICKETS_REDISPATCHED_COUNTER: &str = "kafka_proxy_tickets_redispatched_total";

/// Gauge for tickets not yet acknowledged
pub const TICKETS_IN_FLIGHT_GAUGE: &str = "kafka_proxy_tickets_in_flight";

/// Gauge for remote connections registered with the relay
pub const RELAY_CONNECTIONS_GAUGE: &str = "kafka_proxy_relay_connections";

/// Histogram for time between first dispatch and acknowledgment
pub const ACK_LATENCY_HISTOGRAM: &str = "kafka_proxy_ack_latency_seconds";

// ==== Dead letters ====
/// Counter for records handed to the dead-letter sink
pub const DEAD_LETTERED_COUNTER: &str = "kafka_proxy_dead_lettered_total";

/// Counter for dead letters published to Kafka (with status label: success/failure)
pub const DEAD_LETTER_PUBLISHED_COUNTER: &str = "kafka_proxy_dead_letter_published_total";
