pub const MESSAGES_EMITTED: &str = "kafka_queue_messages_emitted_total";
pub const FETCH_ERRORS: &str = "kafka_queue_fetch_errors_total";
pub const MESSAGES_ACKED: &str = "kafka_queue_messages_acked_total";
pub const MESSAGES_NACKED: &str = "kafka_queue_messages_nacked_total";
pub const COMMIT_ERRORS: &str = "kafka_queue_commit_errors_total";
pub const RECORDS_PUBLISHED: &str = "kafka_queue_records_published_total";
pub const PUBLISH_ERRORS: &str = "kafka_queue_publish_errors_total";
pub const HANDLES_REPLACED: &str = "kafka_queue_handles_replaced_total";
pub const HANDLES_CLOSED: &str = "kafka_queue_handles_closed_total";
pub const REOPEN_ERRORS: &str = "kafka_queue_reader_reopen_errors_total";
