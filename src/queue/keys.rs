//! Redis key naming shared with the worker runtime and the dashboard.

/// Set of known job queue names, read by the worker runtime for discovery.
pub const QUEUES_SET: &str = "queues";

/// Sorted set of delayed job envelopes scored by unix seconds.
pub const SCHEDULE_SET: &str = "schedule";

/// Global FIFO of outbound HTTP request envelopes.
pub const REQUEST_QUEUE: &str = "request_queue";

/// JSON snapshot of broker stats, read by the terminal dashboard.
pub const MONITORING_KEY: &str = "request_manager:monitoring";

/// Pub/sub channel carrying free-text broker log lines.
pub const LOGS_CHANNEL: &str = "request_manager:logs";

/// Name the broker uses as its own response-queue owner.
pub const BROKER_SOURCE: &str = "RequestManager";

/// List holding job envelopes for `queue`.
pub fn job_queue_key(queue: &str) -> String {
    format!("queue:{}", queue)
}

/// List holding response envelopes addressed to `owner`.
pub fn response_queue_key(owner: &str) -> String {
    format!("response_queue:{}", owner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(job_queue_key("validators"), "queue:validators");
        assert_eq!(
            response_queue_key("LedgerInfoDaemon"),
            "response_queue:LedgerInfoDaemon"
        );
        assert_eq!(response_queue_key(BROKER_SOURCE), "response_queue:RequestManager");
    }
}
