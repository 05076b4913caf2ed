use std::time::{Duration, Instant};

use ::metrics::{
    counter, decrement_gauge, describe_counter, describe_gauge, describe_histogram, gauge,
    histogram, increment_gauge, Unit,
};
use axum::{extract::Request, middleware::Next, response::Response};

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const MESSAGES_PRODUCED_TOTAL: &str = "kafka_messages_produced_total";
pub const PRODUCE_FAILURES_TOTAL: &str = "stream_relay_produce_failures_total";
pub const MESSAGES_CONSUMED_TOTAL: &str = "kafka_messages_consumed_total";
pub const MESSAGES_DROPPED_TOTAL: &str = "stream_relay_messages_dropped_total";
pub const BRIDGES_ACTIVE: &str = "stream_relay_bridges_active";
pub const BRIDGES_FINISHED_TOTAL: &str = "stream_relay_bridges_finished_total";
pub const SESSIONS_ACTIVE: &str = "stream_relay_sessions_active";
pub const PUSH_CONNECTIONS_TOTAL: &str = "stream_relay_push_connections_total";

/// Registers help text for every metric the relay emits. Call once after the
/// recorder is installed.
pub fn describe() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "HTTP requests by status and method");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "HTTP request latency by method"
    );
    describe_counter!(MESSAGES_PRODUCED_TOTAL, "Messages accepted by the bus");
    describe_counter!(PRODUCE_FAILURES_TOTAL, "Failed bus write attempts");
    describe_counter!(MESSAGES_CONSUMED_TOTAL, "Messages read from the bus");
    describe_counter!(
        MESSAGES_DROPPED_TOTAL,
        "Consumed messages discarded because no push target was connected"
    );
    describe_gauge!(BRIDGES_ACTIVE, "Bridge loops currently running");
    describe_counter!(BRIDGES_FINISHED_TOTAL, "Bridge loops finished by exit reason");
    describe_gauge!(SESSIONS_ACTIVE, "Streams holding bus resources");
    describe_counter!(PUSH_CONNECTIONS_TOTAL, "Push connections accepted");
}

pub fn record_http_request(method: &str, status: u16, elapsed: Duration) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        1,
        "status" => status.to_string(),
        "method" => method.to_string()
    );
    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        elapsed.as_secs_f64(),
        "method" => method.to_string()
    );
}

pub fn record_produced() {
    counter!(MESSAGES_PRODUCED_TOTAL, 1);
}

pub fn record_produce_failure() {
    counter!(PRODUCE_FAILURES_TOTAL, 1);
}

pub fn record_consumed() {
    counter!(MESSAGES_CONSUMED_TOTAL, 1);
}

pub fn record_dropped() {
    counter!(MESSAGES_DROPPED_TOTAL, 1);
}

pub fn record_push_connection() {
    counter!(PUSH_CONNECTIONS_TOTAL, 1);
}

pub fn set_active_sessions(count: usize) {
    gauge!(SESSIONS_ACTIVE, count as f64);
}

pub fn bridge_started() {
    increment_gauge!(BRIDGES_ACTIVE, 1.0);
}

pub fn bridge_stopped(reason: &'static str) {
    decrement_gauge!(BRIDGES_ACTIVE, 1.0);
    counter!(BRIDGES_FINISHED_TOTAL, 1, "reason" => reason);
}

/// Outermost middleware: counts every response, including rejections from
/// the auth and rate layers.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let started = Instant::now();
    let response = next.run(request).await;
    record_http_request(
        method.as_str(),
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}
