use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex, MutexGuard,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ActionMetricKey {
    action: String,
    outcome: String,
}

#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    session_actions_total: Mutex<HashMap<ActionMetricKey, u64>>,
    realtime_frames_total: Mutex<HashMap<String, u64>>,
    realtime_errors_total: Mutex<HashMap<String, u64>>,
    row_changes_total: Mutex<HashMap<String, u64>>,
    realtime_connections: AtomicI64,
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_session_action(&self, action: &str, outcome: &str) {
        let key = ActionMetricKey {
            action: normalize_label(action),
            outcome: normalize_label(outcome),
        };
        increment_counter(&self.session_actions_total, &key, 1);
    }

    pub fn record_realtime_frame(&self, kind: &str, is_error: bool) {
        let label = normalize_label(kind);
        increment_counter(&self.realtime_frames_total, &label, 1);
        if is_error {
            increment_counter(&self.realtime_errors_total, &label, 1);
        }
    }

    pub fn record_row_change(&self, table: &str) {
        increment_counter(&self.row_changes_total, &normalize_label(table), 1);
    }

    pub fn realtime_connection_opened(&self) {
        self.realtime_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn realtime_connection_closed(&self) {
        self.realtime_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_endpoint_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_endpoint_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_endpoint_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_endpoint_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str(
            "# HELP relay_session_actions_total Session actions handled by action and outcome.\n",
        );
        output.push_str("# TYPE relay_session_actions_total counter\n");
        append_action_lines(&mut output, &self.session_actions_total);

        output.push_str("# HELP relay_realtime_frames_total Inbound realtime frames by kind.\n");
        output.push_str("# TYPE relay_realtime_frames_total counter\n");
        append_label_lines(&mut output, "relay_realtime_frames_total", "kind", &self.realtime_frames_total);

        output.push_str(
            "# HELP relay_realtime_errors_total Rejected inbound realtime frames by kind.\n",
        );
        output.push_str("# TYPE relay_realtime_errors_total counter\n");
        append_label_lines(&mut output, "relay_realtime_errors_total", "kind", &self.realtime_errors_total);

        output.push_str("# HELP relay_row_changes_total Row changes received from Postgres by table.\n");
        output.push_str("# TYPE relay_row_changes_total counter\n");
        append_label_lines(&mut output, "relay_row_changes_total", "table", &self.row_changes_total);

        output.push_str("# HELP relay_realtime_connections Open realtime WebSocket connections.\n");
        output.push_str("# TYPE relay_realtime_connections gauge\n");
        output.push_str(&format!(
            "relay_realtime_connections {}\n",
            self.realtime_connections.load(Ordering::SeqCst).max(0)
        ));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn lock<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn increment_counter<K>(map: &Mutex<HashMap<K, u64>>, key: &K, delta: u64)
where
    K: Clone + Eq + std::hash::Hash,
{
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_endpoint_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_action_lines(output: &mut String, map: &Mutex<HashMap<ActionMetricKey, u64>>) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| {
        left.action.cmp(&right.action).then_with(|| left.outcome.cmp(&right.outcome))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "relay_session_actions_total{{action=\"{}\",outcome=\"{}\"}} {value}\n",
            escape_label_value(&key.action),
            escape_label_value(&key.outcome),
        ));
    }
}

fn append_label_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
