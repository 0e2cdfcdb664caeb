// Counters for the payment flow.
// Emitted as debug events on the `metrics` target so any subscriber can pick them up.

#[macro_export]
macro_rules! gateway_counter_inc {
    ($name:expr $(, $key:expr => $val:expr )* $(,)?) => {{
        let labels: Vec<(&str, String)> = vec![$(($key, ($val).to_string())),*];
        tracing::debug!(target: "metrics", counter = $name, labels = ?labels, "counter incremented");
    }};
}
