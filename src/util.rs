/// Milliseconds since the Unix epoch, used for every `created_at`/`started_at`
/// timestamp column across the schema.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
