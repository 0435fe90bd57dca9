//! Queue and stream naming conventions.

/// Default consumer group name, one group per stream.
pub const DEFAULT_GROUP: &str = "main-group";

/// Suffix appended to a queue name to form its stream key.
pub const STREAM_SUFFIX: &str = ":stream";

/// Suffix appended to a queue name to form its dead-letter queue name.
pub const POISON_SUFFIX: &str = "-poison";

/// Stream key for a queue (`"{queue}:stream"`).
pub fn stream_key(queue: &str) -> String {
    format!("{queue}{STREAM_SUFFIX}")
}

/// Dead-letter queue name for a queue (`"{queue}-poison"`).
pub fn poison_queue(queue: &str) -> String {
    format!("{queue}{POISON_SUFFIX}")
}

/// Stream key of a queue's dead-letter queue (`"{queue}-poison:stream"`).
pub fn poison_stream_key(queue: &str) -> String {
    stream_key(&poison_queue(queue))
}

/// Whether a queue name refers to a dead-letter queue.
pub fn is_poison_queue(queue: &str) -> bool {
    queue.ends_with(POISON_SUFFIX)
}

/// Recover the queue name from a stream key, if it follows the convention.
pub fn queue_of_stream(stream: &str) -> Option<&str> {
    stream.strip_suffix(STREAM_SUFFIX)
}

/// Unique consumer identity for this process: `"{hostname}-{pid}"`.
///
/// Falls back to a UUID-based name when no hostname is available, the same
/// way ad-hoc consumers are named elsewhere.
pub fn consumer_name() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::now_v7()));
    format!("{host}-{}", std::process::id())
}
