pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# OPTAIL CONFIGURATION
# =============================================================================
# optail tails a document store's operation log and delivers insert, update,
# delete and drop events, optionally after a one-time snapshot ("direct read")
# of existing collections. Every setting below is optional; the values shown
# are the defaults unless noted.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/optail/config.yml
#   3. /etc/optail/config.yml

# =============================================================================
# STORE
# =============================================================================
# Root of the JSON-lines store: <path>/oplog.jsonl plus <path>/<db>/<coll>.jsonl

store:
  path: ./data

# =============================================================================
# RESUME
# =============================================================================
# Explicit resume point '<seconds>:<ordinal>'. Takes precedence over the
# checkpoint. Without either, tailing starts at the end of the log and history
# written before start is only seen through direct_read.

# resume_position: "1700000000:1"

checkpoint:
  enabled: false
  path: optail.checkpoint.json
  interval: 5s

# =============================================================================
# FILTER
# =============================================================================
# Regex patterns matched against 'database.collection'. Empty include list
# means everything; exclude wins.

filter:
  include: []
  exclude: []

# =============================================================================
# DIRECT READ
# =============================================================================
# Collections to snapshot at start. Each is split across
# readers_per_collection concurrent readers. limit caps the documents read by
# one reader; 0 reads everything.

direct_read:
  namespaces: []
  readers_per_collection: 10
  batch_size: 500
  limit: 0

# =============================================================================
# PIPELINE
# =============================================================================

buffer:
  # Operations per fetch batch
  size: 50
  # A batch is flushed at the latest this long after its first operation
  max_latency: 750ms

# Capacity of each queue between stages; full queues slow the log reader down
channel_size: 20

# Concurrent document fetch workers
workers: 5

# 'strict' delivers log events in log order, 'unordered' as soon as ready
ordering: strict

# true delivers update deltas from the log instead of fetching full documents
update_data_as_delta: false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, validate_config};

    #[test]
    fn test_starter_config_is_valid() {
        let config = parse_config(&generate_starter_config()).unwrap();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.workers, 5);
        assert!(!config.checkpoint.enabled);
    }
}
