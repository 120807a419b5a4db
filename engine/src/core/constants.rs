// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display and platform directories)
pub const APP_NAME: &str = "Glimpse";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "glimpse";

/// Unix-style dotfile folder name
pub const APP_DOT_FOLDER: &str = ".glimpse";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "glimpse.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "GLIMPSE_CONFIG";

/// Environment variable for debug mode
pub const ENV_DEBUG: &str = "GLIMPSE_DEBUG";

// =============================================================================
// Environment Variables - Server
// =============================================================================

/// Environment variable for API host
pub const ENV_HOST: &str = "GLIMPSE_HOST";

/// Environment variable for API port
pub const ENV_PORT: &str = "GLIMPSE_PORT";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "GLIMPSE_LOG";

/// Environment variable to override data directory
pub const ENV_DATA_DIR: &str = "GLIMPSE_DATA_DIR";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default API host (loopback only; this is a local daemon)
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default API port
pub const DEFAULT_PORT: u16 = 5717;

// =============================================================================
// Monitoring Endpoint
// =============================================================================

/// Environment variable enabling the monitoring endpoint at startup
pub const ENV_MONITORING_ENABLED: &str = "GLIMPSE_MONITORING_ENABLED";

/// First port probed for the monitoring listener
pub const MONITORING_BASE_PORT: u16 = 5900;

/// How many consecutive ports to probe before giving up
pub const MONITORING_PORT_PROBE_LIMIT: u16 = 20;

// =============================================================================
// SQLite Database
// =============================================================================

/// SQLite database filename
pub const SQLITE_DB_FILENAME: &str = "glimpse.db";

/// SQLite connection pool max connections
pub const SQLITE_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in seconds
pub const SQLITE_BUSY_TIMEOUT_SECS: u64 = 30;

/// SQLite cache size (negative = KB, so -64000 = 64MB)
pub const SQLITE_CACHE_SIZE: &str = "-64000";

/// SQLite WAL auto-checkpoint threshold (pages)
pub const SQLITE_WAL_AUTOCHECKPOINT: &str = "1000";

/// WAL checkpoint interval in seconds (5 minutes)
pub const SQLITE_CHECKPOINT_INTERVAL_SECS: u64 = 300;

// =============================================================================
// Capture
// =============================================================================

/// Environment variable for base capture interval in milliseconds
pub const ENV_CAPTURE_INTERVAL_MS: &str = "GLIMPSE_CAPTURE_INTERVAL_MS";

/// Environment variable for the perceptual-hash accept threshold
pub const ENV_PHASH_THRESHOLD: &str = "GLIMPSE_PHASH_THRESHOLD";

/// Default base capture interval in milliseconds
pub const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 4_000;

/// Default Hamming-distance threshold: a frame is accepted only when its
/// distance to every recent hash of the same source exceeds this value
pub const DEFAULT_PHASH_THRESHOLD: u32 = 4;

/// Recent perceptual hashes retained per source for dedup
pub const PHASH_WINDOW_SIZE: usize = 8;

/// Default retention for captured files in milliseconds (24 hours)
pub const DEFAULT_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

/// Retention sweep interval in seconds
pub const RETENTION_SWEEP_INTERVAL_SECS: u64 = 300;

// =============================================================================
// Batch Formation
// =============================================================================

/// Maximum screenshots per batch
pub const BATCH_MAX_SHOTS: usize = 6;

/// Maximum age of the oldest pending screenshot before its batch is closed (ms)
pub const BATCH_MAX_AGE_MS: i64 = 60_000;

/// Screenshots per VLM call; larger batches split into shards
pub const SHARD_MAX_SHOTS: usize = 4;

/// Orphan sweep grace on top of the batch age limit (ms)
pub const ORPHAN_GRACE_MS: i64 = 5_000;

/// Threads included in a batch history pack
pub const HISTORY_PACK_THREADS: usize = 5;

/// Recent nodes per thread included in a batch history pack
pub const HISTORY_PACK_NODES_PER_THREAD: usize = 5;

// =============================================================================
// Reconcile Loop
// =============================================================================

/// Maximum attempts before a row becomes failed_permanent
pub const MAX_ATTEMPTS: i64 = 5;

/// Retry backoff schedule, indexed by attempts already consumed
pub const BACKOFF_SCHEDULE_MS: [i64; 5] = [1_000, 5_000, 30_000, 120_000, 600_000];

/// Uniform jitter added to every backoff delay (ms)
pub const BACKOFF_JITTER_MS: i64 = 500;

/// Rows stuck in `running` longer than this are reset to pending (ms)
pub const STALE_RUNNING_THRESHOLD_MS: i64 = 120_000;

/// Upper bound on the reconcile sleep when no work is due (ms)
pub const IDLE_SCAN_INTERVAL_MS: i64 = 30_000;

/// Scan limit clamp: lower bound
pub const SCAN_LIMIT_MIN: i64 = 20;

/// Scan limit clamp: upper bound
pub const SCAN_LIMIT_MAX: i64 = 200;

// =============================================================================
// AI Runtime
// =============================================================================

/// Initial permit counts per capability (vlm, text, embedding)
pub const AI_INITIAL_LIMITS: [u32; 3] = [2, 3, 4];

/// Maximum permit counts per capability (vlm, text, embedding)
pub const AI_MAX_LIMITS: [u32; 3] = [4, 8, 8];

/// Consecutive successes required for an additive permit increase
pub const AIMD_SUCCESS_STREAK: u32 = 10;

/// Failure window examined by the circuit breaker (seconds)
pub const BREAKER_FAILURE_WINDOW_SECS: u64 = 60;

/// Failures within the window that open the breaker
pub const BREAKER_FAILURE_THRESHOLD: usize = 5;

/// Cooldown before an open breaker admits a half-open probe (seconds)
pub const BREAKER_COOLDOWN_SECS: u64 = 30;

/// Permit waits longer than this emit a semaphore-wait alert (ms)
pub const SEMAPHORE_WAIT_ALERT_MS: u128 = 5_000;

/// VLM request wall-clock timeout (ms)
pub const VLM_TIMEOUT_MS: u64 = 90_000;

/// Text-LLM request wall-clock timeout (ms)
pub const TEXT_TIMEOUT_MS: u64 = 60_000;

/// Embedding request wall-clock timeout (ms)
pub const EMBEDDING_TIMEOUT_MS: u64 = 30_000;

// =============================================================================
// Request Traces
// =============================================================================

/// Bounded trace buffer capacity
pub const TRACE_BUFFER_CAPACITY: usize = 200;

/// Hard cap on stored response previews (12 KB)
pub const TRACE_RESPONSE_PREVIEW_MAX: usize = 12 * 1024;

/// Hard cap on stored error previews (1 KB)
pub const TRACE_ERROR_PREVIEW_MAX: usize = 1024;

// =============================================================================
// VLM Structured Output
// =============================================================================

/// Maximum segments per batch result
pub const VLM_SEGMENTS_MAX: usize = 4;

/// Maximum derived items per kind per segment
pub const VLM_DERIVED_PER_KIND_MAX: usize = 2;

/// Maximum keywords per segment
pub const VLM_KEYWORDS_MAX: usize = 10;

/// Maximum canonical entities per batch result
pub const VLM_ENTITIES_MAX: usize = 20;

/// Maximum stored OCR text per screenshot (chars)
pub const VLM_OCR_TEXT_MAX: usize = 8_000;

/// Maximum UI text snippets per screenshot
pub const VLM_UI_SNIPPETS_MAX: usize = 20;

/// Minimum app-guess confidence before `app_hint` is written
pub const APP_HINT_MIN_CONFIDENCE: f64 = 0.7;

// =============================================================================
// OCR
// =============================================================================

/// Environment variable enabling the local OCR stage
pub const ENV_OCR_ENABLED: &str = "GLIMPSE_OCR_ENABLED";

/// Languages the local OCR engine supports
pub const OCR_SUPPORTED_LANGUAGES: &[&str] = &["ja", "zh", "ko"];

// =============================================================================
// Vector Index
// =============================================================================

/// ANN index binary filename
pub const VECTOR_INDEX_FILENAME: &str = "glimpse.ann";

/// Quiescence interval after the last write before a dirty index flushes (ms)
pub const VECTOR_FLUSH_QUIESCENCE_MS: u64 = 3_000;

/// Poll interval of the flush task (ms)
pub const VECTOR_FLUSH_POLL_MS: u64 = 1_000;

// =============================================================================
// Activity Timeline
// =============================================================================

/// Activity window length (20 minutes)
pub const ACTIVITY_WINDOW_MS: i64 = 20 * 60 * 1000;

/// Duration at which an event counts as long (25 minutes)
pub const LONG_EVENT_THRESHOLD_MS: i64 = 25 * 60 * 1000;

/// Most recent nodes attached to a synthetic long event
pub const LONG_EVENT_NODE_CAP: usize = 200;

/// Debounce interval for timeline change notifications (ms)
pub const TIMELINE_DEBOUNCE_MS: u64 = 800;

/// Item cap when gathering nodes for event details
pub const DETAILS_NODE_CAP: usize = 120;

/// Serialized JSON char budget when gathering nodes for event details
pub const DETAILS_CHAR_BUDGET: usize = 16_000;

/// Window summary generation timeout (ms)
pub const SUMMARY_TIMEOUT_MS: u64 = 60_000;

/// Event details generation timeout (ms)
pub const DETAILS_TIMEOUT_MS: u64 = 60_000;

// =============================================================================
// Backpressure
// =============================================================================

/// Backlog poll interval in seconds
pub const BACKPRESSURE_POLL_SECS: u64 = 5;

/// Pending-batch counts entering warning / hot / critical
pub const BACKPRESSURE_ENTER: [i64; 3] = [20, 60, 120];

/// Pending-batch counts required to drop back out (hysteresis floors)
pub const BACKPRESSURE_EXIT: [i64; 3] = [10, 40, 90];

// =============================================================================
// Search
// =============================================================================

/// Keyword matches fetched per search
pub const SEARCH_KEYWORD_LIMIT: u32 = 30;

/// ANN neighbors fetched per search
pub const SEARCH_VECTOR_LIMIT: usize = 30;

/// Final result cap after neighbor expansion
pub const SEARCH_RESULT_CAP: usize = 50;

// =============================================================================
// Shutdown
// =============================================================================

/// Graceful shutdown timeout in seconds
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 60;
