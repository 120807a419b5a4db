//! SQLite schema definitions
//!
//! The relational store is the durable work queue: every pipeline stage
//! claims rows here via conditional updates, so the schema carries
//! per-task status/attempts/next_run_at columns on each queue table.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema SQL
pub const SCHEMA: &str = r#"
-- =============================================================================
-- Infrastructure: Schema version tracking
-- =============================================================================
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    execution_time_ms INTEGER,
    success INTEGER NOT NULL DEFAULT 1
);

-- =============================================================================
-- 1. Screenshots (captured frames; VLM + OCR work queues)
-- =============================================================================
CREATE TABLE IF NOT EXISTS screenshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    source_key TEXT NOT NULL,
    phash INTEGER NOT NULL,
    file_path TEXT,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    bytes INTEGER NOT NULL,
    mime TEXT NOT NULL,
    app_hint TEXT,
    window_title TEXT,
    storage_state TEXT NOT NULL DEFAULT 'ephemeral'
        CHECK(storage_state IN ('ephemeral', 'deleted')),
    vlm_status TEXT NOT NULL DEFAULT 'pending'
        CHECK(vlm_status IN ('pending', 'running', 'succeeded', 'failed', 'failed_permanent')),
    vlm_attempts INTEGER NOT NULL DEFAULT 0,
    vlm_next_run_at INTEGER,
    ocr_status TEXT
        CHECK(ocr_status IS NULL OR ocr_status IN ('pending', 'running', 'succeeded', 'failed', 'failed_permanent')),
    ocr_attempts INTEGER NOT NULL DEFAULT 0,
    ocr_next_run_at INTEGER,
    ocr_region TEXT,
    ocr_lang TEXT,
    ocr_text TEXT,
    ui_text_snippets TEXT,
    enqueued_batch_id TEXT,
    retention_expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_screenshots_source_ts ON screenshots(source_key, ts_ms);
CREATE INDEX IF NOT EXISTS idx_screenshots_vlm_queue ON screenshots(vlm_status, vlm_next_run_at);
CREATE INDEX IF NOT EXISTS idx_screenshots_ocr_queue ON screenshots(ocr_status, ocr_next_run_at)
    WHERE ocr_status IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_screenshots_batch ON screenshots(enqueued_batch_id);
CREATE INDEX IF NOT EXISTS idx_screenshots_retention ON screenshots(retention_expires_at)
    WHERE retention_expires_at IS NOT NULL AND storage_state = 'ephemeral';

-- Full-text mirror over screenshot text. Maintained by the persistence
-- layer (rowid = screenshot id), rebuilt from screenshots on corruption.
CREATE VIRTUAL TABLE IF NOT EXISTS screenshots_fts USING fts5(
    ocr_text, ui_text_snippets, window_title
);

-- =============================================================================
-- 2. Batches (VLM work queue)
-- =============================================================================
CREATE TABLE IF NOT EXISTS batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT NOT NULL UNIQUE,
    source_key TEXT NOT NULL,
    screenshot_ids TEXT NOT NULL,
    ts_start INTEGER NOT NULL,
    ts_end INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK(status IN ('pending', 'running', 'succeeded', 'failed', 'failed_permanent')),
    attempts INTEGER NOT NULL DEFAULT 0,
    next_run_at INTEGER,
    history_pack TEXT,
    index_json TEXT,
    last_error TEXT,
    last_error_code TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_batches_queue ON batches(status, next_run_at);
CREATE INDEX IF NOT EXISTS idx_batches_source ON batches(source_key, ts_start);

-- =============================================================================
-- 3. Context Nodes (merge work queue; thread back-references)
-- =============================================================================
CREATE TABLE IF NOT EXISTS context_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT NOT NULL,
    kind TEXT NOT NULL
        CHECK(kind IN ('event', 'knowledge', 'state', 'procedure', 'plan')),
    thread_id TEXT,
    event_time INTEGER NOT NULL,
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    keywords TEXT,
    entities TEXT,
    knowledge_payload TEXT,
    state_payload TEXT,
    action_items TEXT,
    importance REAL NOT NULL DEFAULT 0.5,
    confidence REAL NOT NULL DEFAULT 0.5,
    screenshot_ids TEXT,
    merge_status TEXT NOT NULL DEFAULT 'pending'
        CHECK(merge_status IN ('pending', 'running', 'succeeded', 'failed', 'failed_permanent')),
    merge_attempts INTEGER NOT NULL DEFAULT 0,
    merge_next_run_at INTEGER,
    merged_from_ids TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_thread_time ON context_nodes(thread_id, event_time);
CREATE INDEX IF NOT EXISTS idx_nodes_batch ON context_nodes(batch_id);
CREATE INDEX IF NOT EXISTS idx_nodes_event_time ON context_nodes(event_time);
CREATE INDEX IF NOT EXISTS idx_nodes_merge_queue ON context_nodes(merge_status, merge_next_run_at);
CREATE INDEX IF NOT EXISTS idx_nodes_unassigned ON context_nodes(batch_id)
    WHERE thread_id IS NULL;

-- =============================================================================
-- 4. Vector Documents (embedding + index work queues)
-- =============================================================================
CREATE TABLE IF NOT EXISTS vector_documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vector_id TEXT NOT NULL UNIQUE,
    ref_id INTEGER NOT NULL REFERENCES context_nodes(id),
    doc_type TEXT NOT NULL DEFAULT 'node',
    text_content TEXT NOT NULL,
    text_hash TEXT NOT NULL,
    embedding BLOB,
    meta_payload TEXT,
    embedding_status TEXT NOT NULL DEFAULT 'pending'
        CHECK(embedding_status IN ('pending', 'running', 'succeeded', 'failed', 'failed_permanent')),
    embedding_attempts INTEGER NOT NULL DEFAULT 0,
    embedding_next_run_at INTEGER,
    index_status TEXT NOT NULL DEFAULT 'pending'
        CHECK(index_status IN ('pending', 'running', 'succeeded', 'failed', 'failed_permanent')),
    index_attempts INTEGER NOT NULL DEFAULT 0,
    index_next_run_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vector_docs_embedding_queue
    ON vector_documents(embedding_status, embedding_next_run_at);
CREATE INDEX IF NOT EXISTS idx_vector_docs_index_queue
    ON vector_documents(index_status, index_next_run_at);
CREATE INDEX IF NOT EXISTS idx_vector_docs_ref ON vector_documents(ref_id);

-- =============================================================================
-- 5. Threads
-- =============================================================================
CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    summary TEXT,
    current_phase TEXT,
    current_focus TEXT,
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'inactive')),
    start_time INTEGER NOT NULL,
    last_active_at INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    node_count INTEGER NOT NULL DEFAULT 0,
    apps TEXT,
    main_project TEXT,
    key_entities TEXT,
    milestones TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_threads_active ON threads(status, last_active_at);

-- =============================================================================
-- 6. Activity Summaries (per-window work queue)
-- =============================================================================
CREATE TABLE IF NOT EXISTS activity_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    title TEXT,
    summary TEXT,
    highlights TEXT,
    stats TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK(status IN ('pending', 'running', 'succeeded', 'failed', 'failed_permanent', 'no_data')),
    attempts INTEGER NOT NULL DEFAULT 0,
    next_run_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(window_start, window_end)
);

CREATE INDEX IF NOT EXISTS idx_summaries_queue ON activity_summaries(status, next_run_at);
CREATE INDEX IF NOT EXISTS idx_summaries_window ON activity_summaries(window_start);

-- =============================================================================
-- 7. Activity Events (details work queue; event_key idempotency)
-- =============================================================================
CREATE TABLE IF NOT EXISTS activity_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_key TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    kind TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    is_long INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.5,
    importance REAL NOT NULL DEFAULT 0.5,
    thread_id TEXT,
    summary_id INTEGER,
    node_ids TEXT NOT NULL DEFAULT '[]',
    details_status TEXT
        CHECK(details_status IS NULL OR details_status IN ('pending', 'running', 'succeeded', 'failed', 'failed_permanent')),
    details_attempts INTEGER NOT NULL DEFAULT 0,
    details_next_run_at INTEGER,
    details_text TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_span ON activity_events(start_ts, end_ts);
CREATE INDEX IF NOT EXISTS idx_events_thread ON activity_events(thread_id)
    WHERE thread_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_events_long ON activity_events(is_long) WHERE is_long = 1;

-- =============================================================================
-- 8. Usage Events (append-only)
-- =============================================================================
CREATE TABLE IF NOT EXISTS usage_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    at_ms INTEGER NOT NULL,
    capability TEXT NOT NULL,
    operation TEXT NOT NULL,
    model TEXT NOT NULL,
    provider TEXT,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    error_code TEXT
);

CREATE INDEX IF NOT EXISTS idx_usage_at ON usage_events(at_ms);
CREATE INDEX IF NOT EXISTS idx_usage_capability ON usage_events(capability, at_ms);

-- =============================================================================
-- 9. Entity Mentions
-- =============================================================================
CREATE TABLE IF NOT EXISTS entity_mentions (
    entity TEXT NOT NULL,
    node_id INTEGER NOT NULL,
    at_ms INTEGER NOT NULL,
    PRIMARY KEY (entity, node_id)
);

CREATE INDEX IF NOT EXISTS idx_mentions_time ON entity_mentions(at_ms);

-- =============================================================================
-- 10. Settings (singleton)
-- =============================================================================
CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    pinned_thread_id TEXT,
    capture_enabled INTEGER NOT NULL DEFAULT 1,
    interval_multiplier REAL NOT NULL DEFAULT 1.0,
    phash_threshold INTEGER NOT NULL DEFAULT 4,
    updated_at INTEGER NOT NULL
);

INSERT OR IGNORE INTO settings (id, capture_enabled, interval_multiplier, phash_threshold, updated_at)
VALUES (1, 1, 1.0, 4, 0);
"#;
