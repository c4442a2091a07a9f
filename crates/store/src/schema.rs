//! DDL for the tables in spec §3, with the indexes spec §4.11 requires.
//! Columns use portable types (`TEXT`/`INTEGER`/`REAL`) so the same
//! statements apply unmodified to the SQLite dev/test backend and the
//! Postgres production backend via `sqlx::Any` — the teacher's own
//! `store` crate supports an analogous spread of backends (rocksdb,
//! foundationdb, sqlite, postgres, mysql) behind Cargo features; this
//! crate keeps that "pluggable backend" posture but through `sqlx`
//! rather than the teacher's bespoke KV write-batch layer (see
//! DESIGN.md for why).

pub const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL,
        access_token_ciphertext BLOB NOT NULL,
        refresh_token_ciphertext BLOB NOT NULL,
        expires_at TEXT NOT NULL,
        role TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        auth_expired INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS projects (
        id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        aliases_json TEXT NOT NULL DEFAULT '[]',
        address_json TEXT,
        job_numbers_json TEXT NOT NULL DEFAULT '[]',
        client_json TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL,
        email_count INTEGER NOT NULL DEFAULT 0,
        last_email_at TEXT,
        creation_confidence REAL NOT NULL DEFAULT 0,
        needs_review INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (user_id, id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_projects_user_name ON projects(user_id, name)",
    "CREATE INDEX IF NOT EXISTS idx_projects_user_status ON projects(user_id, status)",
    r#"CREATE TABLE IF NOT EXISTS mappings (
        message_id TEXT NOT NULL,
        thread_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        confidence REAL NOT NULL,
        association_method TEXT NOT NULL,
        is_primary INTEGER NOT NULL DEFAULT 1,
        active INTEGER NOT NULL DEFAULT 1,
        needs_review INTEGER NOT NULL DEFAULT 0,
        split_from_thread INTEGER NOT NULL DEFAULT 0,
        reflection_pending INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (user_id, message_id, project_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_mappings_user_project ON mappings(user_id, project_id)",
    "CREATE INDEX IF NOT EXISTS idx_mappings_user_thread ON mappings(user_id, thread_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_mappings_active ON mappings(user_id, message_id) WHERE active = 1",
    r#"CREATE TABLE IF NOT EXISTS attachments (
        message_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        provider_attachment_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        mime TEXT NOT NULL,
        size INTEGER NOT NULL,
        category TEXT NOT NULL,
        project_id TEXT,
        blob_ref TEXT,
        PRIMARY KEY (user_id, message_id, provider_attachment_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS corrections (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        correction_type TEXT NOT NULL,
        original_result_json TEXT NOT NULL,
        corrected_result_json TEXT NOT NULL,
        message_id TEXT,
        project_id TEXT,
        reason TEXT NOT NULL DEFAULT '',
        processed INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_corrections_user_processed ON corrections(user_id, processed)",
    r#"CREATE TABLE IF NOT EXISTS learning_patterns (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        pattern_body TEXT NOT NULL,
        project_id TEXT NOT NULL,
        confidence REAL NOT NULL,
        usage_count INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_patterns_user_active ON learning_patterns(user_id, active)",
    r#"CREATE TABLE IF NOT EXISTS watch_subscriptions (
        user_id TEXT PRIMARY KEY,
        topic TEXT,
        history_cursor TEXT NOT NULL DEFAULT '',
        expires_at TEXT NOT NULL,
        kind TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS resolver_events (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        message_id TEXT NOT NULL,
        event_kind TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_resolver_events_user ON resolver_events(user_id, created_at)",
    r#"CREATE TABLE IF NOT EXISTS queue_items (
        id TEXT PRIMARY KEY,
        queue_name TEXT NOT NULL,
        user_id TEXT NOT NULL,
        dedup_key TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        priority INTEGER NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_visible_at TEXT NOT NULL,
        error_summary TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_queue_user_status ON queue_items(queue_name, user_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_queue_user_created ON queue_items(queue_name, user_id, created_at)",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_queue_dedup ON queue_items(queue_name, dedup_key)",
];
