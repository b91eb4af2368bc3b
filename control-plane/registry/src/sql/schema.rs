//! Registry DDL, applied idempotently at node startup by whichever node
//! first reaches the store.

pub const CREATE_NAMESPACES: &str = "\
CREATE TABLE IF NOT EXISTS namespaces (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL UNIQUE,
    wallet     TEXT NOT NULL,
    plan       TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
)";

pub const CREATE_CLUSTERS: &str = "\
CREATE TABLE IF NOT EXISTS clusters (
    id           TEXT PRIMARY KEY,
    namespace_id TEXT NOT NULL REFERENCES namespaces(id),
    state        TEXT NOT NULL,
    reason       TEXT,
    checkpoint   TEXT,
    dns_ready    INTEGER NOT NULL DEFAULT 0,
    created_at   INTEGER NOT NULL,
    ready_at     INTEGER
)";

/// At most one non-terminal cluster per namespace.
pub const CREATE_CLUSTERS_LIVE_INDEX: &str = "\
CREATE UNIQUE INDEX IF NOT EXISTS clusters_live_namespace
    ON clusters(namespace_id)
    WHERE state NOT IN ('gone', 'failed')";

pub const CREATE_PLACEMENTS: &str = "\
CREATE TABLE IF NOT EXISTS placements (
    cluster_id    TEXT NOT NULL REFERENCES clusters(id),
    host_id       TEXT NOT NULL,
    role          TEXT NOT NULL,
    base_port     INTEGER NOT NULL,
    sql_ready     INTEGER NOT NULL DEFAULT 0,
    cache_ready   INTEGER NOT NULL DEFAULT 0,
    gateway_ready INTEGER NOT NULL DEFAULT 0,
    orphaned      INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (cluster_id, host_id)
)";

pub const CREATE_PORT_RESERVATIONS: &str = "\
CREATE TABLE IF NOT EXISTS port_reservations (
    host_id    TEXT NOT NULL,
    base_port  INTEGER NOT NULL,
    block_size INTEGER NOT NULL,
    cluster_id TEXT NOT NULL,
    UNIQUE (host_id, base_port)
)";

pub const CREATE_DEPLOYMENTS: &str = "\
CREATE TABLE IF NOT EXISTS deployments (
    id           TEXT PRIMARY KEY,
    namespace_id TEXT NOT NULL REFERENCES namespaces(id),
    name         TEXT NOT NULL,
    subdomain    TEXT NOT NULL UNIQUE,
    content_id   TEXT NOT NULL,
    kind         TEXT NOT NULL
)";

/// All DDL statements in application order.
pub const ALL: [&str; 6] = [
    CREATE_NAMESPACES,
    CREATE_CLUSTERS,
    CREATE_CLUSTERS_LIVE_INDEX,
    CREATE_PLACEMENTS,
    CREATE_PORT_RESERVATIONS,
    CREATE_DEPLOYMENTS,
];

/// The schema rendered as one script, for `orama-node schema`.
#[must_use]
pub fn render() -> String {
    let mut script = String::new();
    for ddl in ALL {
        script.push_str(ddl);
        script.push_str(";\n\n");
    }
    script
}
