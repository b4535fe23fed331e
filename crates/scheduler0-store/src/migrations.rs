//! Schema migrations.
//!
//! One batch, executed at boot. Every statement is `IF NOT EXISTS` so the
//! routine can run on every start and after snapshot restores.

use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS projects (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT NOT NULL UNIQUE,
            description  TEXT NOT NULL,
            date_created TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id   INTEGER NOT NULL REFERENCES projects (id),
            spec         TEXT NOT NULL,
            timezone     TEXT NOT NULL,
            callback_url TEXT NOT NULL,
            data         TEXT NOT NULL,
            start_date   TEXT,
            end_date     TEXT,
            date_created TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_project_id ON jobs (project_id);

        CREATE TABLE IF NOT EXISTS credentials (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            api_key      TEXT NOT NULL,
            api_secret   TEXT NOT NULL,
            archived     INTEGER NOT NULL DEFAULT 0,
            date_created TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job_queue_versions (
            version                INTEGER PRIMARY KEY AUTOINCREMENT,
            number_of_active_nodes INTEGER NOT NULL,
            date_created           TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job_queues (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id            INTEGER NOT NULL,
            lower_bound_job_id INTEGER NOT NULL,
            upper_bound_job_id INTEGER NOT NULL,
            version            INTEGER NOT NULL,
            date_created       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_job_queues_node_version
            ON job_queues (node_id, version);

        CREATE TABLE IF NOT EXISTS job_executions_committed (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            unique_id               TEXT NOT NULL UNIQUE,
            state                   TEXT NOT NULL,
            node_id                 INTEGER NOT NULL,
            last_execution_datetime TEXT NOT NULL,
            next_execution_datetime TEXT NOT NULL,
            job_id                  INTEGER NOT NULL,
            execution_version       INTEGER NOT NULL,
            job_queue_version       INTEGER NOT NULL,
            date_created            TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_executions_committed_job_id
            ON job_executions_committed (job_id);

        CREATE TABLE IF NOT EXISTS job_executions_uncommitted (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            unique_id               TEXT NOT NULL UNIQUE,
            state                   TEXT NOT NULL,
            node_id                 INTEGER NOT NULL,
            last_execution_datetime TEXT NOT NULL,
            next_execution_datetime TEXT NOT NULL,
            job_id                  INTEGER NOT NULL,
            execution_version       INTEGER NOT NULL,
            job_queue_version       INTEGER NOT NULL,
            date_created            TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_executions_uncommitted_job_id
            ON job_executions_uncommitted (job_id);

        CREATE TABLE IF NOT EXISTS async_tasks_committed (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id   TEXT NOT NULL,
            service      TEXT NOT NULL,
            input        TEXT NOT NULL,
            output       TEXT NOT NULL DEFAULT '',
            state        TEXT NOT NULL,
            date_created TEXT NOT NULL,
            UNIQUE (request_id, service)
        );

        CREATE TABLE IF NOT EXISTS async_tasks_uncommitted (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id   TEXT NOT NULL,
            service      TEXT NOT NULL,
            input        TEXT NOT NULL,
            output       TEXT NOT NULL DEFAULT '',
            state        TEXT NOT NULL,
            date_created TEXT NOT NULL,
            UNIQUE (request_id, service)
        );
        ",
    )
}
