//! Column families of the `RocksDB` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Token accounts, keyed by `user_id`.
    pub const ACCOUNTS: &str = "accounts";

    /// Ledger entries, keyed by `entry_id` (ULID).
    pub const LEDGER_ENTRIES: &str = "ledger_entries";

    /// Index: entries by user, keyed by `user_id || entry_id`. Empty values.
    pub const ENTRIES_BY_USER: &str = "entries_by_user";

    /// Index: entries by task, keyed by `task_id || entry_id`. Empty values.
    pub const ENTRIES_BY_TASK: &str = "entries_by_task";

    /// Generation tasks, keyed by `task_id`.
    pub const TASKS: &str = "tasks";

    /// Index: tasks by user, keyed by `user_id || created_millis || task_id`.
    pub const TASKS_BY_USER: &str = "tasks_by_user";

    /// Index: tasks by status, keyed by `status_tag || task_id`.
    pub const TASKS_BY_STATUS: &str = "tasks_by_status";

    /// Index: provider task id to local `task_id`.
    pub const TASKS_BY_PROVIDER_ID: &str = "tasks_by_provider_id";

    /// Weekly usage counters, keyed by `user_id || week_start`.
    pub const WEEKLY_USAGE: &str = "weekly_usage";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::LEDGER_ENTRIES,
        cf::ENTRIES_BY_USER,
        cf::ENTRIES_BY_TASK,
        cf::TASKS,
        cf::TASKS_BY_USER,
        cf::TASKS_BY_STATUS,
        cf::TASKS_BY_PROVIDER_ID,
        cf::WEEKLY_USAGE,
    ]
}
