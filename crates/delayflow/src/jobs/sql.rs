//! Dialect-aware construction of every statement the stores run.
//!
//! The eligibility predicate and the singleton-exclusion subquery exist
//! exactly once, here; the per-backend modules only differ in how they
//! wrap the predicate into an atomic claim. Placeholder *order* is part of
//! each builder's contract and is documented per function; callers bind
//! values in exactly that order.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    Postgres,
    MySql,
    Mssql,
    Teradata,
    Generic,
}

impl Dialect {
    /// `$n` on Postgres, `?` everywhere else.
    fn placeholder(self, n: &mut usize) -> String {
        *n += 1;
        match self {
            Dialect::Postgres => format!("${n}"),
            _ => "?".to_string(),
        }
    }

    pub(crate) fn quote_table(self, name: &str) -> String {
        match self {
            Dialect::MySql => format!("`{name}`"),
            Dialect::Mssql => format!("[{name}]"),
            _ => format!("\"{name}\""),
        }
    }
}

/// Which optional clauses the current settings switch on. The SQL text and
/// the caller's bind sequence must be produced from the same shape.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FilterShape {
    pub min_priority: bool,
    pub max_priority: bool,
    pub queue_count: usize,
}

const ORDER_BY: &str = "ORDER BY priority ASC, run_at ASC, id ASC";

/// The eligibility predicate `E(now, me, T)`.
///
/// Bind order: `now`, `lock_cutoff`, `worker`, then `min_priority` /
/// `max_priority` / each queue name when present in the shape, then
/// `now`, `lock_cutoff`, `worker` again for the singleton subquery.
fn eligible_where(dialect: Dialect, table: &str, n: &mut usize, shape: FilterShape) -> String {
    let mut sql = String::from("failed_at IS NULL");

    let now = dialect.placeholder(n);
    let cutoff = dialect.placeholder(n);
    let me = dialect.placeholder(n);
    sql.push_str(&format!(
        " AND ((run_at <= {now} AND (locked_at IS NULL OR locked_at < {cutoff})) OR locked_by = {me})"
    ));

    if shape.min_priority {
        let min = dialect.placeholder(n);
        sql.push_str(&format!(" AND priority >= {min}"));
    }
    if shape.max_priority {
        let max = dialect.placeholder(n);
        sql.push_str(&format!(" AND priority <= {max}"));
    }
    if shape.queue_count > 0 {
        let marks: Vec<String> = (0..shape.queue_count)
            .map(|_| dialect.placeholder(n))
            .collect();
        sql.push_str(&format!(" AND queue IN ({})", marks.join(", ")));
    }

    sql.push_str(&singleton_exclusion(dialect, table, n));
    sql
}

/// Excludes rows whose singleton class already has a live lock held by
/// someone else. The nested derived table is mandatory on MySQL, which
/// rejects a plain self-select of the table being updated; the other
/// backends run the identical shape.
fn singleton_exclusion(dialect: Dialect, table: &str, n: &mut usize) -> String {
    let now = dialect.placeholder(n);
    let floor = dialect.placeholder(n);
    let me = dialect.placeholder(n);
    format!(
        " AND (singleton IS NULL OR singleton NOT IN (\
SELECT singleton FROM (\
SELECT DISTINCT singleton FROM {table} \
WHERE run_at <= {now} AND singleton IS NOT NULL \
AND locked_at IS NOT NULL AND locked_at >= {floor} \
AND locked_by <> {me} AND failed_at IS NULL) AS grabbed))"
    )
}

/// Single-statement Postgres claim. The inner `FOR UPDATE` is what makes
/// two concurrent claims pick distinct rows.
///
/// Bind order: `locked_at`, `locked_by`, then the [`eligible_where`]
/// sequence.
pub(crate) fn claim_postgres(table: &str, shape: FilterShape) -> String {
    let dialect = Dialect::Postgres;
    let mut n = 0;
    let locked_at = dialect.placeholder(&mut n);
    let locked_by = dialect.placeholder(&mut n);
    let eligible = eligible_where(dialect, table, &mut n, shape);
    format!(
        "UPDATE {table} SET locked_at = {locked_at}, locked_by = {locked_by} \
WHERE id IN (SELECT id FROM {table} WHERE {eligible} {ORDER_BY} LIMIT 1 FOR UPDATE) \
RETURNING *"
    )
}

/// First half of the MySQL two-step claim.
///
/// Bind order: `locked_at`, `locked_by`, then the [`eligible_where`]
/// sequence. All timestamps must be whole seconds.
pub(crate) fn claim_mysql_update(table: &str, shape: FilterShape) -> String {
    let dialect = Dialect::MySql;
    let mut n = 0;
    let locked_at = dialect.placeholder(&mut n);
    let locked_by = dialect.placeholder(&mut n);
    let eligible = eligible_where(dialect, table, &mut n, shape);
    format!(
        "UPDATE {table} SET locked_at = {locked_at}, locked_by = {locked_by} \
WHERE {eligible} {ORDER_BY} LIMIT 1"
    )
}

/// Second half of the MySQL two-step claim (and of the TOP-1 backends):
/// re-select the row just claimed by its lease pair.
///
/// Bind order: `locked_at`, `locked_by`.
pub(crate) fn reselect_claimed(dialect: Dialect, table: &str) -> String {
    let mut n = 0;
    let locked_at = dialect.placeholder(&mut n);
    let locked_by = dialect.placeholder(&mut n);
    let limit = match dialect {
        Dialect::Mssql | Dialect::Teradata => String::new(),
        _ => " LIMIT 1".to_string(),
    };
    format!(
        "SELECT * FROM {table} \
WHERE locked_at = {locked_at} AND locked_by = {locked_by} AND failed_at IS NULL{limit}"
    )
}

/// Claim for backends whose drivers cannot return the updated row and
/// spell row limits as `TOP (1)` (MSSQL, Teradata). Follow with
/// [`reselect_claimed`].
///
/// Bind order: `locked_at`, `locked_by`, then the [`eligible_where`]
/// sequence.
pub(crate) fn claim_top1(dialect: Dialect, table: &str, shape: FilterShape) -> String {
    let mut n = 0;
    let locked_at = dialect.placeholder(&mut n);
    let locked_by = dialect.placeholder(&mut n);
    let eligible = eligible_where(dialect, table, &mut n, shape);
    format!(
        "UPDATE {table} SET locked_at = {locked_at}, locked_by = {locked_by} \
WHERE id IN (SELECT id FROM (SELECT TOP (1) id FROM {table} WHERE {eligible} {ORDER_BY}) AS x)"
    )
}

/// Read-ahead candidate list for the generic fallback.
///
/// Bind order: the [`eligible_where`] sequence, then the row limit.
pub(crate) fn candidates(dialect: Dialect, table: &str, shape: FilterShape) -> String {
    let mut n = 0;
    let eligible = eligible_where(dialect, table, &mut n, shape);
    let limit = dialect.placeholder(&mut n);
    format!("SELECT * FROM {table} WHERE {eligible} {ORDER_BY} LIMIT {limit}")
}

/// Optimistic claim of one candidate: succeeds (one row affected) only if
/// the row is still eligible at update time.
///
/// Bind order: `locked_at`, `locked_by`, `id`, then the
/// [`eligible_where`] sequence.
pub(crate) fn claim_one(dialect: Dialect, table: &str, shape: FilterShape) -> String {
    let mut n = 0;
    let locked_at = dialect.placeholder(&mut n);
    let locked_by = dialect.placeholder(&mut n);
    let id = dialect.placeholder(&mut n);
    let eligible = eligible_where(dialect, table, &mut n, shape);
    format!(
        "UPDATE {table} SET locked_at = {locked_at}, locked_by = {locked_by} \
WHERE id = {id} AND {eligible}"
    )
}

/// Bind order: `priority`, `handler`, `run_at`, `queue`, `singleton`,
/// `failed_at`, `locked_at`, `locked_by`, `created_at`, `updated_at`.
pub(crate) fn insert(dialect: Dialect, table: &str) -> String {
    let mut n = 0;
    let marks: Vec<String> = (0..10).map(|_| dialect.placeholder(&mut n)).collect();
    let returning = match dialect {
        Dialect::Postgres => " RETURNING *",
        _ => "",
    };
    format!(
        "INSERT INTO {table} \
(priority, handler, run_at, queue, singleton, failed_at, locked_at, locked_by, created_at, updated_at) \
VALUES ({}){returning}",
        marks.join(", ")
    )
}

/// Bind order: `priority`, `attempts`, `handler`, `last_error`, `run_at`,
/// `queue`, `singleton`, `failed_at`, `locked_at`, `locked_by`,
/// `updated_at`, `id`.
pub(crate) fn update(dialect: Dialect, table: &str) -> String {
    let mut n = 0;
    let set: Vec<String> = [
        "priority", "attempts", "handler", "last_error", "run_at", "queue", "singleton",
        "failed_at", "locked_at", "locked_by", "updated_at",
    ]
    .iter()
    .map(|column| format!("{column} = {}", dialect.placeholder(&mut n)))
    .collect();
    let id = dialect.placeholder(&mut n);
    format!("UPDATE {table} SET {} WHERE id = {id}", set.join(", "))
}

/// Bind order: `id`.
pub(crate) fn delete(dialect: Dialect, table: &str) -> String {
    let mut n = 0;
    let id = dialect.placeholder(&mut n);
    format!("DELETE FROM {table} WHERE id = {id}")
}

/// Deletes the pending duplicates of a singleton class, sparing the row
/// being destroyed itself.
///
/// Bind order: `singleton`, `id`.
pub(crate) fn delete_singleton_siblings(dialect: Dialect, table: &str) -> String {
    let mut n = 0;
    let singleton = dialect.placeholder(&mut n);
    let id = dialect.placeholder(&mut n);
    format!("DELETE FROM {table} WHERE singleton = {singleton} AND id <> {id}")
}

/// Bind order: `id`.
pub(crate) fn select_by_id(dialect: Dialect, table: &str) -> String {
    let mut n = 0;
    let id = dialect.placeholder(&mut n);
    format!("SELECT * FROM {table} WHERE id = {id}")
}

/// Bind order: `worker`.
pub(crate) fn clear_locks(dialect: Dialect, table: &str) -> String {
    let mut n = 0;
    let me = dialect.placeholder(&mut n);
    format!("UPDATE {table} SET locked_by = NULL, locked_at = NULL WHERE locked_by = {me}")
}

/// Bind order: `now`, `lock_cutoff`.
pub(crate) fn count_ready(dialect: Dialect, table: &str) -> String {
    let mut n = 0;
    let now = dialect.placeholder(&mut n);
    let cutoff = dialect.placeholder(&mut n);
    format!(
        "SELECT COUNT(*) FROM {table} \
WHERE failed_at IS NULL AND run_at <= {now} \
AND (locked_at IS NULL OR locked_at < {cutoff})"
    )
}

/// Bind order: `lock_cutoff`.
pub(crate) fn count_working(dialect: Dialect, table: &str) -> String {
    let mut n = 0;
    let cutoff = dialect.placeholder(&mut n);
    format!(
        "SELECT COUNT(*) FROM {table} \
WHERE failed_at IS NULL AND locked_by IS NOT NULL AND locked_at >= {cutoff}"
    )
}

pub(crate) fn count_failed(_dialect: Dialect, table: &str) -> String {
    format!("SELECT COUNT(*) FROM {table} WHERE failed_at IS NOT NULL")
}

/// Binds the [`eligible_where`] sequence onto any sqlx query builder, so
/// the per-backend bind sites cannot drift from the placeholder order.
/// `$settings` supplies the same shape the SQL was built with.
macro_rules! bind_eligibility {
    ($query:expr, $now:expr, $cutoff:expr, $worker:expr, $settings:expr) => {{
        let mut query = $query
            .bind($now)
            .bind($cutoff)
            .bind($worker.name.clone());
        if let Some(min) = $settings.min_priority {
            query = query.bind(min);
        }
        if let Some(max) = $settings.max_priority {
            query = query.bind(max);
        }
        for queue in &$settings.queues {
            query = query.bind(queue.clone());
        }
        query.bind($now).bind($cutoff).bind($worker.name.clone())
    }};
}

pub(crate) use bind_eligibility;

#[cfg(test)]
mod tests {
    use super::*;

    fn full_shape() -> FilterShape {
        FilterShape {
            min_priority: true,
            max_priority: true,
            queue_count: 2,
        }
    }

    #[test]
    fn postgres_claim_is_one_statement_with_row_locking() {
        let sql = claim_postgres("\"delayed_jobs\"", FilterShape::default());
        assert_eq!(
            sql,
            "UPDATE \"delayed_jobs\" SET locked_at = $1, locked_by = $2 \
WHERE id IN (SELECT id FROM \"delayed_jobs\" WHERE failed_at IS NULL \
AND ((run_at <= $3 AND (locked_at IS NULL OR locked_at < $4)) OR locked_by = $5) \
AND (singleton IS NULL OR singleton NOT IN (\
SELECT singleton FROM (\
SELECT DISTINCT singleton FROM \"delayed_jobs\" \
WHERE run_at <= $6 AND singleton IS NOT NULL \
AND locked_at IS NOT NULL AND locked_at >= $7 \
AND locked_by <> $8 AND failed_at IS NULL) AS grabbed)) \
ORDER BY priority ASC, run_at ASC, id ASC LIMIT 1 FOR UPDATE) \
RETURNING *"
        );
    }

    #[test]
    fn postgres_placeholders_stay_sequential_with_every_filter_on() {
        let sql = claim_postgres("\"delayed_jobs\"", full_shape());
        for n in 1..=12 {
            assert!(sql.contains(&format!("${n}")), "missing ${n} in {sql}");
        }
        assert!(!sql.contains("$13"));
        assert!(sql.contains("priority >= $6"));
        assert!(sql.contains("priority <= $7"));
        assert!(sql.contains("queue IN ($8, $9)"));
    }

    #[test]
    fn mysql_claim_updates_in_place_then_reselects() {
        let update = claim_mysql_update("`delayed_jobs`", FilterShape::default());
        assert!(update.starts_with(
            "UPDATE `delayed_jobs` SET locked_at = ?, locked_by = ? WHERE failed_at IS NULL"
        ));
        assert!(update.ends_with("ORDER BY priority ASC, run_at ASC, id ASC LIMIT 1"));
        // The derived-table alias is what lets MySQL self-reference the
        // table it is updating.
        assert!(update.contains("SELECT singleton FROM (SELECT DISTINCT singleton FROM `delayed_jobs`"));
        assert!(update.contains(") AS grabbed"));
        assert_eq!(update.matches('?').count(), 8);

        let reselect = reselect_claimed(Dialect::MySql, "`delayed_jobs`");
        assert_eq!(
            reselect,
            "SELECT * FROM `delayed_jobs` \
WHERE locked_at = ? AND locked_by = ? AND failed_at IS NULL LIMIT 1"
        );
    }

    #[test]
    fn top1_backends_wrap_the_limited_select_twice() {
        for dialect in [Dialect::Mssql, Dialect::Teradata] {
            let table = dialect.quote_table("delayed_jobs");
            let sql = claim_top1(dialect, &table, FilterShape::default());
            assert!(sql.contains(&format!(
                "WHERE id IN (SELECT id FROM (SELECT TOP (1) id FROM {table}"
            )));
            assert!(sql.ends_with(") AS x)"));
            assert!(!sql.contains("LIMIT"));
            let reselect = reselect_claimed(dialect, &table);
            assert!(!reselect.contains("LIMIT"));
        }
        assert_eq!(Dialect::Mssql.quote_table("delayed_jobs"), "[delayed_jobs]");
    }

    #[test]
    fn generic_fallback_rechecks_eligibility_in_the_claim() {
        let candidates = candidates(Dialect::Generic, "\"delayed_jobs\"", full_shape());
        assert!(candidates.starts_with("SELECT * FROM \"delayed_jobs\" WHERE failed_at IS NULL"));
        assert!(candidates.ends_with("ORDER BY priority ASC, run_at ASC, id ASC LIMIT ?"));
        // 6 base + min + max + 2 queues + limit
        assert_eq!(candidates.matches('?').count(), 11);

        let claim = claim_one(Dialect::Generic, "\"delayed_jobs\"", full_shape());
        assert!(claim.starts_with(
            "UPDATE \"delayed_jobs\" SET locked_at = ?, locked_by = ? WHERE id = ? AND failed_at IS NULL"
        ));
        // 3 head binds + the full predicate again
        assert_eq!(claim.matches('?').count(), 13);
    }

    #[test]
    fn insert_returns_the_row_only_on_postgres() {
        assert!(insert(Dialect::Postgres, "\"delayed_jobs\"").ends_with("RETURNING *"));
        let mysql = insert(Dialect::MySql, "`delayed_jobs`");
        assert!(!mysql.contains("RETURNING"));
        assert_eq!(mysql.matches('?').count(), 10);
    }

    #[test]
    fn clear_locks_releases_both_halves_of_the_lease() {
        assert_eq!(
            clear_locks(Dialect::Postgres, "\"delayed_jobs\""),
            "UPDATE \"delayed_jobs\" SET locked_by = NULL, locked_at = NULL WHERE locked_by = $1"
        );
    }
}
