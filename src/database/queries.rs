use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};

use crate::database::models::*;

pub struct Queries;

impl Queries {
    pub async fn get_logbook<'e, E>(
        executor: E,
        logbook_id: i64,
    ) -> Result<Option<Logbook>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(
            r#"
            SELECT id, institution_id, name, assessed, assessed_by, assessed_at,
                   created_at, updated_at
            FROM logbooks
            WHERE id = ?
            "#,
        )
        .bind(logbook_id)
        .fetch_optional(executor)
        .await?;

        row.map(|row| logbook_from_row(&row)).transpose()
    }

    /// The grant a user holds on a logbook, if any
    pub async fn get_user_grant<'e, E>(
        executor: E,
        logbook_id: i64,
        user_id: i64,
    ) -> Result<Option<AccessGrant>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, logbook_id, role, reviewed, reviewed_at, created_at, updated_at
            FROM access_grants
            WHERE logbook_id = ? AND user_id = ?
            "#,
        )
        .bind(logbook_id)
        .bind(user_id)
        .fetch_optional(executor)
        .await?;

        row.map(|row| grant_from_row(&row)).transpose()
    }

    /// The single grant holding `role` on a logbook, if any
    pub async fn get_role_grant<'e, E>(
        executor: E,
        logbook_id: i64,
        role: GrantRole,
    ) -> Result<Option<AccessGrant>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, logbook_id, role, reviewed, reviewed_at, created_at, updated_at
            FROM access_grants
            WHERE logbook_id = ? AND role = ?
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(logbook_id)
        .bind(role.as_str())
        .fetch_optional(executor)
        .await?;

        row.map(|row| grant_from_row(&row)).transpose()
    }

    pub async fn get_grants_for_logbook<'e, E>(
        executor: E,
        logbook_id: i64,
    ) -> Result<Vec<AccessGrant>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, logbook_id, role, reviewed, reviewed_at, created_at, updated_at
            FROM access_grants
            WHERE logbook_id = ?
            ORDER BY id
            "#,
        )
        .bind(logbook_id)
        .fetch_all(executor)
        .await?;

        rows.iter().map(grant_from_row).collect()
    }

    /// Next page of entry ids after `after_id`, ascending
    pub async fn get_entry_ids_page<'e, E>(
        executor: E,
        logbook_id: i64,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<i64>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM logbook_entries
            WHERE logbook_id = ? AND id > ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(logbook_id)
        .bind(after_id)
        .bind(limit)
        .fetch_all(executor)
        .await?;

        rows.iter().map(|row| row.try_get::<i64, _>("id")).collect()
    }

    pub async fn get_entry<'e, E>(
        executor: E,
        entry_id: i64,
    ) -> Result<Option<LogbookEntry>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(
            r#"
            SELECT id, logbook_id, author_id, payload, created_at, updated_at
            FROM logbook_entries
            WHERE id = ?
            "#,
        )
        .bind(entry_id)
        .fetch_optional(executor)
        .await?;

        row.map(|row| entry_from_row(&row)).transpose()
    }

    pub async fn get_user<'e, E>(executor: E, user_id: i64) -> Result<Option<User>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(
            r#"
            SELECT id, username, institution_id, is_institution_admin
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(executor)
        .await?;

        row.map(|row| -> Result<User, sqlx::Error> {
            Ok(User {
                id: row.try_get("id")?,
                username: row.try_get("username")?,
                institution_id: row.try_get("institution_id")?,
                is_institution_admin: row.try_get("is_institution_admin")?,
            })
        })
        .transpose()
    }
}

pub(crate) fn logbook_from_row(row: &SqliteRow) -> Result<Logbook, sqlx::Error> {
    Ok(Logbook {
        id: row.try_get("id")?,
        institution_id: row.try_get("institution_id")?,
        name: row.try_get("name")?,
        assessed: row.try_get("assessed")?,
        assessed_by: row.try_get("assessed_by")?,
        assessed_at: row.try_get("assessed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn grant_from_row(row: &SqliteRow) -> Result<AccessGrant, sqlx::Error> {
    let role: String = row.try_get("role")?;
    let role = GrantRole::from_str(&role).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: "role".to_string(),
        source: format!("Invalid grant role: {}", role).into(),
    })?;

    Ok(AccessGrant {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        logbook_id: row.try_get("logbook_id")?,
        role,
        reviewed: row.try_get("reviewed")?,
        reviewed_at: row.try_get("reviewed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn entry_from_row(row: &SqliteRow) -> Result<LogbookEntry, sqlx::Error> {
    let payload: String = row.try_get("payload")?;
    let payload: EntryPayload =
        serde_json::from_str(&payload).map_err(|e| sqlx::Error::ColumnDecode {
            index: "payload".to_string(),
            source: Box::new(e),
        })?;

    Ok(LogbookEntry {
        id: row.try_get("id")?,
        logbook_id: row.try_get("logbook_id")?,
        author_id: row.try_get("author_id")?,
        payload,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn record_from_row(row: &SqliteRow) -> Result<VerificationRecord, sqlx::Error> {
    let outcome: Option<String> = row.try_get("outcome")?;

    Ok(VerificationRecord {
        id: row.try_get("id")?,
        entry_id: row.try_get("entry_id")?,
        verifier_id: row.try_get("verifier_id")?,
        decided: row.try_get("decided")?,
        outcome: outcome.as_deref().and_then(DecisionOutcome::from_str),
        decided_at: row.try_get("decided_at")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
