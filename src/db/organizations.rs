use sqlx::{postgres::PgRow, Executor, PgConnection, Postgres, Row};
use uuid::Uuid;

use crate::organizations::{Organization, Space};

const ORGANIZATION_COLUMNS: &str =
    "guid, name, billing_enabled, quota_definition_guid, created_at, updated_at";

pub async fn find<'c, E>(executor: E, guid: Uuid) -> Result<Option<Organization>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE guid = $1"
    ))
    .bind(guid)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(|row| map_organization(&row)))
}

/// Takes the organization row lock that serializes admission for everything it owns.
pub async fn lock(conn: &mut PgConnection, guid: Uuid) -> Result<Option<Organization>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE guid = $1 FOR UPDATE"
    ))
    .bind(guid)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|row| map_organization(&row)))
}

/// Locks several organizations in ascending guid order. Missing organizations are skipped;
/// callers compare the result length.
pub async fn lock_in_order(
    conn: &mut PgConnection,
    guids: &[Uuid],
) -> Result<Vec<Organization>, sqlx::Error> {
    let mut ordered = guids.to_vec();
    ordered.sort();
    ordered.dedup();

    let mut locked = Vec::with_capacity(ordered.len());
    for guid in ordered {
        if let Some(organization) = lock(conn, guid).await? {
            locked.push(organization);
        }
    }
    Ok(locked)
}

pub async fn insert<'c, E>(
    executor: E,
    name: &str,
    quota_definition_guid: Uuid,
    billing_enabled: bool,
) -> Result<Organization, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO organizations (guid, name, billing_enabled, quota_definition_guid)
        VALUES ($1, $2, $3, $4)
        RETURNING {ORGANIZATION_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(billing_enabled)
    .bind(quota_definition_guid)
    .fetch_one(executor)
    .await?;
    Ok(map_organization(&row))
}

pub async fn set_quota_definition<'c, E>(
    executor: E,
    guid: Uuid,
    quota_definition_guid: Uuid,
) -> Result<Organization, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        UPDATE organizations
        SET quota_definition_guid = $2, updated_at = NOW()
        WHERE guid = $1
        RETURNING {ORGANIZATION_COLUMNS}
        "#
    ))
    .bind(guid)
    .bind(quota_definition_guid)
    .fetch_one(executor)
    .await?;
    Ok(map_organization(&row))
}

/// Flips `billing_enabled` to true. The flag is never cleared.
pub async fn enable_billing<'c, E>(executor: E, guid: Uuid) -> Result<Organization, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        UPDATE organizations
        SET billing_enabled = TRUE, updated_at = NOW()
        WHERE guid = $1
        RETURNING {ORGANIZATION_COLUMNS}
        "#
    ))
    .bind(guid)
    .fetch_one(executor)
    .await?;
    Ok(map_organization(&row))
}

pub async fn find_space<'c, E>(executor: E, guid: Uuid) -> Result<Option<Space>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        "SELECT guid, organization_guid, name, created_at FROM spaces WHERE guid = $1",
    )
    .bind(guid)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(|row| map_space(&row)))
}

pub async fn insert_space<'c, E>(
    executor: E,
    organization_guid: Uuid,
    name: &str,
) -> Result<Space, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO spaces (guid, organization_guid, name)
        VALUES ($1, $2, $3)
        RETURNING guid, organization_guid, name, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(organization_guid)
    .bind(name)
    .fetch_one(executor)
    .await?;
    Ok(map_space(&row))
}

fn map_organization(row: &PgRow) -> Organization {
    Organization {
        guid: row.get("guid"),
        name: row.get("name"),
        billing_enabled: row.get("billing_enabled"),
        quota_definition_guid: row.get("quota_definition_guid"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn map_space(row: &PgRow) -> Space {
    Space {
        guid: row.get("guid"),
        organization_guid: row.get("organization_guid"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    }
}
