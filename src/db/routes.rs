use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::apps::models::Route;

pub async fn find<'c, E>(executor: E, guid: Uuid) -> Result<Option<Route>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query("SELECT guid, space_guid, host, domain FROM routes WHERE guid = $1")
        .bind(guid)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|row| map_route(&row)))
}

pub async fn insert<'c, E>(
    executor: E,
    space_guid: Uuid,
    host: &str,
    domain: &str,
) -> Result<Route, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO routes (guid, space_guid, host, domain)
        VALUES ($1, $2, $3, $4)
        RETURNING guid, space_guid, host, domain
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(space_guid)
    .bind(host)
    .bind(domain)
    .fetch_one(executor)
    .await?;
    Ok(map_route(&row))
}

/// Returns false when the link already existed.
pub async fn attach<'c, E>(executor: E, app_guid: Uuid, route_guid: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "INSERT INTO apps_routes (app_guid, route_guid) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(app_guid)
    .bind(route_guid)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Returns false when there was no link to remove.
pub async fn detach<'c, E>(executor: E, app_guid: Uuid, route_guid: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query("DELETE FROM apps_routes WHERE app_guid = $1 AND route_guid = $2")
        .bind(app_guid)
        .bind(route_guid)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn for_app<'c, E>(executor: E, app_guid: Uuid) -> Result<Vec<Route>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT r.guid, r.space_guid, r.host, r.domain
        FROM routes r
        JOIN apps_routes ar ON ar.route_guid = r.guid
        WHERE ar.app_guid = $1
        ORDER BY r.domain, r.host
        "#,
    )
    .bind(app_guid)
    .fetch_all(executor)
    .await?;
    Ok(rows.iter().map(map_route).collect())
}

fn map_route(row: &PgRow) -> Route {
    Route {
        guid: row.get("guid"),
        space_guid: row.get("space_guid"),
        host: row.get("host"),
        domain: row.get("domain"),
    }
}
