use sqlx::{postgres::PgRow, Executor, PgConnection, Postgres, Row};
use uuid::Uuid;

use crate::apps::models::{App, AppEvent, AppState, NewAppEvent, PackageState, Stack};

const APP_COLUMNS: &str = r#"
    guid, space_guid, stack_guid, name, production, memory, instances, state, package_state,
    package_hash, droplet_hash, version, environment, buildpack, created_at, updated_at
"#;

pub async fn find<'c, E>(executor: E, guid: Uuid) -> Result<Option<App>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!("SELECT {APP_COLUMNS} FROM apps WHERE guid = $1"))
        .bind(guid)
        .fetch_optional(executor)
        .await?;
    row.map(|row| map_app(&row)).transpose()
}

/// Row lock that serializes billing pairing for one application.
pub async fn lock(conn: &mut PgConnection, guid: Uuid) -> Result<Option<App>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {APP_COLUMNS} FROM apps WHERE guid = $1 FOR UPDATE"
    ))
    .bind(guid)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|row| map_app(&row)).transpose()
}

/// Owning organization, read without locking so the caller can take locks in order.
pub async fn organization_of<'c, E>(executor: E, guid: Uuid) -> Result<Option<Uuid>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        r#"
        SELECT s.organization_guid
        FROM apps a
        JOIN spaces s ON s.guid = a.space_guid
        WHERE a.guid = $1
        "#,
    )
    .bind(guid)
    .fetch_optional(executor)
    .await
}

pub async fn name_taken<'c, E>(
    executor: E,
    space_guid: Uuid,
    name: &str,
    exclude: Option<Uuid>,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM apps
            WHERE space_guid = $1 AND LOWER(name) = LOWER($2)
              AND ($3::UUID IS NULL OR guid <> $3)
        )
        "#,
    )
    .bind(space_guid)
    .bind(name)
    .bind(exclude)
    .fetch_one(executor)
    .await
}

pub async fn insert<'c, E>(executor: E, app: &App) -> Result<App, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO apps (
            guid, space_guid, stack_guid, name, production, memory, instances, state,
            package_state, package_hash, droplet_hash, version, environment, buildpack
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        RETURNING {APP_COLUMNS}
        "#
    ))
    .bind(app.guid)
    .bind(app.space_guid)
    .bind(app.stack_guid)
    .bind(&app.name)
    .bind(app.production)
    .bind(app.memory)
    .bind(app.instances)
    .bind(app.state.as_str())
    .bind(app.package_state.as_str())
    .bind(&app.package_hash)
    .bind(&app.droplet_hash)
    .bind(app.version)
    .bind(&app.environment)
    .bind(&app.buildpack)
    .fetch_one(executor)
    .await?;
    map_app(&row)
}

/// Persists every mutable column of `app` and stamps `updated_at`.
pub async fn update<'c, E>(executor: E, app: &App) -> Result<App, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        UPDATE apps SET
            space_guid = $2,
            stack_guid = $3,
            name = $4,
            production = $5,
            memory = $6,
            instances = $7,
            state = $8,
            package_state = $9,
            package_hash = $10,
            droplet_hash = $11,
            version = $12,
            environment = $13,
            buildpack = $14,
            updated_at = NOW()
        WHERE guid = $1
        RETURNING {APP_COLUMNS}
        "#
    ))
    .bind(app.guid)
    .bind(app.space_guid)
    .bind(app.stack_guid)
    .bind(&app.name)
    .bind(app.production)
    .bind(app.memory)
    .bind(app.instances)
    .bind(app.state.as_str())
    .bind(app.package_state.as_str())
    .bind(&app.package_hash)
    .bind(&app.droplet_hash)
    .bind(app.version)
    .bind(&app.environment)
    .bind(&app.buildpack)
    .fetch_one(executor)
    .await?;
    map_app(&row)
}

/// Resets staging after a binding change so the next start restages with new credentials.
pub async fn mark_for_restaging<'c, E>(executor: E, guid: Uuid) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("UPDATE apps SET package_state = 'PENDING', updated_at = NOW() WHERE guid = $1")
        .bind(guid)
        .execute(executor)
        .await?;
    Ok(())
}

/// Deletes the application row together with its events and route links. Service bindings
/// are removed by the caller first.
pub async fn delete(conn: &mut PgConnection, guid: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM app_events WHERE app_guid = $1")
        .bind(guid)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM apps_routes WHERE app_guid = $1")
        .bind(guid)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM apps WHERE guid = $1")
        .bind(guid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn started_in_organization<'c, E>(
    executor: E,
    organization_guid: Uuid,
) -> Result<Vec<App>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(&format!(
        r#"
        SELECT {APP_COLUMNS}
        FROM apps
        WHERE state = 'STARTED'
          AND space_guid IN (SELECT guid FROM spaces WHERE organization_guid = $1)
        ORDER BY created_at, guid
        "#
    ))
    .bind(organization_guid)
    .fetch_all(executor)
    .await?;
    rows.iter().map(map_app).collect()
}

pub async fn find_stack<'c, E>(executor: E, guid: Uuid) -> Result<Option<Stack>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query("SELECT guid, name, description FROM stacks WHERE guid = $1")
        .bind(guid)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|row| map_stack(&row)))
}

pub async fn stack_by_name<'c, E>(executor: E, name: &str) -> Result<Option<Stack>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query("SELECT guid, name, description FROM stacks WHERE name = $1")
        .bind(name)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|row| map_stack(&row)))
}

pub async fn insert_stack<'c, E>(
    executor: E,
    name: &str,
    description: &str,
) -> Result<Stack, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        "INSERT INTO stacks (guid, name, description) VALUES ($1, $2, $3) RETURNING guid, name, description",
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(description)
    .fetch_one(executor)
    .await?;
    Ok(map_stack(&row))
}

pub async fn insert_app_event<'c, E>(
    executor: E,
    app_guid: Uuid,
    event: &NewAppEvent,
) -> Result<AppEvent, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO app_events (
            guid, app_guid, instance_guid, instance_index, exit_status, exit_description, timestamp
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING guid, app_guid, instance_guid, instance_index, exit_status, exit_description,
                  timestamp
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(app_guid)
    .bind(&event.instance_guid)
    .bind(event.instance_index)
    .bind(event.exit_status)
    .bind(&event.exit_description)
    .bind(event.timestamp)
    .fetch_one(executor)
    .await?;
    Ok(map_app_event(&row))
}

pub async fn app_events<'c, E>(executor: E, app_guid: Uuid) -> Result<Vec<AppEvent>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT guid, app_guid, instance_guid, instance_index, exit_status, exit_description,
               timestamp
        FROM app_events
        WHERE app_guid = $1
        ORDER BY timestamp, guid
        "#,
    )
    .bind(app_guid)
    .fetch_all(executor)
    .await?;
    Ok(rows.iter().map(map_app_event).collect())
}

fn map_app(row: &PgRow) -> Result<App, sqlx::Error> {
    let state: String = row.try_get("state")?;
    let package_state: String = row.try_get("package_state")?;
    Ok(App {
        guid: row.try_get("guid")?,
        space_guid: row.try_get("space_guid")?,
        stack_guid: row.try_get("stack_guid")?,
        name: row.try_get("name")?,
        production: row.try_get("production")?,
        memory: row.try_get("memory")?,
        instances: row.try_get("instances")?,
        state: AppState::parse(&state).map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
        package_state: PackageState::parse(&package_state)
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
        package_hash: row.try_get("package_hash")?,
        droplet_hash: row.try_get("droplet_hash")?,
        version: row.try_get("version")?,
        environment: row.try_get("environment")?,
        buildpack: row.try_get("buildpack")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_stack(row: &PgRow) -> Stack {
    Stack {
        guid: row.get("guid"),
        name: row.get("name"),
        description: row.get("description"),
    }
}

fn map_app_event(row: &PgRow) -> AppEvent {
    AppEvent {
        guid: row.get("guid"),
        app_guid: row.get("app_guid"),
        instance_guid: row.get("instance_guid"),
        instance_index: row.get("instance_index"),
        exit_status: row.get("exit_status"),
        exit_description: row.try_get("exit_description").ok().flatten(),
        timestamp: row.get("timestamp"),
    }
}
