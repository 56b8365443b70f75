use serde_json::Value;
use sqlx::{postgres::PgRow, Executor, PgConnection, Postgres, Row};
use uuid::Uuid;

use crate::config;
use crate::service_instances::gateway::GatewayAttributes;
use crate::service_instances::models::{
    PlanOffering, Service, ServiceBinding, ServiceInstance, ServicePlan,
};

const SERVICE_COLUMNS: &str =
    "guid, label, provider, version, url, description, auth_token, timeout_secs, active, unique_id";
const PLAN_COLUMNS: &str = "guid, service_guid, name, description, free, unique_id, public";

/// Instance columns with credentials decrypted using the key bound at `$key_param`.
fn instance_columns(key_param: usize) -> String {
    format!(
        "guid, space_guid, service_plan_guid, name, gateway_name, gateway_data, \
         pgp_sym_decrypt(credentials, ${key_param})::jsonb AS credentials, dashboard_url, created_at"
    )
}

fn binding_columns(key_param: usize) -> String {
    format!(
        "guid, app_guid, service_instance_guid, gateway_name, gateway_data, \
         pgp_sym_decrypt(credentials, ${key_param})::jsonb AS credentials, binding_options, created_at"
    )
}

fn encryption_key() -> &'static str {
    config::CREDENTIALS_ENCRYPTION_KEY.as_str()
}

#[derive(Debug, Clone)]
pub struct InsertService<'a> {
    pub label: &'a str,
    pub provider: &'a str,
    pub version: &'a str,
    pub url: &'a str,
    pub description: &'a str,
    pub auth_token: Option<&'a str>,
    pub timeout_secs: Option<i32>,
    pub active: bool,
    pub unique_id: &'a str,
}

pub async fn insert_service<'c, E>(executor: E, input: InsertService<'_>) -> Result<Service, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO services (
            guid, label, provider, version, url, description, auth_token, timeout_secs, active,
            unique_id
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING {SERVICE_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(input.label)
    .bind(input.provider)
    .bind(input.version)
    .bind(input.url)
    .bind(input.description)
    .bind(input.auth_token)
    .bind(input.timeout_secs)
    .bind(input.active)
    .bind(input.unique_id)
    .fetch_one(executor)
    .await?;
    Ok(map_service(&row, ""))
}

pub async fn find_service<'c, E>(executor: E, guid: Uuid) -> Result<Option<Service>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!("SELECT {SERVICE_COLUMNS} FROM services WHERE guid = $1"))
        .bind(guid)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|row| map_service(&row, "")))
}

#[derive(Debug, Clone)]
pub struct InsertServicePlan<'a> {
    pub service_guid: Uuid,
    pub name: &'a str,
    pub description: &'a str,
    pub free: bool,
    pub unique_id: &'a str,
    pub public: bool,
}

pub async fn insert_plan<'c, E>(
    executor: E,
    input: InsertServicePlan<'_>,
) -> Result<ServicePlan, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO service_plans (guid, service_guid, name, description, free, unique_id, public)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {PLAN_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(input.service_guid)
    .bind(input.name)
    .bind(input.description)
    .bind(input.free)
    .bind(input.unique_id)
    .bind(input.public)
    .fetch_one(executor)
    .await?;
    Ok(map_plan(&row, ""))
}

/// Plan together with its service.
pub async fn find_offering<'c, E>(
    executor: E,
    plan_guid: Uuid,
) -> Result<Option<PlanOffering>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        SELECT
            p.guid AS plan_guid, p.service_guid AS plan_service_guid, p.name AS plan_name,
            p.description AS plan_description, p.free AS plan_free,
            p.unique_id AS plan_unique_id, p.public AS plan_public,
            s.guid AS service_guid, s.label AS service_label, s.provider AS service_provider,
            s.version AS service_version, s.url AS service_url,
            s.description AS service_description, s.auth_token AS service_auth_token,
            s.timeout_secs AS service_timeout_secs, s.active AS service_active,
            s.unique_id AS service_unique_id
        FROM service_plans p
        JOIN services s ON s.guid = p.service_guid
        WHERE p.guid = $1
        "#,
    )
    .bind(plan_guid)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|row| PlanOffering {
        plan: map_plan(&row, "plan_"),
        service: map_service(&row, "service_"),
    }))
}

pub async fn instance_name_taken<'c, E>(
    executor: E,
    space_guid: Uuid,
    name: &str,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM service_instances WHERE space_guid = $1 AND LOWER(name) = LOWER($2))",
    )
    .bind(space_guid)
    .bind(name)
    .fetch_one(executor)
    .await
}

pub async fn insert_instance<'c, E>(
    executor: E,
    guid: Uuid,
    space_guid: Uuid,
    service_plan_guid: Uuid,
    name: &str,
    attributes: &GatewayAttributes,
) -> Result<ServiceInstance, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO service_instances (
            guid, space_guid, service_plan_guid, name, gateway_name, gateway_data, credentials,
            dashboard_url
        ) VALUES ($1, $2, $3, $4, $5, $6, pgp_sym_encrypt($7, $9), $8)
        RETURNING {}
        "#,
        instance_columns(9)
    ))
    .bind(guid)
    .bind(space_guid)
    .bind(service_plan_guid)
    .bind(name)
    .bind(&attributes.service_id)
    .bind(&attributes.configuration)
    .bind(attributes.credentials.to_string())
    .bind(&attributes.dashboard_url)
    .bind(encryption_key())
    .fetch_one(executor)
    .await?;
    Ok(map_instance(&row))
}

pub async fn find_instance<'c, E>(
    executor: E,
    guid: Uuid,
) -> Result<Option<ServiceInstance>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        "SELECT {} FROM service_instances WHERE guid = $1",
        instance_columns(2)
    ))
    .bind(guid)
    .bind(encryption_key())
    .fetch_optional(executor)
    .await?;
    Ok(row.map(|row| map_instance(&row)))
}

pub async fn lock_instance(
    conn: &mut PgConnection,
    guid: Uuid,
) -> Result<Option<ServiceInstance>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM service_instances WHERE guid = $1 FOR UPDATE",
        instance_columns(2)
    ))
    .bind(guid)
    .bind(encryption_key())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|row| map_instance(&row)))
}

pub async fn organization_of_instance<'c, E>(
    executor: E,
    guid: Uuid,
) -> Result<Option<Uuid>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        r#"
        SELECT s.organization_guid
        FROM service_instances si
        JOIN spaces s ON s.guid = si.space_guid
        WHERE si.guid = $1
        "#,
    )
    .bind(guid)
    .fetch_optional(executor)
    .await
}

pub async fn instances_in_organization<'c, E>(
    executor: E,
    organization_guid: Uuid,
) -> Result<Vec<ServiceInstance>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(&format!(
        r#"
        SELECT {}
        FROM service_instances
        WHERE space_guid IN (SELECT guid FROM spaces WHERE organization_guid = $1)
        ORDER BY created_at, guid
        "#,
        instance_columns(2)
    ))
    .bind(organization_guid)
    .bind(encryption_key())
    .fetch_all(executor)
    .await?;
    Ok(rows.iter().map(map_instance).collect())
}

pub async fn delete_instance<'c, E>(executor: E, guid: Uuid) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("DELETE FROM service_instances WHERE guid = $1")
        .bind(guid)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn binding_exists<'c, E>(
    executor: E,
    app_guid: Uuid,
    service_instance_guid: Uuid,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM service_bindings WHERE app_guid = $1 AND service_instance_guid = $2)",
    )
    .bind(app_guid)
    .bind(service_instance_guid)
    .fetch_one(executor)
    .await
}

pub async fn insert_binding<'c, E>(
    executor: E,
    guid: Uuid,
    app_guid: Uuid,
    service_instance_guid: Uuid,
    attributes: &GatewayAttributes,
    binding_options: &Value,
) -> Result<ServiceBinding, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO service_bindings (
            guid, app_guid, service_instance_guid, gateway_name, gateway_data, credentials,
            binding_options
        ) VALUES ($1, $2, $3, $4, $5, pgp_sym_encrypt($6, $8), $7)
        RETURNING {}
        "#,
        binding_columns(8)
    ))
    .bind(guid)
    .bind(app_guid)
    .bind(service_instance_guid)
    .bind(&attributes.service_id)
    .bind(&attributes.configuration)
    .bind(attributes.credentials.to_string())
    .bind(binding_options)
    .bind(encryption_key())
    .fetch_one(executor)
    .await?;
    Ok(map_binding(&row))
}

pub async fn find_binding<'c, E>(
    executor: E,
    guid: Uuid,
) -> Result<Option<ServiceBinding>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        "SELECT {} FROM service_bindings WHERE guid = $1",
        binding_columns(2)
    ))
    .bind(guid)
    .bind(encryption_key())
    .fetch_optional(executor)
    .await?;
    Ok(row.map(|row| map_binding(&row)))
}

pub async fn bindings_for_app<'c, E>(
    executor: E,
    app_guid: Uuid,
) -> Result<Vec<ServiceBinding>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(&format!(
        "SELECT {} FROM service_bindings WHERE app_guid = $1 ORDER BY created_at, guid",
        binding_columns(2)
    ))
    .bind(app_guid)
    .bind(encryption_key())
    .fetch_all(executor)
    .await?;
    Ok(rows.iter().map(map_binding).collect())
}

pub async fn bindings_for_instance<'c, E>(
    executor: E,
    service_instance_guid: Uuid,
) -> Result<Vec<ServiceBinding>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(&format!(
        "SELECT {} FROM service_bindings WHERE service_instance_guid = $1 ORDER BY created_at, guid",
        binding_columns(2)
    ))
    .bind(service_instance_guid)
    .bind(encryption_key())
    .fetch_all(executor)
    .await?;
    Ok(rows.iter().map(map_binding).collect())
}

pub async fn delete_binding<'c, E>(executor: E, guid: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query("DELETE FROM service_bindings WHERE guid = $1")
        .bind(guid)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

fn map_service(row: &PgRow, prefix: &str) -> Service {
    let column = |name: &str| format!("{prefix}{name}");
    Service {
        guid: row.get(column("guid").as_str()),
        label: row.get(column("label").as_str()),
        provider: row.get(column("provider").as_str()),
        version: row.get(column("version").as_str()),
        url: row.get(column("url").as_str()),
        description: row.get(column("description").as_str()),
        auth_token: row.try_get(column("auth_token").as_str()).ok().flatten(),
        timeout_secs: row.try_get(column("timeout_secs").as_str()).ok().flatten(),
        active: row.get(column("active").as_str()),
        unique_id: row.get(column("unique_id").as_str()),
    }
}

fn map_plan(row: &PgRow, prefix: &str) -> ServicePlan {
    let column = |name: &str| format!("{prefix}{name}");
    ServicePlan {
        guid: row.get(column("guid").as_str()),
        service_guid: row.get(column("service_guid").as_str()),
        name: row.get(column("name").as_str()),
        description: row.get(column("description").as_str()),
        free: row.get(column("free").as_str()),
        unique_id: row.get(column("unique_id").as_str()),
        public: row.get(column("public").as_str()),
    }
}

fn map_instance(row: &PgRow) -> ServiceInstance {
    ServiceInstance {
        guid: row.get("guid"),
        space_guid: row.get("space_guid"),
        service_plan_guid: row.get("service_plan_guid"),
        name: row.get("name"),
        gateway_name: row.try_get("gateway_name").ok().flatten(),
        gateway_data: row.try_get("gateway_data").ok().flatten(),
        credentials: row.get("credentials"),
        dashboard_url: row.try_get("dashboard_url").ok().flatten(),
        created_at: row.get("created_at"),
    }
}

fn map_binding(row: &PgRow) -> ServiceBinding {
    ServiceBinding {
        guid: row.get("guid"),
        app_guid: row.get("app_guid"),
        service_instance_guid: row.get("service_instance_guid"),
        gateway_name: row.get("gateway_name"),
        gateway_data: row.try_get("gateway_data").ok().flatten(),
        credentials: row.get("credentials"),
        binding_options: row.get("binding_options"),
        created_at: row.get("created_at"),
    }
}
