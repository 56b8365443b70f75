use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::actor::Actor;
use crate::db;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::placement::{self, PlacementIntent};

use super::lifecycle::{lock_app, AppLifecycle, LockedApp};
use super::models::{App, Route};

static HOST_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w\-]*$").expect("invalid regex"));

/// Outcome of a route relationship change. `changed` is false when the link was already in
/// the requested state.
#[derive(Debug, Clone)]
pub struct RouteChange {
    pub changed: bool,
    pub intents: Vec<PlacementIntent>,
}

fn validate_route(host: &str, domain: &str) -> Result<(), ValidationError> {
    if !HOST_PATTERN.is_match(host) {
        return Err(ValidationError::OutOfRange {
            field: "host",
            expected: "letters, digits, underscores or hyphens",
        });
    }
    if domain.trim().is_empty() {
        return Err(ValidationError::Missing { field: "domain" });
    }
    Ok(())
}

fn update_routes_intent(app: &App) -> Option<PlacementIntent> {
    (app.is_started() && app.is_staged()).then(|| PlacementIntent::UpdateRoutes {
        app_guid: app.guid,
        version: app.version,
    })
}

impl AppLifecycle {
    pub async fn create_route(
        &self,
        actor: &Actor,
        space_guid: Uuid,
        host: &str,
        domain: &str,
    ) -> CoreResult<Route> {
        let host = host.trim().to_lowercase();
        let domain = domain.trim().to_lowercase();
        validate_route(&host, &domain)?;

        if db::organizations::find_space(self.pool(), space_guid)
            .await?
            .is_none()
        {
            return Err(CoreError::not_found("space", space_guid));
        }

        let route = match db::routes::insert(self.pool(), space_guid, &host, &domain).await {
            Ok(route) => route,
            Err(err) if db::is_unique_violation(&err) => {
                return Err(ValidationError::NameTaken {
                    field: "host",
                    value: format!("{host}.{domain}"),
                }
                .into())
            }
            Err(err) => return Err(err.into()),
        };

        tracing::info!(route_guid = %route.guid, %space_guid, actor = %actor.log_ref(), "route created");
        Ok(route)
    }

    pub async fn add_route(
        &self,
        actor: &Actor,
        app_guid: Uuid,
        route_guid: Uuid,
    ) -> CoreResult<RouteChange> {
        let mut tx = self.pool().begin().await?;
        let LockedApp { app, .. } = lock_app(&mut *tx, app_guid).await?;
        let route = db::routes::find(&mut *tx, route_guid)
            .await?
            .ok_or_else(|| CoreError::not_found("route", route_guid))?;
        if route.space_guid != app.space_guid {
            return Err(ValidationError::InvalidRelation(format!(
                "The URL was not available [route ID {route_guid}]"
            ))
            .into());
        }

        let changed = db::routes::attach(&mut *tx, app_guid, route_guid).await?;
        let intents: Vec<_> = if changed {
            update_routes_intent(&app).into_iter().collect()
        } else {
            Vec::new()
        };
        placement::enqueue_all(&mut *tx, &intents).await?;
        tx.commit().await?;

        tracing::info!(
            %app_guid,
            %route_guid,
            fqdn = %route.fqdn(),
            changed,
            actor = %actor.log_ref(),
            "route added"
        );
        Ok(RouteChange { changed, intents })
    }

    pub async fn remove_route(
        &self,
        actor: &Actor,
        app_guid: Uuid,
        route_guid: Uuid,
    ) -> CoreResult<RouteChange> {
        let mut tx = self.pool().begin().await?;
        let LockedApp { app, .. } = lock_app(&mut *tx, app_guid).await?;

        let changed = db::routes::detach(&mut *tx, app_guid, route_guid).await?;
        let intents: Vec<_> = if changed {
            update_routes_intent(&app).into_iter().collect()
        } else {
            Vec::new()
        };
        placement::enqueue_all(&mut *tx, &intents).await?;
        tx.commit().await?;

        tracing::info!(%app_guid, %route_guid, changed, actor = %actor.log_ref(), "route removed");
        Ok(RouteChange { changed, intents })
    }

    pub async fn routes(&self, app_guid: Uuid) -> CoreResult<Vec<Route>> {
        Ok(db::routes::for_app(self.pool(), app_guid).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_are_restricted_to_word_characters() {
        assert!(validate_route("my-app_1", "example.com").is_ok());
        assert!(validate_route("", "example.com").is_ok());
        assert!(matches!(
            validate_route("my.app", "example.com"),
            Err(ValidationError::OutOfRange { field: "host", .. })
        ));
        assert_eq!(
            validate_route("app", "  "),
            Err(ValidationError::Missing { field: "domain" })
        );
    }
}
