use uuid::Uuid;

use crate::actor::Actor;
use crate::db;
use crate::error::{CoreError, CoreResult, ValidationError};

use super::lifecycle::AppLifecycle;
use super::models::{AppEvent, NewAppEvent, Stack};

impl AppLifecycle {
    /// Crash or exit report from the placement layer. Events are removed with the app.
    pub async fn record_app_event(
        &self,
        app_guid: Uuid,
        event: NewAppEvent,
    ) -> CoreResult<AppEvent> {
        if event.instance_guid.trim().is_empty() {
            return Err(ValidationError::Missing {
                field: "instance_guid",
            }
            .into());
        }
        if event.instance_index < 0 {
            return Err(ValidationError::OutOfRange {
                field: "instance_index",
                expected: "zero or greater",
            }
            .into());
        }
        if db::apps::find(self.pool(), app_guid).await?.is_none() {
            return Err(CoreError::not_found("app", app_guid));
        }

        let recorded = db::apps::insert_app_event(self.pool(), app_guid, &event).await?;
        tracing::info!(
            %app_guid,
            instance_index = recorded.instance_index,
            exit_status = recorded.exit_status,
            "app event recorded"
        );
        Ok(recorded)
    }

    pub async fn app_events(&self, app_guid: Uuid) -> CoreResult<Vec<AppEvent>> {
        Ok(db::apps::app_events(self.pool(), app_guid).await?)
    }

    pub async fn register_stack(
        &self,
        actor: &Actor,
        name: &str,
        description: &str,
    ) -> CoreResult<Stack> {
        actor.require_admin("stacks")?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::Missing { field: "name" }.into());
        }
        match db::apps::insert_stack(self.pool(), name, description).await {
            Ok(stack) => Ok(stack),
            Err(err) if db::is_unique_violation(&err) => Err(ValidationError::NameTaken {
                field: "name",
                value: name.to_string(),
            }
            .into()),
            Err(err) => Err(err.into()),
        }
    }
}
