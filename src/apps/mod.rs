//! Application lifecycle: run and package state, versioning, admission, billing and
//! placement intents for every committed transition.

mod events;
pub mod lifecycle;
pub mod models;
pub mod routes;
pub mod transition;

pub use lifecycle::{Accepted, AppLifecycle};
pub use models::{
    App, AppChanges, AppEvent, AppState, NewApp, NewAppEvent, PackageState, Route, Stack,
};
pub use routes::RouteChange;
pub use transition::{plan, TransitionPlan};
