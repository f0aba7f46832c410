//! fleetgrid-api — management API for fleetgrid.
//!
//! Reads come straight from the registry. Mutations go through the same
//! registry, autoscaler, and lifecycle calls the daemon itself uses, so
//! the API is bound by the same invariants. Group definitions are
//! persisted to the [`GroupStore`].
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/groups` | List groups |
//! | POST | `/api/v1/groups` | Create a group |
//! | GET | `/api/v1/groups/{name}` | Group with instances, alerts, terminations |
//! | DELETE | `/api/v1/groups/{name}` | Delete an empty group |
//! | PUT | `/api/v1/groups/{name}/policy` | Replace the scaling policy |
//! | POST | `/api/v1/groups/{name}/scale` | Scale to `{target}` instances |
//! | POST | `/api/v1/groups/{name}/pause` | Suspend automatic scaling |
//! | POST | `/api/v1/groups/{name}/resume` | Resume automatic scaling |
//! | GET | `/api/v1/instances/{id}` | Instance state and last error |
//! | POST | `/api/v1/instances/{id}/terminate` | Drain and remove an instance |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post, put};
use fleetgrid_autoscale::Autoscaler;
use fleetgrid_lifecycle::LifecycleController;
use fleetgrid_state::{GroupStore, Registry};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Registry,
    pub store: GroupStore,
    pub lifecycle: LifecycleController,
    pub autoscaler: Autoscaler,
}

/// Build the API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/groups", get(handlers::list_groups).post(handlers::create_group))
        .route("/groups/{name}", get(handlers::get_group).delete(handlers::delete_group))
        .route("/groups/{name}/policy", put(handlers::update_policy))
        .route("/groups/{name}/scale", post(handlers::scale_group))
        .route("/groups/{name}/pause", post(handlers::pause_group))
        .route("/groups/{name}/resume", post(handlers::resume_group))
        .route("/instances/{id}", get(handlers::get_instance))
        .route("/instances/{id}/terminate", post(handlers::terminate_instance))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
