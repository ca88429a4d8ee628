pub mod handlers;
pub mod middleware;
pub mod requests;
pub mod responses;
pub mod routes;

pub use middleware::{idempotency_middleware, into_stored_response};
pub use routes::{create_router, AppState};
