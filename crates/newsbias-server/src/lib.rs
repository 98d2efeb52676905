//! NewsBias server — HTTP surface for ensemble bias scoring.
//!
//! Exposes reanalysis triggers, score reads and the SSE progress stream.

pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
