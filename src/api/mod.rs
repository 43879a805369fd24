// API module
//
// Thin HTTP layer through which vehicle nodes use the ledger

pub mod handlers;
pub mod routes;
pub mod schema;
pub mod shutdown;

// Re-export main components for easier access
pub use handlers::AppState;
pub use routes::configure_routes;
pub use shutdown::install_signal_handlers;
