use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/nodes", web::get().to(handlers::list_nodes))
            .route("/nodes", web::post().to(handlers::create_node))
            .route("/transactions/pending", web::get().to(handlers::get_pending_transactions))
            .route("/transactions/history", web::get().to(handlers::get_transaction_history))
            .route("/transactions/new", web::post().to(handlers::new_transaction))
            .route("/transactions/verify", web::post().to(handlers::verify_transaction))
            .route("/mine", web::post().to(handlers::mine_block))
            .route("/validate", web::get().to(handlers::validate_chain))
    );
}
