use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use vehicle_ledger::config::Config;
use vehicle_ledger::{api, blockchain};

// Open storage and rebuild the ledger from it
fn initialize_ledger(config: &Config) -> anyhow::Result<blockchain::Ledger> {
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.data_dir.display())
    })?;

    let storage = blockchain::LedgerStorage::open(&config.data_dir).with_context(|| {
        format!("Failed to open ledger storage at {}", config.data_dir.display())
    })?;

    let engine = blockchain::ProofEngine::new(config.difficulty);
    let ledger = blockchain::Ledger::initialize_with_engine(storage, engine)
        .context("Failed to load ledger from storage")?;

    info!(
        "Ledger ready at {} with {} blocks (difficulty {})",
        config.data_dir.display(),
        ledger.len(),
        ledger.difficulty()
    );
    Ok(ledger)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::create_node,
        api::handlers::list_nodes,
        api::handlers::get_pending_transactions,
        api::handlers::get_transaction_history,
        api::handlers::new_transaction,
        api::handlers::verify_transaction,
        api::handlers::mine_block,
        api::handlers::validate_chain
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::StoredTransaction,
            api::schema::DateTimeUtc,
            api::handlers::BlockView,
            api::handlers::ChainResponse,
            api::handlers::CreateNodeRequest,
            api::handlers::NodeResponse,
            api::handlers::TransactionRequest,
            api::handlers::TransactionResponse,
            api::handlers::VerifyRequest,
            api::handlers::MineResponse,
            api::handlers::ValidationResponse
        )
    ),
    tags(
        (name = "ledger", description = "Vehicle ledger API endpoints")
    ),
    info(
        title = "Vehicle Ledger API",
        version = "0.1.0",
        description = "Proof-of-work ledger for vehicle-to-vehicle messages",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env()?;
    let state = web::Data::new(api::AppState::new(initialize_ledger(&config)?));
    let shutdown = state.shutdown.clone();

    info!("Starting HTTP server at http://{}:{}", config.bind_addr, config.port);

    let server = HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .disable_signals()
    .bind((config.bind_addr.as_str(), config.port))?
    .run();

    api::install_signal_handlers(shutdown, server.handle())?;

    server.await?;
    Ok(())
}
