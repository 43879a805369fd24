use actix_web::{web, HttpResponse, Responder};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use crate::blockchain::{
    Block, CancelToken, Ledger, LedgerError, Payload, StoredTransaction, Transaction, VehicleNode,
};

use super::schema::DateTimeUtc;

/// Shared state behind every handler
pub struct AppState {
    /// The ledger all nodes write to
    pub ledger: Ledger,

    /// Registered vehicle nodes keyed by node id
    pub nodes: DashMap<String, VehicleNode>,

    /// Cancelled on shutdown to abandon in-flight proof searches
    pub shutdown: CancelToken,
}

impl AppState {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            nodes: DashMap::new(),
            shutdown: CancelToken::new(),
        }
    }
}

/// Data structure for the application state
pub type AppData = web::Data<AppState>;

/// A block together with its hash and a readable creation time
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BlockView {
    /// The block as stored
    pub block: Block,

    /// The block's hash, which its successor stores as `previous_hash`
    pub hash: String,

    /// The block's timestamp as a date
    pub created_at: Option<DateTimeUtc>,
}

impl From<Block> for BlockView {
    fn from(block: Block) -> Self {
        BlockView {
            hash: Ledger::hash(&block),
            created_at: block.created_at().map(DateTimeUtc::from),
            block,
        }
    }
}

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    pub chain: Vec<BlockView>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Request for the create node endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct CreateNodeRequest {
    /// Identifier of the new node
    pub node_id: String,

    /// Optional hex encoded 32 byte secret key; a random key is generated otherwise
    pub secret_key: Option<String>,
}

/// A registered node
#[derive(Serialize, Deserialize, ToSchema)]
pub struct NodeResponse {
    /// The node's identifier
    pub node_id: String,

    /// The node's hex encoded ed25519 public key
    pub public_key: String,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The sending node; it signs the payload
    pub node_id: String,

    /// Speed in km/h
    pub speed: u32,

    /// GPS location
    pub location: String,

    /// Emergency status
    pub emergency: bool,
}

/// Response for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    /// The message
    pub message: String,

    /// The transaction as recorded
    pub transaction: Transaction,

    /// Number of transactions waiting for the next block
    pub pending: usize,
}

/// Request for the verify endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct VerifyRequest {
    /// The node expected to have signed the transaction
    pub node_id: String,

    /// The transaction to check
    pub transaction: Transaction,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    /// The newly mined block
    pub block: BlockView,
}

/// Response for the validate endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ValidationResponse {
    /// Whether the chain is valid
    pub valid: bool,

    /// Index of the first failing block
    pub failed_index: Option<u64>,

    /// Why that block failed
    pub reason: Option<String>,
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> HttpResponse {
    error!("{}: {}", context, err);
    HttpResponse::InternalServerError().json(json!({
        "error": format!("{}: {}", context, err)
    }))
}

/// Get the full chain
///
/// Returns every block, its hash and the chain's validity
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Chain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(state: AppData) -> impl Responder {
    let chain = state.ledger.chain();
    let is_valid = state.ledger.is_chain_valid(&chain);

    let response = ChainResponse {
        length: chain.len(),
        chain: chain.into_iter().map(BlockView::from).collect(),
        is_valid,
    };

    HttpResponse::Ok().json(response)
}

/// Create a vehicle node
#[utoipa::path(
    post,
    path = "/api/v1/nodes",
    request_body = CreateNodeRequest,
    responses(
        (status = 201, description = "Node created successfully", body = NodeResponse),
        (status = 400, description = "Empty node id or invalid secret key"),
        (status = 409, description = "Node already exists")
    )
)]
pub async fn create_node(
    state: AppData,
    node_req: web::Json<CreateNodeRequest>,
) -> impl Responder {
    let node_id = node_req.node_id.trim();
    if node_id.is_empty() {
        return HttpResponse::BadRequest().json(json!({
            "error": "Enter a non-empty node ID."
        }));
    }

    let node = match &node_req.secret_key {
        None => VehicleNode::new(node_id),
        Some(secret_key) => {
            let bytes = match hex::decode(secret_key) {
                Ok(bytes) => bytes,
                Err(_) => {
                    return HttpResponse::BadRequest().json(json!({
                        "error": "Invalid secret key format. Must be a hex string."
                    }));
                }
            };
            match VehicleNode::from_secret_key(node_id, &bytes) {
                Ok(node) => node,
                Err(err) => {
                    return HttpResponse::BadRequest().json(json!({
                        "error": format!("Invalid secret key: {}", err)
                    }));
                }
            }
        }
    };

    match state.nodes.entry(node_id.to_string()) {
        Entry::Occupied(_) => HttpResponse::Conflict().json(json!({
            "error": format!("Node '{}' already exists", node_id)
        })),
        Entry::Vacant(entry) => {
            let response = NodeResponse {
                node_id: node.node_id().to_string(),
                public_key: node.public_key_hex(),
            };
            entry.insert(node);
            HttpResponse::Created().json(response)
        }
    }
}

/// List registered vehicle nodes
#[utoipa::path(
    get,
    path = "/api/v1/nodes",
    responses(
        (status = 200, description = "Nodes retrieved successfully", body = Vec<NodeResponse>)
    )
)]
pub async fn list_nodes(state: AppData) -> impl Responder {
    let mut nodes: Vec<NodeResponse> = state
        .nodes
        .iter()
        .map(|node| NodeResponse {
            node_id: node.node_id().to_string(),
            public_key: node.public_key_hex(),
        })
        .collect();
    nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    HttpResponse::Ok().json(nodes)
}

/// Get all pending transactions
///
/// Returns all transactions waiting to be included in a block
#[utoipa::path(
    get,
    path = "/api/v1/transactions/pending",
    responses(
        (status = 200, description = "Pending transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_pending_transactions(state: AppData) -> impl Responder {
    HttpResponse::Ok().json(state.ledger.pending_transactions())
}

/// Get the transaction audit log
#[utoipa::path(
    get,
    path = "/api/v1/transactions/history",
    responses(
        (status = 200, description = "Audit log retrieved successfully", body = Vec<StoredTransaction>),
        (status = 500, description = "Storage failure")
    )
)]
pub async fn get_transaction_history(state: AppData) -> impl Responder {
    match state.ledger.transaction_history() {
        Ok(history) => HttpResponse::Ok().json(history),
        Err(err) => internal_error("Failed to load transaction history", err),
    }
}

/// Send vehicle data
///
/// The node signs the payload and submits it to the pending pool
#[utoipa::path(
    post,
    path = "/api/v1/transactions/new",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction added to pending pool", body = TransactionResponse),
        (status = 404, description = "Unknown node"),
        (status = 500, description = "Storage failure")
    )
)]
pub async fn new_transaction(
    state: AppData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    let (sender, payload, signature) = {
        let node = match state.nodes.get(&transaction_req.node_id) {
            Some(node) => node,
            None => {
                return HttpResponse::NotFound().json(json!({
                    "error": format!("Node '{}' not found", transaction_req.node_id)
                }));
            }
        };

        let mut payload = Payload::new();
        payload.insert("speed".to_string(), json!(transaction_req.speed));
        payload.insert("location".to_string(), json!(transaction_req.location));
        payload.insert("emergency".to_string(), json!(transaction_req.emergency));

        let signature = node.sign_payload(&payload);
        (node.node_id().to_string(), payload, signature)
    };

    match state.ledger.submit_transaction(&sender, payload, &signature) {
        Ok(transaction) => {
            let response = TransactionResponse {
                message: "Transaction added to pending pool.".to_string(),
                transaction,
                pending: state.ledger.pending_transactions().len(),
            };

            HttpResponse::Created().json(response)
        }
        Err(err) => internal_error("Failed to add transaction", err),
    }
}

/// Verify a transaction's signature
///
/// Checks the signature against the named node's public key
#[utoipa::path(
    post,
    path = "/api/v1/transactions/verify",
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Verification result"),
        (status = 400, description = "Malformed signature"),
        (status = 404, description = "Unknown node")
    )
)]
pub async fn verify_transaction(
    state: AppData,
    verify_req: web::Json<VerifyRequest>,
) -> impl Responder {
    let node = match state.nodes.get(&verify_req.node_id) {
        Some(node) => node,
        None => {
            return HttpResponse::NotFound().json(json!({
                "error": format!("Node '{}' not found", verify_req.node_id)
            }));
        }
    };

    match node.verify_transaction(&verify_req.transaction) {
        Ok(valid) => HttpResponse::Ok().json(json!({ "valid": valid })),
        Err(err) => HttpResponse::BadRequest().json(json!({
            "error": format!("Failed to verify transaction: {}", err)
        })),
    }
}

/// Mine a new block
///
/// Creates a new block with all pending transactions
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 503, description = "Mining cancelled by shutdown"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn mine_block(state: AppData) -> impl Responder {
    let ledger = state.ledger.clone();
    let cancel = state.shutdown.clone();

    // proof search is CPU bound, keep it off the async workers
    match web::block(move || ledger.mine_block_with_cancel(&cancel)).await {
        Ok(Ok(block)) => {
            let response = MineResponse {
                message: "New block mined!".to_string(),
                block: block.into(),
            };

            HttpResponse::Ok().json(response)
        }
        Ok(Err(LedgerError::Cancelled)) => HttpResponse::ServiceUnavailable().json(json!({
            "error": "Mining cancelled"
        })),
        Ok(Err(err)) => internal_error("Failed to mine block", err),
        Err(err) => internal_error("Mining task failed", err),
    }
}

/// Check if the chain is valid
///
/// Validates the entire chain and names the first failing block
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Chain validation status", body = ValidationResponse)
    )
)]
pub async fn validate_chain(state: AppData) -> impl Responder {
    let response = match state.ledger.validate() {
        Ok(()) => ValidationResponse {
            valid: true,
            failed_index: None,
            reason: None,
        },
        Err(err) => ValidationResponse {
            valid: false,
            failed_index: Some(err.index),
            reason: Some(err.fault.to_string()),
        },
    };

    HttpResponse::Ok().json(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::{LedgerStorage, ProofEngine};
    use actix_web::{http::StatusCode, test, App};

    fn test_state() -> AppData {
        let storage = LedgerStorage::temporary().unwrap();
        let ledger = Ledger::initialize_with_engine(storage, ProofEngine::new(2)).unwrap();
        web::Data::new(AppState::new(ledger))
    }

    macro_rules! test_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .configure(configure_routes),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_send_mine_and_validate() {
        let state = test_state();
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/nodes")
            .set_json(json!({ "node_id": "V1" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/new")
            .set_json(json!({
                "node_id": "V1",
                "speed": 80,
                "location": "48.85,2.35",
                "emergency": false
            }))
            .to_request();
        let resp: TransactionResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.pending, 1);
        assert_eq!(resp.transaction.payload["speed"], json!(80));

        let req = test::TestRequest::post().uri("/api/v1/mine").to_request();
        let resp: MineResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.block.block.index, 2);
        assert_eq!(resp.block.block.transactions.len(), 1);

        let req = test::TestRequest::get().uri("/api/v1/validate").to_request();
        let resp: ValidationResponse = test::call_and_read_body_json(&app, req).await;
        assert!(resp.valid);
        assert!(resp.failed_index.is_none());

        let req = test::TestRequest::get().uri("/api/v1/chain").to_request();
        let resp: ChainResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.length, 2);
        assert!(resp.is_valid);
        assert_eq!(resp.chain[1].block.previous_hash, resp.chain[0].hash);

        let req = test::TestRequest::get()
            .uri("/api/v1/transactions/history")
            .to_request();
        let resp: Vec<StoredTransaction> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.len(), 1);
        assert_eq!(resp[0].id, 1);
    }

    #[actix_web::test]
    async fn test_node_registration_rules() {
        let state = test_state();
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/nodes")
            .set_json(json!({ "node_id": "  " }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let req = test::TestRequest::post()
                .uri("/api/v1/nodes")
                .set_json(json!({ "node_id": "V1" }))
                .to_request();
            assert_eq!(test::call_service(&app, req).await.status(), expected);
        }

        let req = test::TestRequest::post()
            .uri("/api/v1/nodes")
            .set_json(json!({ "node_id": "V2", "secret_key": "zz" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/api/v1/nodes").to_request();
        let resp: Vec<NodeResponse> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.len(), 1);
        assert_eq!(resp[0].node_id, "V1");
    }

    #[actix_web::test]
    async fn test_unknown_node_is_not_found() {
        let state = test_state();
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/new")
            .set_json(json!({
                "node_id": "ghost",
                "speed": 10,
                "location": "",
                "emergency": true
            }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
        assert!(state.ledger.pending_transactions().is_empty());
    }

    #[actix_web::test]
    async fn test_verify_endpoint() {
        let state = test_state();
        let app = test_app!(state);

        let node = VehicleNode::new("V1");
        state.nodes.insert("V1".to_string(), node.clone());

        let mut payload = Payload::new();
        payload.insert("speed".to_string(), json!(55));
        let signature = node.sign_payload(&payload);
        let transaction = state
            .ledger
            .submit_transaction("V1", payload, &signature)
            .unwrap();

        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/verify")
            .set_json(json!({ "node_id": "V1", "transaction": transaction }))
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["valid"], json!(true));
    }

    #[actix_web::test]
    async fn test_mine_after_shutdown_is_cancelled() {
        let storage = LedgerStorage::temporary().unwrap();
        let ledger = Ledger::initialize_with_engine(storage, ProofEngine::new(16)).unwrap();
        let state = web::Data::new(AppState::new(ledger));
        state.shutdown.cancel();
        let app = test_app!(state);

        let req = test::TestRequest::post().uri("/api/v1/mine").to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(state.ledger.len(), 1);
    }
}
