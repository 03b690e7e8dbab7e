//! HTTP API
//!
//! - POST /addresses         - issue a deposit address (rate limited)
//! - GET  /addresses/{owner} - addresses and observed balances for an owner
//! - POST /withdrawals       - queue a holder-signed withdrawal (rate limited)
//! - GET  /withdrawals/{id}  - withdrawal record
//! - POST /reconcile         - retry failed mints, list in-flight withdrawals
//!                             (admin token, rate limited)
//! - GET  /health, /status, /metrics

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, PrimitiveSignature};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::metrics;
use crate::rate_limit::RateLimiter;
use crate::service::ServiceHandle;
use crate::source::address::validate_address;
use crate::source::Network;
use crate::types::{PendingWithdrawal, WithdrawalRequest, WithdrawalSource};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub handle: ServiceHandle,
    pub limiter: Arc<RateLimiter>,
    pub network: Network,
    pub dust_threshold: u64,
    pub operator_address: String,
    pub started_at: Instant,
    /// Bearer token for operator endpoints; `None` disables them
    pub admin_token: Option<String>,
    pub signature_max_age: Duration,
}

/// [`BridgeError`] rendered as a JSON error body
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

pub fn status_for(error: &BridgeError) -> StatusCode {
    match error {
        BridgeError::InvalidAddress(_)
        | BridgeError::InvalidAmount(_)
        | BridgeError::InvalidTransaction(_)
        | BridgeError::DustThreshold { .. } => StatusCode::BAD_REQUEST,
        BridgeError::AlreadyProcessed(_) => StatusCode::CONFLICT,
        BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
        BridgeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        BridgeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        BridgeError::CircuitOpen { .. } | BridgeError::Rpc(_) | BridgeError::Timeout(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = Json(ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
        });
        let mut response = (status, body).into_response();

        if let BridgeError::RateLimited { retry_after_ms } = self.0 {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

fn parse_evm_address(raw: &str, field: &str) -> Result<Address, BridgeError> {
    Address::from_str(raw.trim())
        .map_err(|_| BridgeError::InvalidAddress(format!("{} must be an EVM address", field)))
}

/// Check `Authorization: Bearer <token>` against the configured admin token
fn require_admin(admin_token: Option<&str>, headers: &HeaderMap) -> Result<(), BridgeError> {
    let Some(expected) = admin_token else {
        return Err(BridgeError::Unauthorized("operator endpoints are disabled".to_string()));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    // Compare every byte so timing does not reveal the matching prefix
    let matches = presented.len() == expected.len()
        && presented
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
    if matches {
        Ok(())
    } else {
        Err(BridgeError::Unauthorized("invalid admin token".to_string()))
    }
}

async fn rate_limit(state: &AppState, peer: SocketAddr, endpoint: &str) -> Result<(), BridgeError> {
    let key = peer.ip().to_string();
    state.limiter.check(&key).await.inspect_err(|_| {
        debug!(client = %key, endpoint, "Request rate limited");
        metrics::RATE_LIMITED.with_label_values(&[endpoint]).inc();
    })
}

// ============================================================================
// Deposit addresses
// ============================================================================

#[derive(Deserialize)]
pub struct CreateAddressRequest {
    pub owner_id: String,
}

#[derive(Serialize)]
struct CreateAddressResponse {
    address: String,
    owner_id: String,
    network: Network,
}

async fn create_address(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<CreateAddressRequest>,
) -> ApiResult<(StatusCode, Json<CreateAddressResponse>)> {
    rate_limit(&state, peer, "addresses").await?;
    // Mints go to the owner, so it has to be a settlement-chain account
    let owner = parse_evm_address(&body.owner_id, "owner_id")?;
    let owner_id = owner.to_checksum(None);

    let address = state.handle.create_deposit_address(&owner_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateAddressResponse {
            address,
            owner_id,
            network: state.network,
        }),
    ))
}

#[derive(Serialize)]
struct AddressInfo {
    address: String,
    observed_balance: u64,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct OwnerAddressesResponse {
    owner_id: String,
    addresses: Vec<AddressInfo>,
}

async fn list_addresses(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<Json<OwnerAddressesResponse>> {
    let owner_id = parse_evm_address(&owner, "owner")?.to_checksum(None);

    let mut addresses = Vec::new();
    for address in state.handle.addresses.get_user_addresses(&owner_id).await {
        if let Some(details) = state.handle.addresses.get_address_details(&address).await {
            addresses.push(AddressInfo {
                address: details.address,
                observed_balance: details.observed_balance,
                created_at: details.created_at,
            });
        }
    }

    Ok(Json(OwnerAddressesResponse { owner_id, addresses }))
}

// ============================================================================
// Withdrawals
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawalBody {
    /// Settlement account whose tokens are burned
    pub requester: String,
    pub recipient_address: String,
    pub amount_units: u64,
    /// Unix milliseconds, part of the signed message
    pub timestamp: i64,
    /// 65-byte hex EIP-191 signature by `requester` over [`withdrawal_message`]
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalAccepted {
    pub withdrawal_id: String,
    pub status: &'static str,
}

/// Message the holder signs (EIP-191 `personal_sign`) to authorise a payout
pub fn withdrawal_message(
    requester: &Address,
    recipient_address: &str,
    amount_units: u64,
    timestamp_ms: i64,
) -> String {
    format!(
        "doge-bridge withdrawal\nrequester: {}\nrecipient: {}\namount: {}\ntimestamp: {}",
        requester.to_checksum(None),
        recipient_address,
        amount_units,
        timestamp_ms
    )
}

/// Validate a withdrawal body and check that `requester` signed it.
///
/// The signed timestamp becomes the request time, so a replayed body maps to
/// the same withdrawal id and is rejected as a duplicate.
pub fn authorize_withdrawal(
    body: &WithdrawalBody,
    network: Network,
    dust_threshold: u64,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<WithdrawalRequest, BridgeError> {
    let requester = parse_evm_address(&body.requester, "requester")?;
    if body.amount_units == 0 {
        return Err(BridgeError::InvalidAmount("amount_units must be positive".to_string()));
    }
    if body.amount_units < dust_threshold {
        return Err(BridgeError::DustThreshold {
            amount: body.amount_units,
            threshold: dust_threshold,
        });
    }
    let recipient_address = body.recipient_address.trim();
    validate_address(recipient_address, network)?;

    let requested_at = Utc
        .timestamp_millis_opt(body.timestamp)
        .single()
        .ok_or_else(|| BridgeError::Unauthorized("invalid timestamp".to_string()))?;
    let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::minutes(5));
    let age = now - requested_at;
    if age > max_age || -age > max_age {
        return Err(BridgeError::Unauthorized("signature expired".to_string()));
    }

    let raw = hex::decode(body.signature.trim().trim_start_matches("0x"))
        .map_err(|_| BridgeError::Unauthorized("signature is not hex".to_string()))?;
    let signature = PrimitiveSignature::from_raw(&raw)
        .map_err(|e| BridgeError::Unauthorized(format!("malformed signature: {}", e)))?;
    let message = withdrawal_message(&requester, recipient_address, body.amount_units, body.timestamp);
    let signer = signature
        .recover_address_from_msg(message.as_bytes())
        .map_err(|e| BridgeError::Unauthorized(format!("unrecoverable signature: {}", e)))?;
    if signer != requester {
        return Err(BridgeError::Unauthorized("signature does not match requester".to_string()));
    }

    Ok(WithdrawalRequest {
        source: WithdrawalSource::Api,
        requester: requester.to_checksum(None),
        recipient_address: recipient_address.to_string(),
        amount_units: body.amount_units,
        requested_at,
    })
}

pub async fn submit_withdrawal(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<WithdrawalBody>,
) -> ApiResult<(StatusCode, Json<WithdrawalAccepted>)> {
    rate_limit(&state, peer, "withdrawals").await?;

    let request = authorize_withdrawal(
        &body,
        state.network,
        state.dust_threshold,
        state.signature_max_age,
        Utc::now(),
    )
    .inspect_err(|e| {
        if matches!(e, BridgeError::Unauthorized(_)) {
            warn!(requester = %body.requester, client = %peer.ip(), error = %e, "Rejected unsigned withdrawal");
        }
    })?;

    let withdrawal_id = state.handle.submit_withdrawal(request).await?;
    info!(withdrawal_id = %withdrawal_id, "Withdrawal queued via API");

    Ok((
        StatusCode::ACCEPTED,
        Json(WithdrawalAccepted {
            withdrawal_id,
            status: "pending",
        }),
    ))
}

async fn get_withdrawal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PendingWithdrawal>> {
    state
        .handle
        .get_withdrawal(&id)
        .await
        .map(Json)
        .ok_or_else(|| BridgeError::NotFound(format!("withdrawal {}", id)).into())
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    /// False when a retry was already waiting in the queue
    pub failed_mints_requeued: bool,
    pub in_flight_withdrawals: Vec<PendingWithdrawal>,
}

pub async fn reconcile(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<ReconcileResponse>)> {
    rate_limit(&state, peer, "reconcile").await?;
    require_admin(state.admin_token.as_deref(), &headers)?;

    let failed_mints_requeued = state.handle.retry_failed_mints().await?;
    let in_flight_withdrawals = state.handle.in_flight_withdrawals().await;
    Ok((
        StatusCode::ACCEPTED,
        Json(ReconcileResponse {
            failed_mints_requeued,
            in_flight_withdrawals,
        }),
    ))
}

// ============================================================================
// Health & status
// ============================================================================

async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct MintSummary {
    total: usize,
    settled: usize,
    failed: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: u64,
    network: Network,
    operator_address: String,
    deposit_addresses: usize,
    watched_addresses: usize,
    withdrawals: BTreeMap<&'static str, usize>,
    mints: MintSummary,
    circuits: BTreeMap<String, &'static str>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let withdrawals = state
        .handle
        .ledger
        .read()
        .await
        .status_counts()
        .into_iter()
        .map(|(status, count)| (status.as_str(), count))
        .collect();

    let mints = {
        let table = state.handle.mints.read().await;
        let failed = table.failed().len();
        MintSummary {
            total: table.len(),
            settled: table.settled_count(),
            failed,
        }
    };

    let circuits = state
        .handle
        .circuit_states()
        .await
        .into_iter()
        .map(|(name, s)| (name, s.as_str()))
        .collect();

    Json(StatusResponse {
        status: "ok",
        uptime_seconds: state.started_at.elapsed().as_secs(),
        network: state.network,
        operator_address: state.operator_address.clone(),
        deposit_addresses: state.handle.addresses.len().await,
        watched_addresses: state.handle.watch_list.len().await,
        withdrawals,
        mints,
        circuits,
    })
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/addresses", post(create_address))
        .route("/addresses/{owner}", get(list_addresses))
        .route("/withdrawals", post(submit_withdrawal))
        .route("/withdrawals/{id}", get(get_withdrawal))
        .route("/reconcile", post(reconcile))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Purge stale rate-limit records until shutdown
pub async fn purge_rate_limits(limiter: Arc<RateLimiter>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(PURGE_INTERVAL) => {
                let removed = limiter.purge_expired().await;
                if removed > 0 {
                    debug!(removed, "Purged rate-limit records");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Serve the API until `shutdown` flips to true
pub async fn start_api_server(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    tokio::spawn(purge_rate_limits(state.limiter.clone(), shutdown.clone()));

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::MintStatus;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&BridgeError::DustThreshold {
                amount: 1,
                threshold: 546
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&BridgeError::AlreadyProcessed("api-1".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&BridgeError::RateLimited { retry_after_ms: 10 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&BridgeError::CircuitOpen {
                dependency: "source".into()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&BridgeError::KeyGeneration("entropy".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError(BridgeError::RateLimited {
            retry_after_ms: 1_500,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn test_parse_evm_address() {
        assert!(parse_evm_address("0x5FbDB2315678afecb367f032d93F642f64180aa3", "owner_id").is_ok());
        assert!(matches!(
            parse_evm_address("DLCDJhnh6aGotar6b182jpzbNEyXb3C361", "owner_id"),
            Err(BridgeError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_unauthorized_maps_to_401() {
        assert_eq!(
            status_for(&BridgeError::Unauthorized("nope".into())),
            StatusCode::UNAUTHORIZED
        );
    }

    const HOLDER_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const OTHER_KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    const RECIPIENT: &str = "DLCDJhnh6aGotar6b182jpzbNEyXb3C361";
    const MAX_AGE: Duration = Duration::from_secs(300);

    fn signed_body(signing_key: &str, requester: Address, amount: u64, timestamp: i64) -> WithdrawalBody {
        let signer = PrivateKeySigner::from_str(signing_key).unwrap();
        let message = withdrawal_message(&requester, RECIPIENT, amount, timestamp);
        let signature = signer.sign_message_sync(message.as_bytes()).unwrap();
        WithdrawalBody {
            requester: requester.to_checksum(None),
            recipient_address: RECIPIENT.to_string(),
            amount_units: amount,
            timestamp,
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
        }
    }

    fn holder() -> Address {
        PrivateKeySigner::from_str(HOLDER_KEY).unwrap().address()
    }

    #[test]
    fn test_signed_withdrawal_is_authorized() {
        let now = Utc::now();
        let body = signed_body(HOLDER_KEY, holder(), 10_000, now.timestamp_millis());

        let request = authorize_withdrawal(&body, Network::Mainnet, 546, MAX_AGE, now).unwrap();
        assert_eq!(request.source, WithdrawalSource::Api);
        assert_eq!(request.requester, holder().to_checksum(None));
        assert_eq!(request.requested_at.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_signature_by_someone_else_is_rejected() {
        let now = Utc::now();
        let body = signed_body(OTHER_KEY, holder(), 10_000, now.timestamp_millis());
        assert!(matches!(
            authorize_withdrawal(&body, Network::Mainnet, 546, MAX_AGE, now),
            Err(BridgeError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_tampered_amount_is_rejected() {
        let now = Utc::now();
        let mut body = signed_body(HOLDER_KEY, holder(), 10_000, now.timestamp_millis());
        body.amount_units = 90_000;
        assert!(matches!(
            authorize_withdrawal(&body, Network::Mainnet, 546, MAX_AGE, now),
            Err(BridgeError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_missing_or_stale_signature_is_rejected() {
        let now = Utc::now();
        let mut body = signed_body(HOLDER_KEY, holder(), 10_000, now.timestamp_millis());
        body.signature = String::new();
        assert!(matches!(
            authorize_withdrawal(&body, Network::Mainnet, 546, MAX_AGE, now),
            Err(BridgeError::Unauthorized(_))
        ));

        let stale = now - chrono::Duration::minutes(10);
        let body = signed_body(HOLDER_KEY, holder(), 10_000, stale.timestamp_millis());
        assert!(matches!(
            authorize_withdrawal(&body, Network::Mainnet, 546, MAX_AGE, now),
            Err(BridgeError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_input_checks_run_before_signature() {
        let now = Utc::now();
        let body = signed_body(OTHER_KEY, holder(), 500, now.timestamp_millis());
        assert!(matches!(
            authorize_withdrawal(&body, Network::Mainnet, 546, MAX_AGE, now),
            Err(BridgeError::DustThreshold { .. })
        ));
    }

    #[test]
    fn test_require_admin() {
        let mut headers = HeaderMap::new();
        assert!(require_admin(None, &headers).is_err());
        assert!(require_admin(Some("operator-secret-0123"), &headers).is_err());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer operator-secret-0124"),
        );
        assert!(require_admin(Some("operator-secret-0123"), &headers).is_err());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer operator-secret-0123"),
        );
        assert!(require_admin(Some("operator-secret-0123"), &headers).is_ok());
        assert!(require_admin(None, &headers).is_err());
    }

    #[test]
    fn test_mint_status_serializes_tagged() {
        let json = serde_json::to_value(MintStatus::Failed {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["state"], "failed");
    }
}
