use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use alloy::primitives::{Address, TxHash};
use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, State,
    },
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::agreement::{AgreementId, AgreementView, NewAgreement};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::insight::{DocumentAnalysis, DocumentInsight, DocumentKind, IdentityVerification};
use crate::ledger::LedgerHandle;
use crate::service::AgreementService;
use crate::token::{CredentialToken, TokenStore};
use crate::wallet::signer_from_hex;

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

pub struct AppState {
    pub agreements: AgreementService,
    pub tokens: Arc<TokenStore>,
    pub insight: DocumentInsight,
}

impl AppState {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            agreements: AgreementService::new(LedgerHandle::new(config.ledger.clone())),
            tokens: Arc::new(TokenStore::new(&config.tokens)),
            insight: DocumentInsight::new(config.insight.clone()),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/deploy-contract", post(deploy_contract))
        .route("/api/create-agreement", post(create_agreement))
        .route("/api/verify-agreement", post(verify_agreement))
        .route("/api/get-agreement", post(get_agreement))
        .route("/api/update-agreement-status", post(update_agreement_status))
        .route("/api/analyze-document", post(analyze_document))
        .route("/api/verify-identity", post(verify_identity))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_api_server(
    state: Arc<AppState>,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

/// Reads a multipart upload, returning the bytes of `file_field` and every
/// other field as text.
async fn upload(
    multipart: Result<Multipart, MultipartRejection>,
    file_field: &str,
    missing: &str,
) -> AppResult<(Vec<u8>, HashMap<String, String>)> {
    let mut multipart = multipart.map_err(|rejection| AppError::validation(rejection.body_text()))?;
    let mut file = None;
    let mut fields = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == file_field {
            let bytes = field.bytes().await.map_err(|e| AppError::validation(e.body_text()))?;
            file = Some(bytes.to_vec());
        } else {
            let text = field.text().await.map_err(|e| AppError::validation(e.body_text()))?;
            fields.insert(name, text);
        }
    }

    match file {
        Some(bytes) if !bytes.is_empty() => Ok((bytes, fields)),
        _ => Err(AppError::validation(missing)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    blockchain_connected: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        blockchain_connected: state.agreements.is_connected().await,
    })
}

#[derive(Deserialize)]
struct DeployRequest {
    private_key: Secret<String>,
}

#[derive(Serialize)]
struct DeployResponse {
    success: bool,
    contract_address: Address,
    transaction_hash: TxHash,
}

async fn deploy_contract(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> AppResult<Json<DeployResponse>> {
    let request = json_body(payload)?;
    let signer = signer_from_hex(&request.private_key)?;
    let deployed = state.agreements.deploy_contract(&signer).await?;

    Ok(Json(DeployResponse {
        success: true,
        contract_address: deployed.contract_address,
        transaction_hash: deployed.transaction_hash,
    }))
}

#[derive(Deserialize)]
struct CreateAgreementRequest {
    contract_address: Address,
    landlord_address: Address,
    tenant_address: Address,
    property_details: String,
    #[serde(deserialize_with = "decimal_string")]
    rent_amount: Decimal,
    duration: u64,
    private_key: Secret<String>,
}

/// Accepts amounts only as decimal strings. serde_json hands JSON numbers
/// over as `f64`, which cannot carry 18 fractional digits.
fn decimal_string<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    struct DecimalString;

    impl<'de> Visitor<'de> for DecimalString {
        type Value = Decimal;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a decimal string such as \"1500.00\"")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Decimal, E> {
            Decimal::from_str_exact(value.trim()).map_err(|e| E::custom(format!("invalid amount {value:?}: {e}")))
        }
    }

    deserializer.deserialize_str(DecimalString)
}

#[derive(Serialize)]
struct CreateAgreementResponse {
    success: bool,
    agreement_id: AgreementId,
    transaction_hash: TxHash,
    block_number: Option<u64>,
    qr_code_path: Option<String>,
}

async fn create_agreement(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateAgreementRequest>, JsonRejection>,
) -> AppResult<Json<CreateAgreementResponse>> {
    let request = json_body(payload)?;
    let signer = signer_from_hex(&request.private_key)?;
    let agreement = NewAgreement {
        landlord: request.landlord_address,
        tenant: request.tenant_address,
        property_details: request.property_details,
        rent_amount: request.rent_amount,
        duration: request.duration,
    };
    let created = state
        .agreements
        .create_agreement(request.contract_address, agreement, &signer)
        .await?;

    // The agreement is confirmed at this point; a token failure must not hide its id.
    let token = CredentialToken {
        contract_address: request.contract_address,
        agreement_id: created.agreement_id,
        landlord: request.landlord_address,
        tenant: request.tenant_address,
    };
    let qr_code_path = match state.tokens.issue(&token).await {
        Ok(path) => Some(path.display().to_string()),
        Err(e) => {
            warn!(agreement_id = %created.agreement_id, error = %e, "credential token not issued");
            None
        }
    };

    Ok(Json(CreateAgreementResponse {
        success: true,
        agreement_id: created.agreement_id,
        transaction_hash: created.transaction_hash,
        block_number: created.block_number,
        qr_code_path,
    }))
}

#[derive(Serialize)]
struct AgreementResponse {
    success: bool,
    agreement_data: AgreementView,
}

async fn verify_agreement(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<AgreementResponse>> {
    let (image, _) = upload(multipart, "qr_image", "No QR code image provided").await?;
    let token = state.tokens.read(image).await?;
    let agreement_data = state
        .agreements
        .verify_agreement(token.contract_address, token.agreement_id)
        .await?;

    Ok(Json(AgreementResponse { success: true, agreement_data }))
}

#[derive(Deserialize)]
struct GetAgreementRequest {
    contract_address: Address,
    agreement_id: AgreementId,
}

async fn get_agreement(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GetAgreementRequest>, JsonRejection>,
) -> AppResult<Json<AgreementResponse>> {
    let request = json_body(payload)?;
    let agreement_data = state
        .agreements
        .verify_agreement(request.contract_address, request.agreement_id)
        .await?;

    Ok(Json(AgreementResponse { success: true, agreement_data }))
}

#[derive(Deserialize)]
struct UpdateStatusRequest {
    contract_address: Address,
    agreement_id: AgreementId,
    is_active: bool,
    private_key: Secret<String>,
}

#[derive(Serialize)]
struct UpdateStatusResponse {
    success: bool,
    agreement_id: AgreementId,
    transaction_hash: TxHash,
    is_active: bool,
}

async fn update_agreement_status(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> AppResult<Json<UpdateStatusResponse>> {
    let request = json_body(payload)?;
    let signer = signer_from_hex(&request.private_key)?;
    let change = state
        .agreements
        .update_status(request.contract_address, request.agreement_id, request.is_active, &signer)
        .await?;

    Ok(Json(UpdateStatusResponse {
        success: true,
        agreement_id: change.agreement_id,
        transaction_hash: change.transaction_hash,
        is_active: change.is_active,
    }))
}

#[derive(Serialize)]
struct AnalysisResponse {
    success: bool,
    analysis: DocumentAnalysis,
}

async fn analyze_document(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<AnalysisResponse>> {
    let (document, fields) = upload(multipart, "document", "No document provided").await?;
    let kind = DocumentKind::parse(fields.get("document_type").map_or("lease", String::as_str));
    let analysis = state.insight.analyze_document(document, kind).await?;

    Ok(Json(AnalysisResponse { success: true, analysis }))
}

#[derive(Serialize)]
struct VerificationResponse {
    success: bool,
    verification: IdentityVerification,
}

async fn verify_identity(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<VerificationResponse>> {
    let (document, fields) = upload(multipart, "id_document", "No ID document provided").await?;
    let id_type = fields.get("id_type").map_or("passport", String::as_str);
    let verification = state.insight.verify_identity(document, id_type).await?;

    Ok(Json(VerificationResponse { success: true, verification }))
}
