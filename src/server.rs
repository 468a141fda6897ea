use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use actix_web::{
    get,
    http::{
        header::{self, HeaderName, HeaderValue},
        StatusCode,
    },
    middleware::Logger,
    post, route, web, App, HttpRequest, HttpResponse, HttpServer,
};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{bearer_token, require_admin, require_user, AccessGate, ApiKeyGate, Principal};
use crate::config::{
    ConfigError, ConfigResult, GatewayConfig, RetrievalConfig, DEFAULT_RAG_TEMPLATE, DEFAULT_TOP_K,
};
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{CancellationRegistry, RequestId};
use crate::relay::{header_map_from_pairs, RelayRequest, StreamRelay};
use crate::retrieval::{
    query_collections, DocumentSource, DocumentStore, InMemoryVectorIndex, LoadedDocument,
    PlainTextStore, QueryResponse, VectorIndex,
};
use crate::transform::BodyTransformer;

/// Collection names are capped at this many hex characters.
const COLLECTION_NAME_LEN: usize = 63;

/// Shared state behind every handler.
pub struct AppState {
    pub relay: StreamRelay,
    pub gate: Arc<dyn AccessGate>,
    pub index: Arc<dyn VectorIndex>,
    pub documents: Arc<dyn DocumentStore>,
    retrieval: RwLock<RetrievalConfig>,
}

impl AppState {
    pub fn new(
        relay: StreamRelay,
        gate: Arc<dyn AccessGate>,
        index: Arc<dyn VectorIndex>,
        documents: Arc<dyn DocumentStore>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            relay,
            gate,
            index,
            documents,
            retrieval: RwLock::new(retrieval),
        }
    }

    /// Wires the built-in collaborators from configuration.
    pub fn from_config(config: &GatewayConfig) -> ConfigResult<Self> {
        let client = build_client(config.request_timeout_secs)?;
        let relay = StreamRelay::new(
            client.clone(),
            CancellationRegistry::new(),
            BodyTransformer::from_config(&config.prompt),
            config.upstream_base_url.trim_end_matches('/'),
        );
        Ok(Self::new(
            relay,
            Arc::new(ApiKeyGate::new(config.auth.clone())),
            Arc::new(InMemoryVectorIndex::default()),
            Arc::new(PlainTextStore::new(client)),
            config.retrieval.clone(),
        ))
    }

    fn principal(&self, req: &HttpRequest) -> Option<Principal> {
        self.gate.identify(bearer_token(req))
    }

    pub fn retrieval_settings(&self) -> RetrievalConfig {
        self.retrieval
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_retrieval_settings(&self, settings: RetrievalConfig) {
        *self
            .retrieval
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    fn effective_k(&self, k: Option<usize>) -> usize {
        k.filter(|k| *k > 0)
            .unwrap_or_else(|| self.retrieval_settings().top_k)
    }
}

/// Upstream client. Without a timeout, long generations are never cut off.
pub fn build_client(timeout_secs: Option<u64>) -> ConfigResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(secs) = timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    builder.build().map_err(|e| ConfigError::ValidationFailed {
        reason: format!("Failed to build HTTP client: {}", e),
    })
}

fn collection_name_for(content: &[u8]) -> String {
    let mut name = format!("{:x}", Sha256::digest(content));
    name.truncate(COLLECTION_NAME_LEN);
    name
}

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

// ---------------------------------------------------------------------------
// Inference proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UrlUpdateForm {
    pub url: String,
}

#[get("/url")]
pub async fn get_upstream_url(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    require_admin(state.principal(&req))?;
    Ok(HttpResponse::Ok().json(json!({ "OLLAMA_BASE_URL": state.relay.upstream_base_url() })))
}

#[post("/url/update")]
pub async fn update_upstream_url(
    req: HttpRequest,
    form: web::Json<UrlUpdateForm>,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    let principal = require_admin(state.principal(&req))?;
    let url = state.relay.set_upstream_base_url(&form.url)?;
    info!(principal = %principal.id, "Upstream URL updated");
    Ok(HttpResponse::Ok().json(json!({ "OLLAMA_BASE_URL": url })))
}

#[get("/cancel/{request_id}")]
pub async fn cancel_request(
    req: HttpRequest,
    request_id: web::Path<String>,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    require_user(state.principal(&req))?;
    let cancelled = match request_id.parse::<RequestId>() {
        Ok(id) => state.relay.cancel(&id),
        Err(_) => {
            debug!("Ignoring cancel for malformed id {}", request_id.as_str());
            false
        }
    };
    Ok(HttpResponse::Ok().json(cancelled))
}

#[route("/{path:.*}", method = "GET", method = "POST", method = "PUT", method = "DELETE")]
pub async fn proxy(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
    let headers = header_map_from_pairs(
        req.headers()
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_bytes())),
    );

    let response = state
        .relay
        .relay(RelayRequest {
            method,
            path: path.into_inner(),
            query: Some(req.query_string().to_string()).filter(|q| !q.is_empty()),
            headers,
            body,
            principal: state.principal(&req),
        })
        .await?;
    debug!(
        request_id = %response.request_id,
        "Streaming upstream response ({})",
        response.status
    );

    let status = StatusCode::from_u16(response.status.as_u16()).unwrap_or(StatusCode::OK);
    let mut builder = HttpResponse::build(status);
    for (name, value) in response.headers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder.append_header((name, value));
        }
    }
    Ok(builder.streaming(response.body))
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct QuerySettingsForm {
    pub k: Option<usize>,
    pub template: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueryDocForm {
    pub collection_name: String,
    pub query: String,
    pub k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct QueryCollectionsForm {
    pub collection_names: Vec<String>,
    pub query: String,
    pub k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DocUploadParams {
    pub filename: Option<String>,
    pub collection_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StoreWebForm {
    pub url: String,
    #[serde(default)]
    pub collection_name: Option<String>,
}

#[get("/")]
pub async fn rag_status(state: web::Data<AppState>) -> HttpResponse {
    let settings = state.retrieval_settings();
    HttpResponse::Ok().json(json!({
        "status": true,
        "template": settings.template,
        "k": settings.top_k,
    }))
}

#[get("/template")]
pub async fn get_template(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    require_user(state.principal(&req))?;
    Ok(HttpResponse::Ok().json(json!({
        "status": true,
        "template": state.retrieval_settings().template,
    })))
}

#[get("/query/settings")]
pub async fn get_query_settings(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    require_admin(state.principal(&req))?;
    let settings = state.retrieval_settings();
    Ok(HttpResponse::Ok().json(json!({
        "status": true,
        "template": settings.template,
        "k": settings.top_k,
    })))
}

#[post("/query/settings/update")]
pub async fn update_query_settings(
    req: HttpRequest,
    form: web::Json<QuerySettingsForm>,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    require_admin(state.principal(&req))?;
    let form = form.into_inner();
    let settings = RetrievalConfig {
        top_k: form.k.filter(|k| *k > 0).unwrap_or(DEFAULT_TOP_K),
        template: form
            .template
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_RAG_TEMPLATE.to_string()),
    };
    info!("Retrieval settings updated: k={}", settings.top_k);
    let template = settings.template.clone();
    state.set_retrieval_settings(settings);
    Ok(HttpResponse::Ok().json(json!({ "status": true, "template": template })))
}

#[post("/query/doc")]
pub async fn query_doc(
    req: HttpRequest,
    form: web::Json<QueryDocForm>,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    require_user(state.principal(&req))?;
    let k = state.effective_k(form.k);
    let documents = state
        .index
        .query(&form.collection_name, &form.query, k)
        .await?;
    Ok(HttpResponse::Ok().json(QueryResponse::from(documents)))
}

#[post("/query/collection")]
pub async fn query_collection(
    req: HttpRequest,
    form: web::Json<QueryCollectionsForm>,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    require_user(state.principal(&req))?;
    let k = state.effective_k(form.k);
    let merged =
        query_collections(state.index.as_ref(), &form.collection_names, &form.query, k).await;
    Ok(HttpResponse::Ok().json(QueryResponse::from(merged)))
}

async fn store_document(
    state: &AppState,
    collection_name: &str,
    document: LoadedDocument,
) -> GatewayResult<()> {
    let (texts, metadatas): (Vec<_>, Vec<_>) = document
        .chunks
        .into_iter()
        .map(|chunk| (chunk.text, chunk.metadata))
        .unzip();
    let ids: Vec<String> = texts.iter().map(|_| Uuid::new_v4().to_string()).collect();

    state
        .index
        .index(collection_name, &texts, &metadatas, &ids)
        .await
        .map_err(|e| {
            warn!("Failed to index into {}: {}", collection_name, e);
            GatewayError::Internal(e.to_string())
        })
}

#[post("/doc")]
pub async fn store_doc(
    req: HttpRequest,
    params: web::Query<DocUploadParams>,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    require_user(state.principal(&req))?;
    let params = params.into_inner();
    let filename = params
        .filename
        .filter(|f| !f.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("filename is required".to_string()))?;
    let collection_name = params
        .collection_name
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| collection_name_for(&body));
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let source = DocumentSource::Bytes {
        filename: filename.clone(),
        data: body,
    };
    let document = state.documents.load(&source, content_type).await?;
    let known_type = document.known_type;
    store_document(&state, &collection_name, document).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": true,
        "collection_name": collection_name,
        "filename": filename,
        "known_type": known_type,
    })))
}

#[post("/web")]
pub async fn store_web(
    req: HttpRequest,
    form: web::Json<StoreWebForm>,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    require_user(state.principal(&req))?;
    let form = form.into_inner();
    let collection_name = form
        .collection_name
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| collection_name_for(form.url.as_bytes()));

    let document = state
        .documents
        .load(&DocumentSource::Url(form.url.clone()), None)
        .await?;
    store_document(&state, &collection_name, document).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": true,
        "collection_name": collection_name,
        "filename": form.url,
    })))
}

#[get("/reset/db")]
pub async fn reset_vector_db(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> GatewayResult<HttpResponse> {
    let principal = require_admin(state.principal(&req))?;
    state.index.reset().await?;
    info!(principal = %principal.id, "Vector index reset requested");
    Ok(HttpResponse::Ok().json(true))
}

/// Registers every route. State is attached by the caller.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(
            web::scope("/ollama/api")
                .service(get_upstream_url)
                .service(update_upstream_url)
                .service(cancel_request)
                .service(proxy),
        )
        .service(
            web::scope("/rag/api/v1")
                .service(rag_status)
                .service(get_template)
                .service(get_query_settings)
                .service(update_query_settings)
                .service(query_doc)
                .service(query_collection)
                .service(store_doc)
                .service(store_web)
                .service(reset_vector_db),
        );
}

pub async fn startup(config: GatewayConfig) -> std::io::Result<()> {
    let state = AppState::from_config(&config).map_err(std::io::Error::other)?;
    let app_state = web::Data::new(state);
    let max_payload_size = config.max_payload_size;

    if !config.auth.is_enabled() {
        warn!("No API keys configured; every caller is treated as an administrator");
    }
    info!(
        "Starting server at {}:{}, upstream {}",
        config.host, config.port, config.upstream_base_url
    );

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(app_state.clone())
            .app_data(web::PayloadConfig::new(max_payload_size))
            .app_data(web::JsonConfig::default().limit(max_payload_size))
            .configure(configure)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}
