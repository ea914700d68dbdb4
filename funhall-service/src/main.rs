// Copyright (C) 2026 FunHall Games
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use funhall_common::{
    BroadcastPayload, BucketId, CATEGORY_RULES, CategoryItem, CurationLists, DraftEffect,
    DraftEvent, DraftState, GameRecord, GameSummary, HOME_BUCKETS, InboundMessage,
    expand_env_vars, match_curated_names, merge_pinned_first, normalize_game,
};
use lambda_http::run as lambda_run;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

/// How long a coalesced cache reader waits on the in-flight rebuild before
/// degrading to a stale value.
const REBUILD_WAIT: Duration = Duration::from_millis(2500);

const KEYED_CACHE_MAX_ENTRIES: usize = 4096;

#[derive(Clone)]
struct AppState {
    config: Arc<ServiceConfig>,
    curation: Arc<CurationLists>,
    store: Arc<dyn CatalogStore>,
    upstream: Arc<dyn UpstreamCatalog>,
    messenger: Arc<dyn Messenger>,
    client: reqwest::Client,
    breaker: Arc<QuotaBreaker>,
    geo_breaker: Arc<QuotaBreaker>,
    home_cache: Arc<CachedCell<Vec<HomeCategory>>>,
    game_cache: Arc<KeyedCache<Option<GameSummary>>>,
    geo_cache: Arc<KeyedCache<Value>>,
    drafts: Arc<Mutex<HashMap<i64, DraftState>>>,
    sync_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone)]
struct ServiceConfig {
    admin_secret: Option<String>,
    admin_chat_ids: Vec<i64>,
    per_page: u32,
    chunk_size: usize,
    max_pages: u32,
    bucket_limit: usize,
    working_set_cap: usize,
    reset_seed_count: usize,
    welcome_text: String,
    webhook_secret: String,
    geo_base_url: String,
    reverse_geo_base_url: String,
}

impl ServiceConfig {
    fn from_env() -> anyhow::Result<Self> {
        let webhook_secret = std::env::var("TELEGRAM_WEBHOOK_SECRET")
            .context("TELEGRAM_WEBHOOK_SECRET is required")?;
        let admin_chat_ids = std::env::var("ADMIN_CHAT_IDS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .filter_map(|part| part.trim().parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            admin_secret: normalize_optional_string(std::env::var("ADMIN_SECRET").ok()),
            admin_chat_ids,
            per_page: parse_env_u64("SYNC_PER_PAGE", 150) as u32,
            chunk_size: parse_env_u64("SYNC_CHUNK_SIZE", 250) as usize,
            max_pages: parse_env_u64("SYNC_MAX_PAGES", 200) as u32,
            bucket_limit: parse_env_u64("BUCKET_LIMIT", 60) as usize,
            working_set_cap: parse_env_u64("WORKING_SET_CAP", 2000) as usize,
            reset_seed_count: parse_env_u64("RESET_SEED_COUNT", 300) as usize,
            welcome_text: std::env::var("TELEGRAM_WELCOME_TEXT").ok().unwrap_or_else(|| {
                "Welcome to FunHall! Open the app to start playing.".to_string()
            }),
            webhook_secret,
            geo_base_url: std::env::var("GEO_API_BASE_URL")
                .ok()
                .unwrap_or_else(|| "http://ip-api.com/json".to_string()),
            reverse_geo_base_url: std::env::var("REVERSE_GEO_API_BASE_URL")
                .ok()
                .unwrap_or_else(|| {
                    "https://api.bigdatacloud.net/data/reverse-geocode-client".to_string()
                }),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CurationConfigFile {
    #[serde(default)]
    exclusive_keywords: Vec<String>,
    #[serde(default)]
    best_games: Vec<String>,
}

fn load_curation_config() -> CurationLists {
    let Some(path) = normalize_optional_string(std::env::var("CURATION_CONFIG_PATH").ok()) else {
        return CurationLists::default();
    };

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read curation config; using defaults");
            return CurationLists::default();
        }
    };

    let expanded = expand_env_vars(&raw);
    let parsed = match serde_yaml::from_str::<CurationConfigFile>(&expanded) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse curation config yaml; using defaults");
            return CurationLists::default();
        }
    };

    let mut lists = CurationLists::default();
    if !parsed.exclusive_keywords.is_empty() {
        lists.exclusive_keywords = parsed.exclusive_keywords;
    }
    lists.best_games = parsed.best_games;

    info!(
        path = %path,
        exclusive_keywords = lists.exclusive_keywords.len(),
        best_games = lists.best_games.len(),
        "loaded curation config"
    );
    lists
}

#[derive(Debug, Error)]
#[error("missing required setting: {0}")]
struct ConfigError(&'static str);

#[derive(Debug, Error)]
enum UpstreamError {
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("malformed upstream response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
enum StoreError {
    #[error("storage quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("storage error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
#[error("delivery to chat {chat_id} failed: {detail}")]
struct DeliveryError {
    chat_id: i64,
    detail: String,
}

#[derive(Debug, Error)]
enum CacheError {
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
struct CatalogPage {
    records: Vec<Value>,
    last_page: Option<u32>,
}

#[async_trait]
trait UpstreamCatalog: Send + Sync {
    /// Fetch one page of published records, ordered by last-updated
    /// descending. `since` restricts to records updated on/after that date
    /// (date granularity, upstream semantics).
    async fn fetch_page(
        &self,
        page: u32,
        per_page: u32,
        since: Option<NaiveDate>,
    ) -> Result<CatalogPage, UpstreamError>;

    fn build_embed_url(&self, raw_url: &str) -> Result<String, ConfigError>;
}

#[async_trait]
trait CatalogStore: Send + Sync {
    async fn upsert_games(&self, games: &[GameRecord]) -> Result<(), StoreError>;
    async fn get_game(&self, id: &str) -> Result<Option<GameRecord>, StoreError>;
    async fn list_enabled_games(&self, limit: usize) -> Result<Vec<GameRecord>, StoreError>;
    async fn wipe_games(&self) -> Result<u64, StoreError>;
    async fn read_watermark(&self) -> Result<Option<NaiveDate>, StoreError>;
    async fn write_watermark(&self, date: NaiveDate) -> Result<(), StoreError>;
    async fn read_pinned(&self) -> Result<Vec<String>, StoreError>;
    async fn write_pinned(&self, ids: &[String]) -> Result<(), StoreError>;
    async fn write_category_run(
        &self,
        bucket: BucketId,
        run_id: i64,
        items: &[CategoryItem],
    ) -> Result<(), StoreError>;
    async fn activate_category_run(&self, bucket: BucketId, run_id: i64)
    -> Result<(), StoreError>;
    async fn read_active_category(&self, bucket: BucketId) -> Result<Vec<CategoryItem>, StoreError>;
    async fn upsert_user(&self, chat_id: i64, username: Option<&str>) -> Result<(), StoreError>;
    async fn list_user_ids(&self) -> Result<Vec<i64>, StoreError>;
    async fn ping(&self) -> Result<Value, StoreError>;
}

#[async_trait]
trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError>;
    async fn send_payload(
        &self,
        chat_id: i64,
        payload: &BroadcastPayload,
    ) -> Result<(), DeliveryError>;
    async fn send_confirm_prompt(
        &self,
        chat_id: i64,
        payload: &BroadcastPayload,
    ) -> Result<(), DeliveryError>;
    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), DeliveryError>;
}

struct GamesApiClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    embed_token: Option<String>,
}

impl GamesApiClient {
    fn from_env(client: reqwest::Client) -> anyhow::Result<Self> {
        let base_url = std::env::var("GAMES_API_BASE_URL")
            .ok()
            .unwrap_or_else(|| "https://slotslaunch.com/api".to_string());
        let api_token = std::env::var("GAMES_API_TOKEN")
            .context("GAMES_API_TOKEN is required for catalog sync")?;

        Ok(Self {
            client,
            base_url,
            api_token,
            embed_token: normalize_optional_string(std::env::var("EMBED_ACCESS_TOKEN").ok()),
        })
    }

    fn page_url(&self, page: u32, per_page: u32, since: Option<NaiveDate>) -> String {
        let mut url = format!(
            "{}/games?page={}&per_page={}&published=1&order_by=updated_at&order_dir=desc",
            self.base_url.trim_end_matches('/'),
            page,
            per_page
        );
        if let Some(since) = since {
            url.push_str(&format!("&updated_from={}", since.format("%Y-%m-%d")));
        }
        url
    }
}

#[derive(Debug, Deserialize)]
struct UpstreamEnvelope {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    meta: Option<UpstreamMeta>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMeta {
    #[serde(default)]
    last_page: Option<u32>,
}

#[async_trait]
impl UpstreamCatalog for GamesApiClient {
    async fn fetch_page(
        &self,
        page: u32,
        per_page: u32,
        since: Option<NaiveDate>,
    ) -> Result<CatalogPage, UpstreamError> {
        let url = self.page_url(page, per_page, since);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| UpstreamError::Transport(error.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| UpstreamError::Transport(error.to_string()))?;
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: truncate_chars_with_ellipsis(&body, 400),
            });
        }

        let envelope: UpstreamEnvelope =
            serde_json::from_str(&body).map_err(|error| UpstreamError::Decode(error.to_string()))?;
        Ok(CatalogPage {
            records: envelope.data,
            last_page: envelope.meta.and_then(|meta| meta.last_page),
        })
    }

    fn build_embed_url(&self, raw_url: &str) -> Result<String, ConfigError> {
        let token = self
            .embed_token
            .as_deref()
            .ok_or(ConfigError("EMBED_ACCESS_TOKEN"))?;
        if raw_url.contains("token=") {
            return Ok(raw_url.to_string());
        }
        let separator = if raw_url.contains('?') { '&' } else { '?' };
        Ok(format!("{raw_url}{separator}token={token}"))
    }
}

enum FirestoreTokenSource {
    Static(String),
    Metadata,
    Unauthenticated,
}

/// Thin Firestore REST accessor. Documents live under
/// `projects/{project}/databases/(default)/documents`.
struct FirestoreStore {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    token_source: FirestoreTokenSource,
    cached_token: Mutex<Option<(Instant, String)>>,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl FirestoreStore {
    fn from_env(client: reqwest::Client) -> anyhow::Result<Self> {
        let project_id =
            std::env::var("FIRESTORE_PROJECT_ID").context("FIRESTORE_PROJECT_ID is required")?;

        let (base_url, token_source) =
            match normalize_optional_string(std::env::var("FIRESTORE_EMULATOR_HOST").ok()) {
                Some(host) => (
                    format!("http://{}/v1", host.trim_end_matches('/')),
                    FirestoreTokenSource::Unauthenticated,
                ),
                None => {
                    let source = match normalize_optional_string(
                        std::env::var("FIRESTORE_ACCESS_TOKEN").ok(),
                    ) {
                        Some(token) => FirestoreTokenSource::Static(token),
                        None => FirestoreTokenSource::Metadata,
                    };
                    ("https://firestore.googleapis.com/v1".to_string(), source)
                }
            };

        Ok(Self {
            client,
            base_url,
            project_id,
            token_source,
            cached_token: Mutex::new(None),
        })
    }

    fn documents_root(&self) -> String {
        format!("projects/{}/databases/(default)/documents", self.project_id)
    }

    fn root_url(&self) -> String {
        format!("{}/{}", self.base_url, self.documents_root())
    }

    fn doc_url(&self, path: &str) -> String {
        format!("{}/{}", self.root_url(), path)
    }

    async fn bearer_token(&self) -> Result<Option<String>, StoreError> {
        match &self.token_source {
            FirestoreTokenSource::Static(token) => Ok(Some(token.clone())),
            FirestoreTokenSource::Unauthenticated => Ok(None),
            FirestoreTokenSource::Metadata => {
                let mut cached = self.cached_token.lock().await;
                if let Some((expires_at, token)) = cached.as_ref() {
                    if Instant::now() < *expires_at {
                        return Ok(Some(token.clone()));
                    }
                }

                let response = self
                    .client
                    .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|error| {
                        StoreError::Backend(format!("metadata token fetch failed: {error}"))
                    })?;
                if !response.status().is_success() {
                    return Err(StoreError::Backend(format!(
                        "metadata token endpoint returned {}",
                        response.status()
                    )));
                }
                let token: MetadataToken = response.json().await.map_err(|error| {
                    StoreError::Backend(format!("metadata token decode failed: {error}"))
                })?;

                let expires_at =
                    Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(60));
                *cached = Some((expires_at, token.access_token.clone()));
                Ok(Some(token.access_token))
            }
        }
    }

    /// One Firestore REST call. `Ok(None)` means the document does not exist.
    async fn call(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<Option<Value>, StoreError> {
        let mut request = self.client.request(method, &url);
        if let Some(token) = self.bearer_token().await? {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| StoreError::Backend(format!("firestore request failed: {error}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| StoreError::Backend(format!("firestore body read failed: {error}")))?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_firestore_error(status.as_u16(), &text));
        }
        if text.is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|error| StoreError::Backend(format!("firestore returned invalid json: {error}")))
    }

    async fn run_query(&self, body: Value) -> Result<Vec<Value>, StoreError> {
        let url = format!("{}:runQuery", self.root_url());
        let result = self.call(Method::POST, url, Some(body)).await?;
        Ok(result
            .and_then(|value| value.as_array().cloned())
            .unwrap_or_default())
    }

    async fn commit(&self, writes: Vec<Value>) -> Result<(), StoreError> {
        let url = format!("{}:commit", self.root_url());
        self.call(Method::POST, url, Some(json!({ "writes": writes })))
            .await?;
        Ok(())
    }
}

fn classify_firestore_error(status: u16, body: &str) -> StoreError {
    let detail = truncate_chars_with_ellipsis(body, 300);
    if status == 429 || body.contains("RESOURCE_EXHAUSTED") {
        StoreError::QuotaExhausted(detail)
    } else {
        StoreError::Backend(format!("firestore returned {status}: {detail}"))
    }
}

fn fs_string(value: &str) -> Value {
    json!({ "stringValue": value })
}

fn fs_opt_string(value: Option<&str>) -> Value {
    match value {
        Some(value) => fs_string(value),
        None => json!({ "nullValue": null }),
    }
}

fn fs_bool(value: bool) -> Value {
    json!({ "booleanValue": value })
}

fn fs_int(value: i64) -> Value {
    json!({ "integerValue": value.to_string() })
}

fn fs_opt_double(value: Option<f64>) -> Value {
    match value {
        Some(value) => json!({ "doubleValue": value }),
        None => json!({ "nullValue": null }),
    }
}

fn fs_timestamp(at: DateTime<Utc>) -> Value {
    json!({ "timestampValue": at.to_rfc3339_opts(SecondsFormat::Millis, true) })
}

fn fs_opt_timestamp(at: Option<DateTime<Utc>>) -> Value {
    match at {
        Some(at) => fs_timestamp(at),
        None => json!({ "nullValue": null }),
    }
}

fn fs_read_string(fields: &Value, key: &str) -> Option<String> {
    fields
        .get(key)?
        .get("stringValue")?
        .as_str()
        .map(str::to_string)
}

fn fs_read_bool(fields: &Value, key: &str) -> Option<bool> {
    fields.get(key)?.get("booleanValue")?.as_bool()
}

fn fs_read_i64(fields: &Value, key: &str) -> Option<i64> {
    let value = fields.get(key)?.get("integerValue")?;
    match value {
        Value::String(text) => text.parse().ok(),
        Value::Number(number) => number.as_i64(),
        _ => None,
    }
}

fn fs_read_f64(fields: &Value, key: &str) -> Option<f64> {
    let value = fields.get(key)?;
    value
        .get("doubleValue")
        .and_then(Value::as_f64)
        .or_else(|| {
            value
                .get("integerValue")
                .and_then(Value::as_str)
                .and_then(|text| text.parse().ok())
        })
}

fn fs_read_timestamp(fields: &Value, key: &str) -> Option<DateTime<Utc>> {
    let text = fields.get(key)?.get("timestampValue")?.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn encode_game_fields(game: &GameRecord) -> Value {
    json!({
        "name": fs_string(&game.name),
        "provider": fs_string(&game.provider),
        "thumb": fs_opt_string(game.thumb.as_deref()),
        "rtp": fs_opt_double(game.rtp),
        "publishedAt": fs_opt_timestamp(game.published_at),
        "createdAt": fs_opt_timestamp(game.created_at),
        "publishedAtTs": fs_int(game.published_at_ts),
        "createdAtTs": fs_int(game.created_at_ts),
        "enabled": fs_bool(game.enabled),
        "apiUrl": fs_opt_string(game.api_url.as_deref()),
        "embedUrl": fs_opt_string(game.embed_url.as_deref()),
    })
}

fn decode_game(id: &str, fields: &Value) -> GameRecord {
    GameRecord {
        id: id.to_string(),
        name: fs_read_string(fields, "name").unwrap_or_default(),
        provider: fs_read_string(fields, "provider").unwrap_or_default(),
        thumb: fs_read_string(fields, "thumb"),
        rtp: fs_read_f64(fields, "rtp"),
        published_at: fs_read_timestamp(fields, "publishedAt"),
        created_at: fs_read_timestamp(fields, "createdAt"),
        published_at_ts: fs_read_i64(fields, "publishedAtTs").unwrap_or(0),
        created_at_ts: fs_read_i64(fields, "createdAtTs").unwrap_or(0),
        enabled: fs_read_bool(fields, "enabled").unwrap_or(false),
        api_url: fs_read_string(fields, "apiUrl"),
        embed_url: fs_read_string(fields, "embedUrl"),
    }
}

fn encode_category_item(item: &CategoryItem) -> Value {
    json!({
        "mapValue": {
            "fields": {
                "rank": fs_int(i64::from(item.rank)),
                "id": fs_string(&item.game.id),
                "name": fs_string(&item.game.name),
                "provider": fs_string(&item.game.provider),
                "thumb": fs_opt_string(item.game.thumb.as_deref()),
                "demoUrl": fs_opt_string(item.game.demo_url.as_deref()),
                "rtp": fs_opt_double(item.game.rtp),
            }
        }
    })
}

fn decode_category_item(value: &Value) -> Option<CategoryItem> {
    let fields = value.get("mapValue")?.get("fields")?;
    Some(CategoryItem {
        rank: fs_read_i64(fields, "rank").unwrap_or(0) as u32,
        game: GameSummary {
            id: fs_read_string(fields, "id")?,
            name: fs_read_string(fields, "name").unwrap_or_default(),
            provider: fs_read_string(fields, "provider").unwrap_or_default(),
            thumb: fs_read_string(fields, "thumb"),
            demo_url: fs_read_string(fields, "demoUrl"),
            rtp: fs_read_f64(fields, "rtp"),
        },
    })
}

#[async_trait]
impl CatalogStore for FirestoreStore {
    async fn upsert_games(&self, games: &[GameRecord]) -> Result<(), StoreError> {
        if games.is_empty() {
            return Ok(());
        }
        let writes: Vec<Value> = games
            .iter()
            .map(|game| {
                json!({
                    "update": {
                        "name": format!("{}/games/{}", self.documents_root(), game.id),
                        "fields": encode_game_fields(game),
                    }
                })
            })
            .collect();
        self.commit(writes).await
    }

    async fn get_game(&self, id: &str) -> Result<Option<GameRecord>, StoreError> {
        let document = self
            .call(Method::GET, self.doc_url(&format!("games/{id}")), None)
            .await?;
        Ok(document
            .as_ref()
            .and_then(|doc| doc.get("fields"))
            .map(|fields| decode_game(id, fields)))
    }

    async fn list_enabled_games(&self, limit: usize) -> Result<Vec<GameRecord>, StoreError> {
        let rows = self
            .run_query(json!({
                "structuredQuery": {
                    "from": [{ "collectionId": "games" }],
                    "where": {
                        "fieldFilter": {
                            "field": { "fieldPath": "enabled" },
                            "op": "EQUAL",
                            "value": { "booleanValue": true }
                        }
                    },
                    "orderBy": [{ "field": { "fieldPath": "publishedAtTs" }, "direction": "DESCENDING" }],
                    "limit": limit,
                }
            }))
            .await?;

        let mut games = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(document) = row.get("document") else {
                continue;
            };
            let Some(id) = document
                .get("name")
                .and_then(Value::as_str)
                .and_then(|name| name.rsplit('/').next())
            else {
                continue;
            };
            let Some(fields) = document.get("fields") else {
                continue;
            };
            games.push(decode_game(id, fields));
        }
        Ok(games)
    }

    async fn wipe_games(&self) -> Result<u64, StoreError> {
        let mut wiped = 0u64;
        loop {
            let rows = self
                .run_query(json!({
                    "structuredQuery": {
                        "from": [{ "collectionId": "games" }],
                        "select": { "fields": [{ "fieldPath": "__name__" }] },
                        "limit": 400,
                    }
                }))
                .await?;
            let names: Vec<String> = rows
                .iter()
                .filter_map(|row| row.get("document")?.get("name")?.as_str().map(str::to_string))
                .collect();
            if names.is_empty() {
                break;
            }
            let writes: Vec<Value> = names.iter().map(|name| json!({ "delete": name })).collect();
            self.commit(writes).await?;
            wiped += names.len() as u64;
        }
        Ok(wiped)
    }

    async fn read_watermark(&self) -> Result<Option<NaiveDate>, StoreError> {
        let document = self
            .call(Method::GET, self.doc_url("meta/sync"), None)
            .await?;
        Ok(document
            .as_ref()
            .and_then(|doc| doc.get("fields"))
            .and_then(|fields| fs_read_string(fields, "lastSyncDate"))
            .and_then(|text| NaiveDate::parse_from_str(&text, "%Y-%m-%d").ok()))
    }

    async fn write_watermark(&self, date: NaiveDate) -> Result<(), StoreError> {
        let url = format!(
            "{}?updateMask.fieldPaths=lastSyncDate",
            self.doc_url("meta/sync")
        );
        self.call(
            Method::PATCH,
            url,
            Some(json!({ "fields": { "lastSyncDate": fs_string(&date.to_string()) } })),
        )
        .await?;
        Ok(())
    }

    async fn read_pinned(&self) -> Result<Vec<String>, StoreError> {
        let document = self
            .call(Method::GET, self.doc_url("meta/curation"), None)
            .await?;
        let values = document
            .as_ref()
            .and_then(|doc| doc.get("fields"))
            .and_then(|fields| fields.get("pinned"))
            .and_then(|value| value.get("arrayValue"))
            .and_then(|value| value.get("values"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(values
            .iter()
            .filter_map(|value| value.get("stringValue")?.as_str().map(str::to_string))
            .collect())
    }

    async fn write_pinned(&self, ids: &[String]) -> Result<(), StoreError> {
        let values: Vec<Value> = ids.iter().map(|id| fs_string(id)).collect();
        let url = format!(
            "{}?updateMask.fieldPaths=pinned",
            self.doc_url("meta/curation")
        );
        self.call(
            Method::PATCH,
            url,
            Some(json!({ "fields": { "pinned": { "arrayValue": { "values": values } } } })),
        )
        .await?;
        Ok(())
    }

    async fn write_category_run(
        &self,
        bucket: BucketId,
        run_id: i64,
        items: &[CategoryItem],
    ) -> Result<(), StoreError> {
        let values: Vec<Value> = items.iter().map(encode_category_item).collect();
        let url = self.doc_url(&format!("categories/{}/runs/{}", bucket.as_str(), run_id));
        self.call(
            Method::PATCH,
            url,
            Some(json!({
                "fields": {
                    "items": { "arrayValue": { "values": values } },
                    "createdAt": fs_timestamp(Utc::now()),
                }
            })),
        )
        .await?;
        Ok(())
    }

    async fn activate_category_run(
        &self,
        bucket: BucketId,
        run_id: i64,
    ) -> Result<(), StoreError> {
        let url = format!(
            "{}?updateMask.fieldPaths=activeRun",
            self.doc_url(&format!("categories/{}", bucket.as_str()))
        );
        self.call(
            Method::PATCH,
            url,
            Some(json!({ "fields": { "activeRun": fs_int(run_id) } })),
        )
        .await?;
        Ok(())
    }

    async fn read_active_category(
        &self,
        bucket: BucketId,
    ) -> Result<Vec<CategoryItem>, StoreError> {
        let pointer = self
            .call(
                Method::GET,
                self.doc_url(&format!("categories/{}", bucket.as_str())),
                None,
            )
            .await?;
        let Some(run_id) = pointer
            .as_ref()
            .and_then(|doc| doc.get("fields"))
            .and_then(|fields| fs_read_i64(fields, "activeRun"))
        else {
            return Ok(vec![]);
        };

        let run = self
            .call(
                Method::GET,
                self.doc_url(&format!("categories/{}/runs/{}", bucket.as_str(), run_id)),
                None,
            )
            .await?;
        let values = run
            .as_ref()
            .and_then(|doc| doc.get("fields"))
            .and_then(|fields| fields.get("items"))
            .and_then(|value| value.get("arrayValue"))
            .and_then(|value| value.get("values"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(values.iter().filter_map(decode_category_item).collect())
    }

    async fn upsert_user(&self, chat_id: i64, username: Option<&str>) -> Result<(), StoreError> {
        let mut query = "?updateMask.fieldPaths=chatId&updateMask.fieldPaths=lastSeenAt".to_string();
        let mut fields = serde_json::Map::new();
        fields.insert("chatId".to_string(), fs_int(chat_id));
        fields.insert("lastSeenAt".to_string(), fs_timestamp(Utc::now()));
        if let Some(username) = username {
            query.push_str("&updateMask.fieldPaths=username");
            fields.insert("username".to_string(), fs_string(username));
        }

        let url = format!("{}{}", self.doc_url(&format!("users/{chat_id}")), query);
        self.call(
            Method::PATCH,
            url,
            Some(json!({ "fields": Value::Object(fields) })),
        )
        .await?;
        Ok(())
    }

    async fn list_user_ids(&self) -> Result<Vec<i64>, StoreError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!("{}?pageSize=300", self.doc_url("users"));
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={token}"));
            }
            let Some(result) = self.call(Method::GET, url, None).await? else {
                break;
            };
            let documents = result
                .get("documents")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for document in &documents {
                let id = document
                    .get("fields")
                    .and_then(|fields| fs_read_i64(fields, "chatId"))
                    .or_else(|| {
                        document
                            .get("name")
                            .and_then(Value::as_str)
                            .and_then(|name| name.rsplit('/').next())
                            .and_then(|raw| raw.parse::<i64>().ok())
                    });
                if let Some(id) = id {
                    ids.push(id);
                }
            }
            page_token = result
                .get("nextPageToken")
                .and_then(Value::as_str)
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(ids)
    }

    async fn ping(&self) -> Result<Value, StoreError> {
        let watermark = self.read_watermark().await?;
        Ok(json!({
            "ok": true,
            "project": self.project_id,
            "lastSyncDate": watermark.map(|date| date.to_string()),
        }))
    }
}

struct TelegramMessenger {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramMessenger {
    fn from_env(client: reqwest::Client) -> anyhow::Result<Self> {
        let token =
            std::env::var("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN is required")?;
        let api_base = std::env::var("TELEGRAM_API_BASE_URL")
            .ok()
            .unwrap_or_else(|| "https://api.telegram.org".to_string());
        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
        })
    }

    async fn call(&self, method: &str, chat_id: i64, payload: Value) -> Result<(), DeliveryError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|error| DeliveryError {
                chat_id,
                detail: error.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            return Err(DeliveryError {
                chat_id,
                detail: format!(
                    "{method} returned {status}: {}",
                    truncate_chars_with_ellipsis(&body, 300)
                ),
            });
        }
        Ok(())
    }
}

/// Bot API method and payload field per media kind.
fn payload_method(payload: &BroadcastPayload) -> (&'static str, &'static str) {
    match payload.kind {
        funhall_common::MediaKind::Photo => ("sendPhoto", "photo"),
        funhall_common::MediaKind::Video => ("sendVideo", "video"),
        funhall_common::MediaKind::VideoNote => ("sendVideoNote", "video_note"),
        funhall_common::MediaKind::Document => ("sendDocument", "document"),
        funhall_common::MediaKind::Audio => ("sendAudio", "audio"),
        funhall_common::MediaKind::Text => ("sendMessage", "text"),
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.call(
            "sendMessage",
            chat_id,
            json!({ "chat_id": chat_id, "text": text }),
        )
        .await
    }

    async fn send_payload(
        &self,
        chat_id: i64,
        payload: &BroadcastPayload,
    ) -> Result<(), DeliveryError> {
        let (method, field) = payload_method(payload);
        let mut body = serde_json::Map::new();
        body.insert("chat_id".to_string(), json!(chat_id));
        body.insert(field.to_string(), json!(payload.content));
        if let Some(caption) = &payload.caption {
            body.insert("caption".to_string(), json!(caption));
        }
        self.call(method, chat_id, Value::Object(body)).await
    }

    async fn send_confirm_prompt(
        &self,
        chat_id: i64,
        payload: &BroadcastPayload,
    ) -> Result<(), DeliveryError> {
        self.send_payload(chat_id, payload).await?;
        self.call(
            "sendMessage",
            chat_id,
            json!({
                "chat_id": chat_id,
                "text": format!("Send this {} to all users?", payload.describe()),
                "reply_markup": {
                    "inline_keyboard": [[
                        { "text": "✅ Send", "callback_data": "approve_broadcast" },
                        { "text": "❌ Cancel", "callback_data": "decline_broadcast" }
                    ]]
                }
            }),
        )
        .await
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), DeliveryError> {
        self.call(
            "answerCallbackQuery",
            0,
            json!({ "callback_query_id": callback_id, "text": text }),
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    #[allow(dead_code)]
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    chat: TgChat,
    #[serde(default)]
    from: Option<TgUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Option<Vec<TgPhotoSize>>,
    #[serde(default)]
    video: Option<TgFile>,
    #[serde(default)]
    video_note: Option<TgFile>,
    #[serde(default)]
    document: Option<TgFile>,
    #[serde(default)]
    audio: Option<TgFile>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgPhotoSize {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    id: String,
    from: TgUser,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    data: Option<String>,
}

fn to_inbound(message: &TgMessage) -> InboundMessage {
    InboundMessage {
        text: message.text.clone(),
        // Telegram sends photo sizes smallest-first; keep the largest.
        photo: message
            .photo
            .as_ref()
            .and_then(|sizes| sizes.last())
            .map(|size| size.file_id.clone()),
        video: message.video.as_ref().map(|file| file.file_id.clone()),
        video_note: message.video_note.as_ref().map(|file| file.file_id.clone()),
        document: message.document.as_ref().map(|file| file.file_id.clone()),
        audio: message.audio.as_ref().map(|file| file.file_id.clone()),
        caption: message.caption.clone(),
    }
}

/// Cooldown gate for quota-exhausted storage. Lock-free so the serving path
/// never blocks on it.
struct QuotaBreaker {
    cooldown_ms: i64,
    tripped_at_ms: AtomicI64,
}

impl QuotaBreaker {
    fn new(cooldown: Duration) -> Self {
        Self {
            cooldown_ms: cooldown.as_millis() as i64,
            tripped_at_ms: AtomicI64::new(0),
        }
    }

    fn trip(&self) {
        self.tripped_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn is_open(&self) -> bool {
        let tripped_at = self.tripped_at_ms.load(Ordering::Relaxed);
        tripped_at != 0 && Utc::now().timestamp_millis() - tripped_at < self.cooldown_ms
    }
}

struct CachedCell<T> {
    ttl: Duration,
    slot: Mutex<CellSlot<T>>,
}

struct CellSlot<T> {
    value: Option<(Instant, T)>,
    inflight: Option<watch::Receiver<Option<T>>>,
}

enum RebuildRole<T> {
    Leader(watch::Sender<Option<T>>),
    Follower(watch::Receiver<Option<T>>),
}

impl<T: Clone + Send + Sync + 'static> CachedCell<T> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(CellSlot {
                value: None,
                inflight: None,
            }),
        }
    }

    async fn invalidate(&self) {
        self.slot.lock().await.value = None;
    }

    /// Serve fresh, else rebuild with at most one in-flight computation per
    /// cell; late readers attach to it. Degrades to the last good value when
    /// the breaker is open, the rebuild fails, or the wait times out.
    async fn get_or_rebuild<F, Fut>(
        &self,
        breaker: &QuotaBreaker,
        rebuild: F,
    ) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let (stale, role) = {
            let mut slot = self.slot.lock().await;
            if let Some((cached_at, value)) = &slot.value {
                if cached_at.elapsed() < self.ttl {
                    return Ok(value.clone());
                }
            }
            let stale = slot.value.as_ref().map(|(_, value)| value.clone());

            if breaker.is_open() {
                return stale.ok_or_else(|| {
                    CacheError::Unavailable(
                        "storage cooldown active and no cached value exists".to_string(),
                    )
                });
            }

            match &slot.inflight {
                Some(rx) => (stale, RebuildRole::Follower(rx.clone())),
                None => {
                    let (tx, rx) = watch::channel(None);
                    slot.inflight = Some(rx);
                    (stale, RebuildRole::Leader(tx))
                }
            }
        };

        match role {
            RebuildRole::Follower(mut rx) => {
                match tokio::time::timeout(REBUILD_WAIT, rx.changed()).await {
                    Ok(Ok(())) => {
                        let published = rx.borrow().clone();
                        match published {
                            Some(value) => Ok(value),
                            None => stale.ok_or_else(|| {
                                CacheError::Unavailable(
                                    "cache rebuild failed and no stale value exists".to_string(),
                                )
                            }),
                        }
                    }
                    _ => stale.ok_or_else(|| {
                        CacheError::Unavailable(
                            "cache rebuild timed out and no stale value exists".to_string(),
                        )
                    }),
                }
            }
            RebuildRole::Leader(tx) => {
                let result = tokio::time::timeout(REBUILD_WAIT, rebuild()).await;
                let mut slot = self.slot.lock().await;
                slot.inflight = None;
                match result {
                    Ok(Ok(value)) => {
                        slot.value = Some((Instant::now(), value.clone()));
                        let _ = tx.send(Some(value.clone()));
                        Ok(value)
                    }
                    Ok(Err(error)) => {
                        if matches!(error, StoreError::QuotaExhausted(_)) {
                            breaker.trip();
                        }
                        let _ = tx.send(None);
                        warn!(error = %error, "cache rebuild failed; degrading to stale value");
                        stale.ok_or_else(|| CacheError::Unavailable(error.to_string()))
                    }
                    Err(_) => {
                        let _ = tx.send(None);
                        stale.ok_or_else(|| {
                            CacheError::Unavailable("cache rebuild timed out".to_string())
                        })
                    }
                }
            }
        }
    }
}

struct KeyedCache<T> {
    ttl: Duration,
    cells: Mutex<HashMap<String, Arc<CachedCell<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> KeyedCache<T> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cells: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_rebuild<F, Fut>(
        &self,
        key: &str,
        breaker: &QuotaBreaker,
        rebuild: F,
    ) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            // Crude bound on key growth: reset the whole map when full.
            if cells.len() >= KEYED_CACHE_MAX_ENTRIES && !cells.contains_key(key) {
                cells.clear();
            }
            cells
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CachedCell::new(self.ttl)))
                .clone()
        };
        cell.get_or_rebuild(breaker, rebuild).await
    }

    async fn clear(&self) {
        self.cells.lock().await.clear();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "funhall_service=debug,tower_http=info".to_string()),
        )
        .init();

    let client = reqwest::Client::new();
    let config = Arc::new(ServiceConfig::from_env()?);
    let curation = Arc::new(load_curation_config());
    let store: Arc<dyn CatalogStore> = Arc::new(FirestoreStore::from_env(client.clone())?);
    let upstream: Arc<dyn UpstreamCatalog> = Arc::new(GamesApiClient::from_env(client.clone())?);
    let messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::from_env(client.clone())?);

    let state = AppState {
        config,
        curation,
        store,
        upstream,
        messenger,
        client,
        breaker: Arc::new(QuotaBreaker::new(Duration::from_secs(parse_env_u64(
            "QUOTA_COOLDOWN_SECONDS",
            60,
        )))),
        geo_breaker: Arc::new(QuotaBreaker::new(Duration::from_secs(60))),
        home_cache: Arc::new(CachedCell::new(Duration::from_secs(parse_env_u64(
            "HOME_CACHE_TTL_SECONDS",
            120,
        )))),
        game_cache: Arc::new(KeyedCache::new(Duration::from_secs(parse_env_u64(
            "GAME_CACHE_TTL_SECONDS",
            300,
        )))),
        geo_cache: Arc::new(KeyedCache::new(Duration::from_secs(parse_env_u64(
            "GEO_CACHE_TTL_SECONDS",
            600,
        )))),
        drafts: Arc::new(Mutex::new(HashMap::new())),
        sync_lock: Arc::new(Mutex::new(())),
    };

    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running funhall-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = parse_bind_addr("BIND_ADDR", "0.0.0.0:8080")?;
    info!(%bind_addr, "funhall-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/debug/firestore", get(debug_firestore_handler))
        .route("/api/home", get(home_handler))
        .route("/api/games/{game_id}", get(game_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/admin/reset", post(reset_handler))
        .route("/api/admin/best-games/pull", post(best_games_pull_handler))
        .route("/api/geo", get(geo_handler))
        .route("/api/geo/reverse", post(reverse_geo_handler))
        .route("/telegram/webhook/{secret}", post(telegram_webhook_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

fn parse_env_u64(var_name: &str, default: u64) -> u64 {
    std::env::var(var_name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
}

fn truncate_chars_with_ellipsis(text: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (idx, ch) in text.chars().enumerate() {
        if idx >= max_chars {
            out.push_str("...[truncated]");
            return out;
        }
        out.push(ch);
    }
    out
}

async fn health() -> Json<Value> {
    Json(json!({"ok": true, "service": "funhall-service"}))
}

async fn debug_firestore_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let status = state
        .store
        .ping()
        .await
        .map_err(|error| ApiError::bad_gateway(format!("firestore probe failed: {error}")))?;
    Ok(Json(status))
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct HomeCategory {
    id: BucketId,
    title: String,
    icon: String,
    games: Vec<GameSummary>,
}

async fn home_handler(State(state): State<AppState>) -> Result<Json<Vec<HomeCategory>>, ApiError> {
    let store = state.store.clone();
    let limit = state.config.bucket_limit;
    let categories = state
        .home_cache
        .get_or_rebuild(&state.breaker, move || async move {
            build_home(store.as_ref(), limit).await
        })
        .await?;
    Ok(Json(categories))
}

async fn game_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<GameSummary>, ApiError> {
    let store = state.store.clone();
    let lookup_id = game_id.clone();
    let summary = state
        .game_cache
        .get_or_rebuild(&game_id, &state.breaker, move || async move {
            Ok(store
                .get_game(&lookup_id)
                .await?
                .map(|record| GameSummary::from_record(&record)))
        })
        .await?;
    summary
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("game {game_id} not found")))
}

async fn sync_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SyncStats>, ApiError> {
    require_admin_secret(&state, &headers)?;
    let _guard = state
        .sync_lock
        .try_lock()
        .map_err(|_| ApiError::conflict("a sync run is already in progress"))?;

    let stats = run_sync(
        state.store.as_ref(),
        state.upstream.as_ref(),
        &state.config,
        &state.curation,
        SyncOptions {
            full_resync: true,
            rebuild_categories: true,
        },
    )
    .await
    .map_err(map_sync_error)?;

    invalidate_catalog_caches(&state).await;
    Ok(Json(stats))
}

async fn reset_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ResetStats>, ApiError> {
    require_admin_secret(&state, &headers)?;
    let _guard = state
        .sync_lock
        .try_lock()
        .map_err(|_| ApiError::conflict("a sync run is already in progress"))?;

    let stats = run_reset(
        state.store.as_ref(),
        state.upstream.as_ref(),
        &state.config,
        &state.curation,
    )
    .await
    .map_err(map_sync_error)?;

    invalidate_catalog_caches(&state).await;
    Ok(Json(stats))
}

#[derive(Debug, Serialize, PartialEq)]
struct BestGamesPullResponse {
    pinned: Vec<String>,
    missed: Vec<String>,
}

async fn best_games_pull_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BestGamesPullResponse>, ApiError> {
    require_admin_secret(&state, &headers)?;
    if state.curation.best_games.is_empty() {
        return Err(ApiError::bad_request(
            "no curated best-games names configured",
        ));
    }

    let pool = fetch_upstream_pool(state.upstream.as_ref(), &state.config)
        .await
        .map_err(map_sync_error)?;
    let (pinned, missed) = match_curated_names(&pool, &state.curation.best_games);

    state
        .store
        .write_pinned(&pinned)
        .await
        .map_err(|error| ApiError::internal(format!("failed to persist pinned set: {error}")))?;
    state.home_cache.invalidate().await;

    info!(
        pinned = pinned.len(),
        missed = missed.len(),
        "curated best games pinned"
    );
    Ok(Json(BestGamesPullResponse { pinned, missed }))
}

#[derive(Debug, Deserialize)]
struct GeoQuery {
    #[serde(default)]
    ip: Option<String>,
}

async fn geo_handler(
    State(state): State<AppState>,
    Query(query): Query<GeoQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ip = normalize_optional_string(query.ip)
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
        .ok_or_else(|| ApiError::bad_request("ip is required"))?;

    let client = state.client.clone();
    let url = format!("{}/{}", state.config.geo_base_url.trim_end_matches('/'), ip);
    let location = state
        .geo_cache
        .get_or_rebuild(&ip, &state.geo_breaker, move || async move {
            proxy_json(&client, &url).await
        })
        .await?;
    Ok(Json(location))
}

#[derive(Debug, Deserialize)]
struct ReverseGeoRequest {
    lat: f64,
    lon: f64,
}

async fn reverse_geo_handler(
    State(state): State<AppState>,
    Json(request): Json<ReverseGeoRequest>,
) -> Result<Json<Value>, ApiError> {
    let key = format!("{:.3},{:.3}", request.lat, request.lon);
    let client = state.client.clone();
    let url = format!(
        "{}?latitude={}&longitude={}&localityLanguage=en",
        state.config.reverse_geo_base_url.trim_end_matches('/'),
        request.lat,
        request.lon
    );
    let location = state
        .geo_cache
        .get_or_rebuild(&key, &state.geo_breaker, move || async move {
            proxy_json(&client, &url).await
        })
        .await?;
    Ok(Json(location))
}

async fn proxy_json(client: &reqwest::Client, url: &str) -> Result<Value, StoreError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|error| StoreError::Backend(format!("geo provider request failed: {error}")))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|error| StoreError::Backend(format!("geo provider body read failed: {error}")))?;
    if !status.is_success() {
        return Err(StoreError::Backend(format!(
            "geo provider returned {status}: {}",
            truncate_chars_with_ellipsis(&body, 300)
        )));
    }
    serde_json::from_str(&body)
        .map_err(|error| StoreError::Backend(format!("geo provider returned invalid json: {error}")))
}

async fn telegram_webhook_handler(
    State(state): State<AppState>,
    Path(secret): Path<String>,
    Json(update): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    if secret != state.config.webhook_secret {
        return Err(ApiError::not_found("unknown webhook path"));
    }

    // The provider retries on non-200; internal failures are logged, never
    // surfaced.
    match serde_json::from_value::<TgUpdate>(update) {
        Ok(update) => {
            if let Err(error) = process_update(&state, update).await {
                warn!(error = %format!("{error:#}"), "telegram update processing failed");
            }
        }
        Err(error) => warn!(error = %error, "discarding malformed telegram update"),
    }
    Ok(Json(json!({"ok": true})))
}

async fn process_update(state: &AppState, update: TgUpdate) -> anyhow::Result<()> {
    if let Some(message) = update.message {
        let chat_id = message.chat.id;
        let text = message.text.as_deref().map(str::trim).unwrap_or("");
        let is_admin = state.config.admin_chat_ids.contains(&chat_id);

        if text.starts_with("/start") {
            let username = message.from.as_ref().and_then(|user| user.username.as_deref());
            state.store.upsert_user(chat_id, username).await?;
            info!(chat_id, "user registered");
            if let Err(error) = state.messenger.send_text(chat_id, &state.config.welcome_text).await
            {
                warn!(chat_id, error = %error, "welcome message delivery failed");
            }
            return Ok(());
        }

        if text.starts_with("/broadcast") {
            return dispatch_draft_event(state, chat_id, DraftEvent::StartBroadcast, is_admin)
                .await;
        }

        if text.starts_with('/') {
            return Ok(());
        }

        let has_draft = state.drafts.lock().await.contains_key(&chat_id);
        if has_draft {
            let inbound = to_inbound(&message);
            return dispatch_draft_event(state, chat_id, DraftEvent::Inbound(&inbound), is_admin)
                .await;
        }
        return Ok(());
    }

    if let Some(callback) = update.callback_query {
        let Some(chat_id) = callback.message.as_ref().map(|message| message.chat.id) else {
            return Ok(());
        };
        // Only the admin who opened the draft may settle it, on their own chat.
        let is_admin =
            state.config.admin_chat_ids.contains(&callback.from.id) && callback.from.id == chat_id;

        if let Err(error) = state.messenger.answer_callback(&callback.id, "").await {
            warn!(error = %error, "callback answer failed");
        }

        let event = match callback.data.as_deref() {
            Some("approve_broadcast") => Some(DraftEvent::Approve),
            Some("decline_broadcast") => Some(DraftEvent::Decline),
            _ => None,
        };
        if let Some(event) = event {
            return dispatch_draft_event(state, chat_id, event, is_admin).await;
        }
    }

    Ok(())
}

async fn dispatch_draft_event(
    state: &AppState,
    chat_id: i64,
    event: DraftEvent<'_>,
    is_admin: bool,
) -> anyhow::Result<()> {
    let effects = {
        let mut drafts = state.drafts.lock().await;
        let current = drafts.remove(&chat_id);
        let (next, effects) = funhall_common::advance(current, event, is_admin);
        if let Some(next) = next {
            drafts.insert(chat_id, next);
        }
        effects
    };

    for effect in effects {
        match effect {
            DraftEffect::Reply(text) => {
                if let Err(error) = state.messenger.send_text(chat_id, &text).await {
                    warn!(chat_id, error = %error, "draft reply delivery failed");
                }
            }
            DraftEffect::EchoDraft(payload) => {
                if let Err(error) = state.messenger.send_confirm_prompt(chat_id, &payload).await {
                    warn!(chat_id, error = %error, "draft echo delivery failed");
                }
            }
            DraftEffect::FanOut(payload) => run_broadcast(state, chat_id, &payload).await?,
        }
    }
    Ok(())
}

async fn run_broadcast(
    state: &AppState,
    admin_chat_id: i64,
    payload: &BroadcastPayload,
) -> anyhow::Result<()> {
    let recipients = state.store.list_user_ids().await?;
    let total = recipients.len();
    let mut delivered = 0usize;
    for chat_id in recipients {
        match state.messenger.send_payload(chat_id, payload).await {
            Ok(()) => delivered += 1,
            Err(error) => {
                warn!(chat_id, error = %error, "broadcast delivery failed; skipping recipient");
            }
        }
    }

    info!(
        admin_chat_id,
        delivered,
        total,
        kind = payload.describe(),
        "broadcast fan-out finished"
    );
    let report = format!("Broadcast delivered to {delivered} of {total} users.");
    if let Err(error) = state.messenger.send_text(admin_chat_id, &report).await {
        warn!(admin_chat_id, error = %error, "broadcast report delivery failed");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct SyncOptions {
    full_resync: bool,
    rebuild_categories: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct SyncStats {
    pages: u32,
    fetched: usize,
    upserted: usize,
    skipped_unpublished: usize,
    skipped_invalid: usize,
    watermark: String,
    full_resync: bool,
}

fn finalize_record(
    upstream: &dyn UpstreamCatalog,
    mut record: GameRecord,
) -> Result<GameRecord, ConfigError> {
    if let Some(api_url) = record.api_url.clone() {
        record.embed_url = Some(upstream.build_embed_url(&api_url)?);
    }
    Ok(record)
}

/// One catalog sync run. Pages are fetched and committed strictly in order;
/// the watermark is written only after the loop stops benignly, so an
/// aborted run narrows nothing.
async fn run_sync(
    store: &dyn CatalogStore,
    upstream: &dyn UpstreamCatalog,
    config: &ServiceConfig,
    curation: &CurationLists,
    options: SyncOptions,
) -> anyhow::Result<SyncStats> {
    let run_id = Uuid::new_v4();
    let watermark = store.read_watermark().await?;
    let since = if options.full_resync { None } else { watermark };
    info!(
        sync_run_id = %run_id,
        ?since,
        full_resync = options.full_resync,
        "catalog sync started"
    );

    let mut stats = SyncStats {
        pages: 0,
        fetched: 0,
        upserted: 0,
        skipped_unpublished: 0,
        skipped_invalid: 0,
        watermark: String::new(),
        full_resync: options.full_resync,
    };
    let mut last_seen_updated_ts: i64 = 0;
    let mut page = 1u32;

    loop {
        if page > config.max_pages {
            warn!(
                sync_run_id = %run_id,
                max_pages = config.max_pages,
                "page ceiling reached; stopping sync loop"
            );
            break;
        }

        let fetched_page = upstream.fetch_page(page, config.per_page, since).await?;
        stats.pages = page;
        if fetched_page.records.is_empty() {
            break;
        }
        let page_size = fetched_page.records.len();

        let mut batch = Vec::with_capacity(page_size);
        for raw in &fetched_page.records {
            stats.fetched += 1;
            let Some(record) = normalize_game(raw) else {
                stats.skipped_invalid += 1;
                continue;
            };
            if !record.enabled {
                stats.skipped_unpublished += 1;
                continue;
            }
            let record = finalize_record(upstream, record)?;
            last_seen_updated_ts = last_seen_updated_ts.max(record.published_at_ts);
            batch.push(record);
        }

        // Page N+1 is not fetched until page N's chunks are committed.
        for chunk in batch.chunks(config.chunk_size) {
            store.upsert_games(chunk).await?;
            stats.upserted += chunk.len();
        }

        if let Some(last_page) = fetched_page.last_page {
            if page >= last_page {
                break;
            }
        }
        if (page_size as u32) < config.per_page {
            break;
        }
        page += 1;
    }

    let today = Utc::now().date_naive();
    store.write_watermark(today).await?;
    stats.watermark = today.to_string();

    if options.rebuild_categories {
        rebuild_categories(store, curation, config).await?;
    }

    info!(
        sync_run_id = %run_id,
        pages = stats.pages,
        fetched = stats.fetched,
        upserted = stats.upserted,
        skipped_unpublished = stats.skipped_unpublished,
        skipped_invalid = stats.skipped_invalid,
        last_seen_updated_ts,
        "catalog sync finished"
    );
    Ok(stats)
}

async fn rebuild_categories(
    store: &dyn CatalogStore,
    curation: &CurationLists,
    config: &ServiceConfig,
) -> Result<(), StoreError> {
    let working = store.list_enabled_games(config.working_set_cap).await?;
    for (bucket, select) in CATEGORY_RULES {
        let run_id = Utc::now().timestamp_millis();
        let picks = select(&working, curation, config.bucket_limit);
        let items: Vec<CategoryItem> = picks
            .iter()
            .enumerate()
            .map(|(index, game)| CategoryItem {
                rank: (index + 1) as u32,
                game: GameSummary::from_record(game),
            })
            .collect();

        // Readers follow the active-run pointer; it only flips once the new
        // run's items are fully written.
        store.write_category_run(bucket, run_id, &items).await?;
        store.activate_category_run(bucket, run_id).await?;
        info!(
            bucket = bucket.as_str(),
            run_id,
            items = items.len(),
            "category bucket rebuilt"
        );
    }
    Ok(())
}

async fn build_home(store: &dyn CatalogStore, limit: usize) -> Result<Vec<HomeCategory>, StoreError> {
    let pinned_ids = store.read_pinned().await?;
    let mut home = Vec::with_capacity(HOME_BUCKETS.len());
    for meta in HOME_BUCKETS {
        let items = store.read_active_category(meta.id).await?;
        let mut games: Vec<GameSummary> = items.into_iter().map(|item| item.game).collect();

        if meta.id == BucketId::Best && !pinned_ids.is_empty() {
            let mut pinned_games = Vec::with_capacity(pinned_ids.len());
            for id in &pinned_ids {
                if let Some(found) = games.iter().find(|game| &game.id == id) {
                    pinned_games.push(found.clone());
                } else if let Some(record) = store.get_game(id).await? {
                    pinned_games.push(GameSummary::from_record(&record));
                }
                // Pinned ids that no longer resolve are dropped silently.
            }
            games = merge_pinned_first(&pinned_games, &games, limit, |game| game.id.as_str());
        }

        home.push(HomeCategory {
            id: meta.id,
            title: meta.title.to_string(),
            icon: meta.icon.to_string(),
            games,
        });
    }
    Ok(home)
}

#[derive(Debug, Serialize, PartialEq)]
struct ResetStats {
    wiped: u64,
    seeded: usize,
}

/// Wipe the catalog and reseed with the newest published records.
async fn run_reset(
    store: &dyn CatalogStore,
    upstream: &dyn UpstreamCatalog,
    config: &ServiceConfig,
    curation: &CurationLists,
) -> anyhow::Result<ResetStats> {
    let wiped = store.wipe_games().await?;
    let mut seeded = 0usize;
    let mut page = 1u32;

    while seeded < config.reset_seed_count && page <= config.max_pages {
        let fetched_page = upstream.fetch_page(page, config.per_page, None).await?;
        if fetched_page.records.is_empty() {
            break;
        }
        let page_size = fetched_page.records.len();

        let mut batch = Vec::new();
        for raw in &fetched_page.records {
            if seeded + batch.len() >= config.reset_seed_count {
                break;
            }
            let Some(record) = normalize_game(raw) else {
                continue;
            };
            if !record.enabled {
                continue;
            }
            batch.push(finalize_record(upstream, record)?);
        }
        for chunk in batch.chunks(config.chunk_size) {
            store.upsert_games(chunk).await?;
            seeded += chunk.len();
        }

        if let Some(last_page) = fetched_page.last_page {
            if page >= last_page {
                break;
            }
        }
        if (page_size as u32) < config.per_page {
            break;
        }
        page += 1;
    }

    store.write_watermark(Utc::now().date_naive()).await?;
    rebuild_categories(store, curation, config).await?;
    info!(wiped, seeded, "catalog reset complete");
    Ok(ResetStats { wiped, seeded })
}

async fn fetch_upstream_pool(
    upstream: &dyn UpstreamCatalog,
    config: &ServiceConfig,
) -> anyhow::Result<Vec<GameRecord>> {
    let mut pool = Vec::new();
    let mut page = 1u32;
    while pool.len() < config.working_set_cap && page <= config.max_pages {
        let fetched_page = upstream.fetch_page(page, config.per_page, None).await?;
        if fetched_page.records.is_empty() {
            break;
        }
        let page_size = fetched_page.records.len();
        pool.extend(
            fetched_page
                .records
                .iter()
                .filter_map(normalize_game)
                .filter(|game| game.enabled),
        );

        if let Some(last_page) = fetched_page.last_page {
            if page >= last_page {
                break;
            }
        }
        if (page_size as u32) < config.per_page {
            break;
        }
        page += 1;
    }
    pool.truncate(config.working_set_cap);
    Ok(pool)
}

async fn invalidate_catalog_caches(state: &AppState) {
    state.home_cache.invalidate().await;
    state.game_cache.clear().await;
}

fn map_sync_error(error: anyhow::Error) -> ApiError {
    if error.downcast_ref::<UpstreamError>().is_some() {
        ApiError::bad_gateway(format!("{error:#}"))
    } else {
        ApiError::internal(format!("{error:#}"))
    }
}

fn require_admin_secret(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.admin_secret.as_deref() else {
        return Err(ApiError::unauthorized(
            "admin endpoints are disabled; ADMIN_SECRET is not configured",
        ));
    };
    let provided = headers
        .get("x-admin-secret")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if provided != expected {
        return Err(ApiError::unauthorized("invalid admin secret"));
    }
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::Unavailable(message) => Self::unavailable(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funhall_common::MediaKind;
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
    };

    #[derive(Default)]
    struct RecordingStore {
        games: StdMutex<HashMap<String, GameRecord>>,
        watermark: StdMutex<Option<NaiveDate>>,
        pinned: StdMutex<Vec<String>>,
        runs: StdMutex<HashMap<(BucketId, i64), Vec<CategoryItem>>>,
        active: StdMutex<HashMap<BucketId, i64>>,
        users: StdMutex<Vec<i64>>,
        ops: StdMutex<Vec<String>>,
    }

    impl RecordingStore {
        fn log(&self, op: String) {
            self.ops.lock().unwrap().push(op);
        }
    }

    #[async_trait]
    impl CatalogStore for RecordingStore {
        async fn upsert_games(&self, games: &[GameRecord]) -> Result<(), StoreError> {
            self.log(format!("upsert:{}", games.len()));
            let mut stored = self.games.lock().unwrap();
            for game in games {
                stored.insert(game.id.clone(), game.clone());
            }
            Ok(())
        }

        async fn get_game(&self, id: &str) -> Result<Option<GameRecord>, StoreError> {
            Ok(self.games.lock().unwrap().get(id).cloned())
        }

        async fn list_enabled_games(&self, limit: usize) -> Result<Vec<GameRecord>, StoreError> {
            let mut games: Vec<GameRecord> = self
                .games
                .lock()
                .unwrap()
                .values()
                .filter(|game| game.enabled)
                .cloned()
                .collect();
            games.sort_by(|a, b| b.published_at_ts.cmp(&a.published_at_ts));
            games.truncate(limit);
            Ok(games)
        }

        async fn wipe_games(&self) -> Result<u64, StoreError> {
            let mut stored = self.games.lock().unwrap();
            let wiped = stored.len() as u64;
            stored.clear();
            Ok(wiped)
        }

        async fn read_watermark(&self) -> Result<Option<NaiveDate>, StoreError> {
            Ok(*self.watermark.lock().unwrap())
        }

        async fn write_watermark(&self, date: NaiveDate) -> Result<(), StoreError> {
            *self.watermark.lock().unwrap() = Some(date);
            Ok(())
        }

        async fn read_pinned(&self) -> Result<Vec<String>, StoreError> {
            Ok(self.pinned.lock().unwrap().clone())
        }

        async fn write_pinned(&self, ids: &[String]) -> Result<(), StoreError> {
            *self.pinned.lock().unwrap() = ids.to_vec();
            Ok(())
        }

        async fn write_category_run(
            &self,
            bucket: BucketId,
            run_id: i64,
            items: &[CategoryItem],
        ) -> Result<(), StoreError> {
            self.log(format!("write_run:{}:{run_id}", bucket.as_str()));
            self.runs
                .lock()
                .unwrap()
                .insert((bucket, run_id), items.to_vec());
            Ok(())
        }

        async fn activate_category_run(
            &self,
            bucket: BucketId,
            run_id: i64,
        ) -> Result<(), StoreError> {
            self.log(format!("activate:{}:{run_id}", bucket.as_str()));
            self.active.lock().unwrap().insert(bucket, run_id);
            Ok(())
        }

        async fn read_active_category(
            &self,
            bucket: BucketId,
        ) -> Result<Vec<CategoryItem>, StoreError> {
            let Some(run_id) = self.active.lock().unwrap().get(&bucket).copied() else {
                return Ok(vec![]);
            };
            Ok(self
                .runs
                .lock()
                .unwrap()
                .get(&(bucket, run_id))
                .cloned()
                .unwrap_or_default())
        }

        async fn upsert_user(&self, chat_id: i64, _username: Option<&str>) -> Result<(), StoreError> {
            let mut users = self.users.lock().unwrap();
            if !users.contains(&chat_id) {
                users.push(chat_id);
            }
            Ok(())
        }

        async fn list_user_ids(&self) -> Result<Vec<i64>, StoreError> {
            Ok(self.users.lock().unwrap().clone())
        }

        async fn ping(&self) -> Result<Value, StoreError> {
            Ok(json!({"ok": true}))
        }
    }

    struct FakeUpstream {
        pages: Vec<Result<CatalogPage, String>>,
        seen_since: StdMutex<Vec<Option<NaiveDate>>>,
    }

    impl FakeUpstream {
        fn new(pages: Vec<Result<CatalogPage, String>>) -> Self {
            Self {
                pages,
                seen_since: StdMutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl UpstreamCatalog for FakeUpstream {
        async fn fetch_page(
            &self,
            page: u32,
            _per_page: u32,
            since: Option<NaiveDate>,
        ) -> Result<CatalogPage, UpstreamError> {
            self.seen_since.lock().unwrap().push(since);
            match self.pages.get((page - 1) as usize) {
                Some(Ok(fetched)) => Ok(fetched.clone()),
                Some(Err(message)) => Err(UpstreamError::Status {
                    status: 500,
                    body: message.clone(),
                }),
                None => Ok(CatalogPage {
                    records: vec![],
                    last_page: None,
                }),
            }
        }

        fn build_embed_url(&self, raw_url: &str) -> Result<String, ConfigError> {
            Ok(format!("{raw_url}?token=test-token"))
        }
    }

    #[derive(Default)]
    struct RecordingMessenger {
        texts: StdMutex<Vec<(i64, String)>>,
        payloads: StdMutex<Vec<(i64, BroadcastPayload)>>,
        prompts: StdMutex<Vec<i64>>,
        fail_chats: Vec<i64>,
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
            self.texts.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn send_payload(
            &self,
            chat_id: i64,
            payload: &BroadcastPayload,
        ) -> Result<(), DeliveryError> {
            if self.fail_chats.contains(&chat_id) {
                return Err(DeliveryError {
                    chat_id,
                    detail: "bot was blocked by the user".to_string(),
                });
            }
            self.payloads.lock().unwrap().push((chat_id, payload.clone()));
            Ok(())
        }

        async fn send_confirm_prompt(
            &self,
            chat_id: i64,
            _payload: &BroadcastPayload,
        ) -> Result<(), DeliveryError> {
            self.prompts.lock().unwrap().push(chat_id);
            Ok(())
        }

        async fn answer_callback(
            &self,
            _callback_id: &str,
            _text: &str,
        ) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            admin_secret: Some("secret".to_string()),
            admin_chat_ids: vec![99],
            per_page: 150,
            chunk_size: 250,
            max_pages: 50,
            bucket_limit: 60,
            working_set_cap: 2000,
            reset_seed_count: 300,
            welcome_text: "welcome!".to_string(),
            webhook_secret: "hook".to_string(),
            geo_base_url: "http://geo.test/json".to_string(),
            reverse_geo_base_url: "http://reverse.test".to_string(),
        }
    }

    fn test_state(
        store: Arc<RecordingStore>,
        upstream: Arc<FakeUpstream>,
        messenger: Arc<RecordingMessenger>,
        config: ServiceConfig,
    ) -> AppState {
        AppState {
            config: Arc::new(config),
            curation: Arc::new(CurationLists::default()),
            store,
            upstream,
            messenger,
            client: reqwest::Client::new(),
            breaker: Arc::new(QuotaBreaker::new(Duration::from_secs(60))),
            geo_breaker: Arc::new(QuotaBreaker::new(Duration::from_secs(60))),
            home_cache: Arc::new(CachedCell::new(Duration::from_secs(60))),
            game_cache: Arc::new(KeyedCache::new(Duration::from_secs(60))),
            geo_cache: Arc::new(KeyedCache::new(Duration::from_secs(60))),
            drafts: Arc::new(Mutex::new(HashMap::new())),
            sync_lock: Arc::new(Mutex::new(())),
        }
    }

    fn raw_game(id: &str, published: bool, updated_at: &str) -> Value {
        json!({
            "id": id,
            "name": format!("Game {id}"),
            "provider": {"name": "Acme"},
            "published": published,
            "rtp": 96.0,
            "published_at": updated_at,
            "created_at": "2026-01-01T00:00:00Z",
            "url": format!("https://games.example/play/{id}"),
        })
    }

    fn page_of(count: usize, offset: usize) -> CatalogPage {
        CatalogPage {
            records: (0..count)
                .map(|index| raw_game(&format!("g{}", offset + index), true, "2026-06-01T00:00:00Z"))
                .collect(),
            last_page: None,
        }
    }

    #[tokio::test]
    async fn sync_stops_on_short_page_and_counts_records() {
        let store = RecordingStore::default();
        let upstream = FakeUpstream::new(vec![
            Ok(page_of(150, 0)),
            Ok(page_of(150, 150)),
            Ok(page_of(10, 300)),
        ]);
        let config = test_config();

        let stats = run_sync(
            &store,
            &upstream,
            &config,
            &CurationLists::default(),
            SyncOptions {
                full_resync: false,
                rebuild_categories: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(stats.pages, 3);
        assert_eq!(stats.fetched, 310);
        assert_eq!(stats.upserted, 310);
        assert_eq!(store.games.lock().unwrap().len(), 310);
        assert_eq!(upstream.seen_since.lock().unwrap().len(), 3);
        assert!(store.watermark.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_passes_watermark_as_since_filter() {
        let store = RecordingStore::default();
        let date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        *store.watermark.lock().unwrap() = Some(date);
        let upstream = FakeUpstream::new(vec![Ok(CatalogPage {
            records: vec![],
            last_page: None,
        })]);

        run_sync(
            &store,
            &upstream,
            &test_config(),
            &CurationLists::default(),
            SyncOptions {
                full_resync: false,
                rebuild_categories: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(*upstream.seen_since.lock().unwrap(), vec![Some(date)]);
    }

    #[tokio::test]
    async fn full_resync_omits_the_since_filter() {
        let store = RecordingStore::default();
        *store.watermark.lock().unwrap() = NaiveDate::from_ymd_opt(2026, 6, 1);
        let upstream = FakeUpstream::new(vec![Ok(CatalogPage {
            records: vec![],
            last_page: None,
        })]);

        run_sync(
            &store,
            &upstream,
            &test_config(),
            &CurationLists::default(),
            SyncOptions {
                full_resync: true,
                rebuild_categories: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(*upstream.seen_since.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn sync_filters_unpublished_records() {
        let store = RecordingStore::default();
        let upstream = FakeUpstream::new(vec![Ok(CatalogPage {
            records: vec![
                raw_game("a", true, "2026-06-01T00:00:00Z"),
                raw_game("b", false, "2026-06-01T00:00:00Z"),
                raw_game("c", true, "2026-06-01T00:00:00Z"),
                json!({"name": "no id", "published": true}),
            ],
            last_page: None,
        })]);

        let stats = run_sync(
            &store,
            &upstream,
            &test_config(),
            &CurationLists::default(),
            SyncOptions {
                full_resync: true,
                rebuild_categories: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(stats.fetched, 4);
        assert_eq!(stats.upserted, 2);
        assert_eq!(stats.skipped_unpublished, 1);
        assert_eq!(stats.skipped_invalid, 1);
        let games = store.games.lock().unwrap();
        assert!(games.contains_key("a") && games.contains_key("c"));
        assert!(!games.contains_key("b"));
    }

    #[tokio::test]
    async fn sync_respects_declared_last_page() {
        let store = RecordingStore::default();
        let mut first = page_of(150, 0);
        first.last_page = Some(2);
        let mut second = page_of(150, 150);
        second.last_page = Some(2);
        let upstream = FakeUpstream::new(vec![Ok(first), Ok(second), Ok(page_of(150, 300))]);

        let stats = run_sync(
            &store,
            &upstream,
            &test_config(),
            &CurationLists::default(),
            SyncOptions {
                full_resync: true,
                rebuild_categories: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(stats.pages, 2);
        assert_eq!(upstream.seen_since.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sync_honors_the_page_ceiling() {
        let store = RecordingStore::default();
        // Every page is full, so only the ceiling can stop the loop.
        let pages: Vec<Result<CatalogPage, String>> =
            (0..10).map(|index| Ok(page_of(150, index * 150))).collect();
        let upstream = FakeUpstream::new(pages);
        let config = ServiceConfig {
            max_pages: 4,
            ..test_config()
        };

        let stats = run_sync(
            &store,
            &upstream,
            &config,
            &CurationLists::default(),
            SyncOptions {
                full_resync: true,
                rebuild_categories: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(stats.pages, 4);
        assert_eq!(upstream.seen_since.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn sync_upserts_are_idempotent() {
        let store = RecordingStore::default();
        let upstream = FakeUpstream::new(vec![Ok(page_of(5, 0))]);
        let options = SyncOptions {
            full_resync: true,
            rebuild_categories: false,
        };

        run_sync(&store, &upstream, &test_config(), &CurationLists::default(), options)
            .await
            .unwrap();
        let first_pass = store.games.lock().unwrap().clone();

        let upstream = FakeUpstream::new(vec![Ok(page_of(5, 0))]);
        run_sync(&store, &upstream, &test_config(), &CurationLists::default(), options)
            .await
            .unwrap();
        let second_pass = store.games.lock().unwrap().clone();

        assert_eq!(first_pass.len(), 5);
        assert_eq!(first_pass, second_pass);
    }

    #[tokio::test]
    async fn sync_aborts_without_advancing_watermark_on_upstream_error() {
        let store = RecordingStore::default();
        let upstream = FakeUpstream::new(vec![
            Ok(page_of(150, 0)),
            Err("internal provider error".to_string()),
        ]);

        let result = run_sync(
            &store,
            &upstream,
            &test_config(),
            &CurationLists::default(),
            SyncOptions {
                full_resync: true,
                rebuild_categories: false,
            },
        )
        .await;

        assert!(result.is_err());
        assert!(store.watermark.lock().unwrap().is_none());
        // Committed pages survive the abort.
        assert_eq!(store.games.lock().unwrap().len(), 150);
    }

    #[tokio::test]
    async fn rebuild_writes_every_run_before_flipping_its_pointer() {
        let store = RecordingStore::default();
        let upstream = FakeUpstream::new(vec![Ok(page_of(10, 0))]);

        run_sync(
            &store,
            &upstream,
            &test_config(),
            &CurationLists::default(),
            SyncOptions {
                full_resync: true,
                rebuild_categories: true,
            },
        )
        .await
        .unwrap();

        let ops = store.ops.lock().unwrap().clone();
        for bucket in ["best", "rtp97", "new", "exclusive"] {
            let write_at = ops
                .iter()
                .position(|op| op.starts_with(&format!("write_run:{bucket}:")))
                .unwrap_or_else(|| panic!("missing write for {bucket}"));
            let activate_at = ops
                .iter()
                .position(|op| op.starts_with(&format!("activate:{bucket}:")))
                .unwrap_or_else(|| panic!("missing activate for {bucket}"));
            assert!(write_at < activate_at, "pointer for {bucket} flipped early");
        }

        let best = store.read_active_category(BucketId::Best).await.unwrap();
        assert!(!best.is_empty());
        assert_eq!(best[0].rank, 1);
    }

    #[tokio::test]
    async fn cached_cell_coalesces_concurrent_rebuilds() {
        let cell = Arc::new(CachedCell::<u64>::new(Duration::from_secs(60)));
        let breaker = Arc::new(QuotaBreaker::new(Duration::from_secs(60)));
        let reads = Arc::new(AtomicUsize::new(0));

        let rebuild = |cell: Arc<CachedCell<u64>>,
                       breaker: Arc<QuotaBreaker>,
                       reads: Arc<AtomicUsize>| async move {
            cell.get_or_rebuild(&breaker, move || async move {
                reads.fetch_add(1, AtomicOrdering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(7u64)
            })
            .await
        };

        let results = tokio::join!(
            rebuild(cell.clone(), breaker.clone(), reads.clone()),
            rebuild(cell.clone(), breaker.clone(), reads.clone()),
            rebuild(cell.clone(), breaker.clone(), reads.clone()),
            rebuild(cell.clone(), breaker.clone(), reads.clone()),
            rebuild(cell.clone(), breaker.clone(), reads.clone()),
        );

        assert_eq!(reads.load(AtomicOrdering::SeqCst), 1);
        for value in [results.0, results.1, results.2, results.3, results.4] {
            assert_eq!(value.unwrap(), 7);
        }
    }

    #[tokio::test]
    async fn quota_error_trips_breaker_and_serves_stale_without_storage_calls() {
        // TTL zero: every request is a rebuild candidate.
        let cell = CachedCell::<u64>::new(Duration::ZERO);
        let breaker = QuotaBreaker::new(Duration::from_secs(60));

        let first = cell
            .get_or_rebuild(&breaker, || async { Ok(1u64) })
            .await
            .unwrap();
        assert_eq!(first, 1);

        let second = cell
            .get_or_rebuild(&breaker, || async {
                Err(StoreError::QuotaExhausted("per-day reads".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(second, 1);
        assert!(breaker.is_open());

        let reads = AtomicUsize::new(0);
        let third = cell
            .get_or_rebuild(&breaker, || async {
                reads.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(2u64)
            })
            .await
            .unwrap();
        assert_eq!(third, 1);
        assert_eq!(reads.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_breaker_without_cached_value_is_unavailable() {
        let cell = CachedCell::<u64>::new(Duration::ZERO);
        let breaker = QuotaBreaker::new(Duration::from_secs(60));
        breaker.trip();

        let result = cell.get_or_rebuild(&breaker, || async { Ok(1u64) }).await;
        assert!(matches!(result, Err(CacheError::Unavailable(_))));
    }

    #[tokio::test]
    async fn build_home_serves_pinned_ids_first() {
        let store = RecordingStore::default();
        let summary = |id: &str| GameSummary {
            id: id.to_string(),
            name: format!("Game {id}"),
            provider: "Acme".to_string(),
            thumb: None,
            demo_url: None,
            rtp: Some(96.0),
        };

        store
            .write_category_run(
                BucketId::Best,
                1,
                &[
                    CategoryItem { rank: 1, game: summary("B") },
                    CategoryItem { rank: 2, game: summary("C") },
                    CategoryItem { rank: 3, game: summary("D") },
                ],
            )
            .await
            .unwrap();
        store.activate_category_run(BucketId::Best, 1).await.unwrap();
        *store.pinned.lock().unwrap() = vec!["A".to_string(), "B".to_string()];
        store.games.lock().unwrap().insert(
            "A".to_string(),
            GameRecord {
                id: "A".to_string(),
                name: "Game A".to_string(),
                provider: "Acme".to_string(),
                thumb: None,
                rtp: Some(96.0),
                published_at: None,
                created_at: None,
                published_at_ts: 0,
                created_at_ts: 0,
                enabled: true,
                api_url: None,
                embed_url: None,
            },
        );

        let home = build_home(&store, 3).await.unwrap();
        let best = home
            .iter()
            .find(|category| category.id == BucketId::Best)
            .unwrap();
        let ids: Vec<&str> = best.games.iter().map(|game| game.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    fn command_update(chat_id: i64, text: &str) -> TgUpdate {
        serde_json::from_value(json!({
            "update_id": 1,
            "message": {
                "chat": {"id": chat_id},
                "from": {"id": chat_id, "username": "tester"},
                "text": text,
            }
        }))
        .unwrap()
    }

    fn callback_update(chat_id: i64, from_id: i64, data: &str) -> TgUpdate {
        serde_json::from_value(json!({
            "update_id": 2,
            "callback_query": {
                "id": "cb-1",
                "from": {"id": from_id},
                "data": data,
                "message": {"chat": {"id": chat_id}},
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn broadcast_flow_delivers_to_all_reachable_users() {
        let store = Arc::new(RecordingStore::default());
        *store.users.lock().unwrap() = vec![1, 2, 3];
        let messenger = Arc::new(RecordingMessenger {
            fail_chats: vec![2],
            ..RecordingMessenger::default()
        });
        let upstream = Arc::new(FakeUpstream::new(vec![]));
        let state = test_state(store.clone(), upstream, messenger.clone(), test_config());

        process_update(&state, command_update(99, "/broadcast"))
            .await
            .unwrap();
        assert_eq!(
            state.drafts.lock().await.get(&99),
            Some(&DraftState::WaitingForMessage)
        );

        process_update(&state, command_update(99, "hello players"))
            .await
            .unwrap();
        assert!(matches!(
            state.drafts.lock().await.get(&99),
            Some(DraftState::Confirming(_))
        ));
        assert_eq!(*messenger.prompts.lock().unwrap(), vec![99]);

        process_update(&state, callback_update(99, 99, "approve_broadcast"))
            .await
            .unwrap();
        assert!(state.drafts.lock().await.is_empty());

        let payloads = messenger.payloads.lock().unwrap();
        let recipients: Vec<i64> = payloads.iter().map(|(chat_id, _)| *chat_id).collect();
        assert_eq!(recipients, vec![1, 3]);
        assert!(payloads.iter().all(|(_, payload)| {
            payload.kind == MediaKind::Text && payload.content == "hello players"
        }));

        let texts = messenger.texts.lock().unwrap();
        let report = &texts.last().unwrap().1;
        assert!(report.contains("2 of 3"), "unexpected report: {report}");
    }

    #[tokio::test]
    async fn non_admin_broadcast_is_rejected_without_state() {
        let store = Arc::new(RecordingStore::default());
        let messenger = Arc::new(RecordingMessenger::default());
        let upstream = Arc::new(FakeUpstream::new(vec![]));
        let state = test_state(store, upstream, messenger.clone(), test_config());

        process_update(&state, command_update(7, "/broadcast"))
            .await
            .unwrap();

        assert!(state.drafts.lock().await.is_empty());
        let texts = messenger.texts.lock().unwrap();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].1.contains("administrators"));
    }

    #[tokio::test]
    async fn decline_discards_draft_without_any_delivery() {
        let store = Arc::new(RecordingStore::default());
        *store.users.lock().unwrap() = vec![1, 2];
        let messenger = Arc::new(RecordingMessenger::default());
        let upstream = Arc::new(FakeUpstream::new(vec![]));
        let state = test_state(store, upstream, messenger.clone(), test_config());

        process_update(&state, command_update(99, "/broadcast"))
            .await
            .unwrap();
        process_update(&state, command_update(99, "draft text"))
            .await
            .unwrap();
        process_update(&state, callback_update(99, 99, "decline_broadcast"))
            .await
            .unwrap();

        assert!(state.drafts.lock().await.is_empty());
        assert!(messenger.payloads.lock().unwrap().is_empty());
        let texts = messenger.texts.lock().unwrap();
        assert!(texts.iter().any(|(_, text)| text.contains("cancelled")));
    }

    #[tokio::test]
    async fn foreign_callback_cannot_settle_an_admin_draft() {
        let store = Arc::new(RecordingStore::default());
        *store.users.lock().unwrap() = vec![1];
        let messenger = Arc::new(RecordingMessenger::default());
        let upstream = Arc::new(FakeUpstream::new(vec![]));
        let state = test_state(store, upstream, messenger.clone(), test_config());

        process_update(&state, command_update(99, "/broadcast"))
            .await
            .unwrap();
        process_update(&state, command_update(99, "draft"))
            .await
            .unwrap();
        // Callback from a different user on the admin's chat.
        process_update(&state, callback_update(99, 7, "approve_broadcast"))
            .await
            .unwrap();

        assert!(matches!(
            state.drafts.lock().await.get(&99),
            Some(DraftState::Confirming(_))
        ));
        assert!(messenger.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_command_registers_user_idempotently() {
        let store = Arc::new(RecordingStore::default());
        let messenger = Arc::new(RecordingMessenger::default());
        let upstream = Arc::new(FakeUpstream::new(vec![]));
        let state = test_state(store.clone(), upstream, messenger.clone(), test_config());

        process_update(&state, command_update(5, "/start")).await.unwrap();
        process_update(&state, command_update(5, "/start")).await.unwrap();

        assert_eq!(*store.users.lock().unwrap(), vec![5]);
        let texts = messenger.texts.lock().unwrap();
        assert_eq!(texts.len(), 2);
        assert!(texts.iter().all(|(_, text)| text == "welcome!"));
    }

    #[tokio::test]
    async fn media_message_captures_photo_over_text() {
        let store = Arc::new(RecordingStore::default());
        let messenger = Arc::new(RecordingMessenger::default());
        let upstream = Arc::new(FakeUpstream::new(vec![]));
        let state = test_state(store, upstream, messenger, test_config());

        process_update(&state, command_update(99, "/broadcast"))
            .await
            .unwrap();
        let photo_update: TgUpdate = serde_json::from_value(json!({
            "update_id": 3,
            "message": {
                "chat": {"id": 99},
                "from": {"id": 99},
                "caption": "fresh drop",
                "photo": [
                    {"file_id": "small"},
                    {"file_id": "large"}
                ],
            }
        }))
        .unwrap();
        process_update(&state, photo_update).await.unwrap();

        let drafts = state.drafts.lock().await;
        let Some(DraftState::Confirming(payload)) = drafts.get(&99) else {
            panic!("expected confirming draft");
        };
        assert_eq!(payload.kind, MediaKind::Photo);
        assert_eq!(payload.content, "large");
        assert_eq!(payload.caption.as_deref(), Some("fresh drop"));
    }

    #[tokio::test]
    async fn game_handler_returns_404_for_unknown_id() {
        let store = Arc::new(RecordingStore::default());
        let messenger = Arc::new(RecordingMessenger::default());
        let upstream = Arc::new(FakeUpstream::new(vec![]));
        let state = test_state(store.clone(), upstream, messenger, test_config());

        let error = game_handler(State(state.clone()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);

        store.games.lock().unwrap().insert(
            "g1".to_string(),
            GameRecord {
                id: "g1".to_string(),
                name: "Game One".to_string(),
                provider: "Acme".to_string(),
                thumb: None,
                rtp: Some(95.5),
                published_at: None,
                created_at: None,
                published_at_ts: 0,
                created_at_ts: 0,
                enabled: true,
                api_url: None,
                embed_url: Some("https://games.example/play/g1?token=t".to_string()),
            },
        );
        let found = game_handler(State(state), Path("g1".to_string()))
            .await
            .unwrap()
            .0;
        assert_eq!(found.id, "g1");
        assert_eq!(found.demo_url.as_deref(), Some("https://games.example/play/g1?token=t"));
    }

    #[tokio::test]
    async fn admin_endpoints_require_the_shared_secret() {
        let store = Arc::new(RecordingStore::default());
        let messenger = Arc::new(RecordingMessenger::default());
        let upstream = Arc::new(FakeUpstream::new(vec![Ok(page_of(1, 0))]));
        let state = test_state(store, upstream, messenger, test_config());

        let error = sync_handler(State(state.clone()), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert("x-admin-secret", "secret".parse().unwrap());
        let stats = sync_handler(State(state), headers).await.unwrap().0;
        assert_eq!(stats.upserted, 1);
    }

    #[test]
    fn build_embed_url_appends_token_once() {
        let client = GamesApiClient {
            client: reqwest::Client::new(),
            base_url: "https://games.example/api".to_string(),
            api_token: "api".to_string(),
            embed_token: Some("embed".to_string()),
        };

        assert_eq!(
            client.build_embed_url("https://games.example/play/1").unwrap(),
            "https://games.example/play/1?token=embed"
        );
        assert_eq!(
            client.build_embed_url("https://games.example/play/1?demo=1").unwrap(),
            "https://games.example/play/1?demo=1&token=embed"
        );
        assert_eq!(
            client
                .build_embed_url("https://games.example/play/1?token=keep")
                .unwrap(),
            "https://games.example/play/1?token=keep"
        );
    }

    #[test]
    fn build_embed_url_fails_without_a_token() {
        let client = GamesApiClient {
            client: reqwest::Client::new(),
            base_url: "https://games.example/api".to_string(),
            api_token: "api".to_string(),
            embed_token: None,
        };
        assert!(client.build_embed_url("https://games.example/play/1").is_err());
    }

    #[test]
    fn page_url_includes_the_since_filter_only_when_present() {
        let client = GamesApiClient {
            client: reqwest::Client::new(),
            base_url: "https://games.example/api/".to_string(),
            api_token: "api".to_string(),
            embed_token: None,
        };

        let full = client.page_url(2, 150, None);
        assert!(full.starts_with("https://games.example/api/games?page=2&per_page=150"));
        assert!(!full.contains("updated_from"));

        let since = NaiveDate::from_ymd_opt(2026, 6, 15).unwrap();
        let incremental = client.page_url(1, 150, Some(since));
        assert!(incremental.contains("updated_from=2026-06-15"));
    }

    #[test]
    fn firestore_game_codec_round_trips() {
        let game = GameRecord {
            id: "g7".to_string(),
            name: "Lucky Sevens".to_string(),
            provider: "SpinWorks".to_string(),
            thumb: Some("https://cdn.example/g7.png".to_string()),
            rtp: Some(97.4),
            published_at: Some(Utc::now()),
            created_at: None,
            published_at_ts: 1_750_000_000_000,
            created_at_ts: 0,
            enabled: true,
            api_url: Some("https://games.example/play/g7".to_string()),
            embed_url: Some("https://games.example/play/g7?token=t".to_string()),
        };

        let fields = encode_game_fields(&game);
        let decoded = decode_game("g7", &fields);

        assert_eq!(decoded.id, game.id);
        assert_eq!(decoded.name, game.name);
        assert_eq!(decoded.provider, game.provider);
        assert_eq!(decoded.thumb, game.thumb);
        assert_eq!(decoded.rtp, game.rtp);
        assert_eq!(decoded.published_at_ts, game.published_at_ts);
        assert_eq!(decoded.enabled, game.enabled);
        assert_eq!(decoded.embed_url, game.embed_url);
    }

    #[test]
    fn firestore_category_item_codec_round_trips() {
        let item = CategoryItem {
            rank: 3,
            game: GameSummary {
                id: "g1".to_string(),
                name: "Game One".to_string(),
                provider: "Acme".to_string(),
                thumb: None,
                demo_url: Some("https://games.example/play/g1?token=t".to_string()),
                rtp: Some(96.1),
            },
        };
        let decoded = decode_category_item(&encode_category_item(&item)).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn firestore_errors_classify_quota_exhaustion() {
        assert!(matches!(
            classify_firestore_error(429, "too many requests"),
            StoreError::QuotaExhausted(_)
        ));
        assert!(matches!(
            classify_firestore_error(403, r#"{"error": {"status": "RESOURCE_EXHAUSTED"}}"#),
            StoreError::QuotaExhausted(_)
        ));
        assert!(matches!(
            classify_firestore_error(500, "boom"),
            StoreError::Backend(_)
        ));
    }
}
