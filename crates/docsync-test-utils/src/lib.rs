//! Testing utilities for the docsync workspace
//!
//! [`FakeDocumentService`] is an in-memory stand-in for the document/query
//! service. It implements [`Transport`], so tests drive the production
//! request cache, API and file state manager with only the network swapped.
//! Every request is recorded for call-count assertions.

#![allow(missing_docs)]

use async_trait::async_trait;
use docsync_cache::{Clock, FetchError, HttpRequest, HttpResponse, ManualClock, Method, Transport};
use docsync_core::{normalize_query, FileStateManager, SyncConfig};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DUPLICATE_NAME: &str = "duplicate key value violates unique constraint \"files_path_name\"";

/// Endpoint a request was routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    LoadFiles,
    LoadFile,
    ListFiles,
    CreateFile,
    SaveFile,
    BatchSave,
    Query,
    Unknown,
}

impl Route {
    fn of(method: Method, path: &str) -> Self {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match (method, segments.as_slice()) {
            (Method::Post, ["api", "files", "batch"]) => Self::LoadFiles,
            (Method::Post, ["api", "files", "batch-save"]) => Self::BatchSave,
            (Method::Get, ["api", "files"]) => Self::ListFiles,
            (Method::Get, ["api", "files", _]) => Self::LoadFile,
            (Method::Patch, ["api", "files", _]) => Self::SaveFile,
            (Method::Post, ["api", "documents"]) => Self::CreateFile,
            (Method::Post, ["api", "query"]) => Self::Query,
            _ => Self::Unknown,
        }
    }
}

/// One request as the service received it
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub route: Route,
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

/// Scripted failure for the next call to a route
#[derive(Debug, Clone)]
pub enum Failure {
    /// Transport-level error
    Network(String),
    /// Error response
    Response(HttpResponse),
}

#[derive(Default)]
struct ServiceState {
    documents: BTreeMap<i64, Value>,
    hidden: HashSet<i64>,
    rejected_saves: HashSet<i64>,
    failures: HashMap<Route, VecDeque<Failure>>,
    query_results: HashMap<String, Value>,
    query_errors: HashMap<String, String>,
    latency: Duration,
}

/// In-memory document/query service
pub struct FakeDocumentService {
    state: Mutex<ServiceState>,
    calls: Mutex<Vec<RecordedCall>>,
    next_id: AtomicI64,
}

impl FakeDocumentService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState::default()),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1_000),
        }
    }

    /// Seed with documents
    pub fn with_documents(documents: impl IntoIterator<Item = Value>) -> Self {
        let service = Self::new();
        for doc in documents {
            service.insert(doc);
        }
        service
    }

    /// Store or replace a raw document (must carry a numeric `id`)
    pub fn insert(&self, document: Value) {
        let Some(id) = document["id"].as_i64() else {
            panic!("fixture document needs a numeric id: {document}");
        };
        self.state.lock().documents.insert(id, document);
    }

    /// Stored document as the service sees it
    pub fn document(&self, id: i64) -> Option<Value> {
        self.state.lock().documents.get(&id).cloned()
    }

    /// Change one top-level content key server-side
    pub fn set_content(&self, id: i64, key: &str, value: Value) {
        if let Some(doc) = self.state.lock().documents.get_mut(&id) {
            doc["content"][key] = value;
        }
    }

    /// Leave `id` out of every response, as if it did not exist
    pub fn hide(&self, id: i64) {
        self.state.lock().hidden.insert(id);
    }

    /// Batch saves report these ids as not saved
    pub fn reject_saves(&self, ids: &[i64]) {
        self.state.lock().rejected_saves.extend(ids.iter().copied());
    }

    /// Fail the next call to `route`
    pub fn fail_next(&self, route: Route, failure: Failure) {
        self.state.lock().failures.entry(route).or_default().push_back(failure);
    }

    /// Delay every response
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Result returned for `query` (matched after whitespace normalization)
    pub fn set_query_result(&self, query: &str, data: Value) {
        self.state.lock().query_results.insert(normalize_query(query), data);
    }

    /// `{error}` body returned for `query`
    pub fn set_query_error(&self, query: &str, message: &str) {
        self.state
            .lock()
            .query_errors
            .insert(normalize_query(query), message.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, route: Route) -> Vec<RecordedCall> {
        self.calls.lock().iter().filter(|c| c.route == route).cloned().collect()
    }

    pub fn call_count(&self, route: Route) -> usize {
        self.calls.lock().iter().filter(|c| c.route == route).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    fn respond(&self, route: Route, request: &HttpRequest) -> HttpResponse {
        let (path, query) = split_url(&request.url);
        let body = request.body.clone().unwrap_or(Value::Null);
        match route {
            Route::LoadFiles => self.load_files(&body),
            Route::LoadFile => self.load_file(path),
            Route::ListFiles => self.list_files(&query),
            Route::CreateFile => self.create_file(&body),
            Route::SaveFile => self.save_file(path, &body),
            Route::BatchSave => self.batch_save(&body),
            Route::Query => self.query(&body),
            Route::Unknown => not_found("no such route"),
        }
    }

    fn load_files(&self, body: &Value) -> HttpResponse {
        let ids: Vec<i64> = body["ids"]
            .as_array()
            .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        let state = self.state.lock();
        let data: Vec<Value> = ids.iter().filter_map(|id| visible(&state, *id)).collect();
        let references = references_of(&state, &data, &ids);
        HttpResponse::json(&json!({
            "data": { "data": data, "metadata": { "references": references } }
        }))
    }

    fn load_file(&self, path: &str) -> HttpResponse {
        let Some(id) = last_segment_id(path) else {
            return not_found("bad id");
        };
        let state = self.state.lock();
        match visible(&state, id) {
            Some(doc) => {
                let references = references_of(&state, std::slice::from_ref(&doc), &[id]);
                HttpResponse::json(&json!({
                    "data": { "data": doc, "metadata": { "references": references } }
                }))
            }
            None => not_found("File not found"),
        }
    }

    fn list_files(&self, query: &HashMap<String, String>) -> HttpResponse {
        let paths: Vec<&str> = query
            .get("paths")
            .map(|p| p.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let wanted_type = query.get("type");
        let state = self.state.lock();

        let mut files = Vec::new();
        let mut folders = Vec::new();
        for (id, doc) in &state.documents {
            if state.hidden.contains(id) {
                continue;
            }
            let path = doc["path"].as_str().unwrap_or_default();
            if !paths.is_empty() && !paths.iter().any(|p| path.starts_with(p)) {
                continue;
            }
            let summary = json!({
                "id": doc["id"],
                "name": doc["name"],
                "path": doc["path"],
                "type": doc["type"],
            });
            let doc_type = doc["type"].as_str().unwrap_or_default();
            if doc_type == "folder" {
                folders.push(summary.clone());
            }
            if wanted_type.map_or(doc_type != "folder", |t| t == doc_type) {
                files.push(summary);
            }
        }
        HttpResponse::json(&json!({ "data": files, "metadata": { "folders": folders } }))
    }

    fn create_file(&self, body: &Value) -> HttpResponse {
        let mut state = self.state.lock();
        let duplicate = state
            .documents
            .values()
            .any(|doc| doc["name"] == body["name"] && doc["path"] == body["path"]);
        if duplicate {
            return HttpResponse::with_status(
                409,
                &json!({ "error": { "message": DUPLICATE_NAME } }),
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let doc = json!({
            "id": id,
            "name": body["name"],
            "path": body["path"],
            "type": body["type"],
            "content": body["content"],
            "references": body.get("references").cloned().unwrap_or_else(|| json!([])),
        });
        state.documents.insert(id, doc.clone());
        HttpResponse::json(&json!({ "data": doc }))
    }

    fn save_file(&self, path: &str, body: &Value) -> HttpResponse {
        let Some(id) = last_segment_id(path) else {
            return not_found("bad id");
        };
        let mut state = self.state.lock();
        if state.hidden.contains(&id) {
            return not_found("File not found");
        }
        match state.documents.get_mut(&id) {
            Some(doc) => {
                apply_save(doc, body);
                HttpResponse::json(&json!({ "data": doc.clone() }))
            }
            None => not_found("File not found"),
        }
    }

    fn batch_save(&self, body: &Value) -> HttpResponse {
        let mut state = self.state.lock();
        let mut saved = Vec::new();
        for file in body["files"].as_array().into_iter().flatten() {
            let Some(id) = file["id"].as_i64() else { continue };
            if state.rejected_saves.contains(&id) {
                continue;
            }
            if let Some(doc) = state.documents.get_mut(&id) {
                apply_save(doc, file);
                saved.push(id);
            }
        }
        HttpResponse::json(&json!({ "data": { "savedFileIds": saved } }))
    }

    fn query(&self, body: &Value) -> HttpResponse {
        let query = normalize_query(body["query"].as_str().unwrap_or_default());
        let state = self.state.lock();
        if let Some(message) = state.query_errors.get(&query) {
            return HttpResponse::json(&json!({ "error": message }));
        }
        let data = state.query_results.get(&query).cloned().unwrap_or_else(|| {
            json!({ "columns": ["query"], "types": ["text"], "rows": [{ "query": query }] })
        });
        HttpResponse::json(&json!({ "data": data }))
    }
}

impl Default for FakeDocumentService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FakeDocumentService {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let (path, _) = split_url(&request.url);
        let route = Route::of(request.method, path);
        info!("[FakeDocumentService] {} {} -> {route:?}", request.method, request.url);

        self.calls.lock().push(RecordedCall {
            route,
            method: request.method,
            url: request.url.clone(),
            body: request.body.clone(),
        });

        let (latency, failure) = {
            let mut state = self.state.lock();
            let failure = state.failures.get_mut(&route).and_then(VecDeque::pop_front);
            (state.latency, failure)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match failure {
            Some(Failure::Network(message)) => Err(FetchError::Network(message)),
            Some(Failure::Response(response)) => Ok(response),
            None => Ok(self.respond(route, &request)),
        }
    }
}

fn visible(state: &ServiceState, id: i64) -> Option<Value> {
    if state.hidden.contains(&id) {
        return None;
    }
    state.documents.get(&id).cloned()
}

fn references_of(state: &ServiceState, docs: &[Value], requested: &[i64]) -> Vec<Value> {
    let mut seen: HashSet<i64> = requested.iter().copied().collect();
    let mut out = Vec::new();
    for doc in docs {
        for id in doc["references"].as_array().into_iter().flatten().filter_map(Value::as_i64) {
            if seen.insert(id) {
                if let Some(reference) = visible(state, id) {
                    out.push(reference);
                }
            }
        }
    }
    out
}

fn apply_save(doc: &mut Value, body: &Value) {
    for key in ["name", "path", "content", "references"] {
        if let Some(value) = body.get(key) {
            doc[key] = value.clone();
        }
    }
}

fn not_found(message: &str) -> HttpResponse {
    HttpResponse::with_status(404, &json!({ "error": { "message": message } }))
}

fn split_url(url: &str) -> (&str, HashMap<String, String>) {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let pairs = reqwest::Url::parse(&format!("http://fake.local/?{query}"))
        .map(|u| u.query_pairs().into_owned().collect())
        .unwrap_or_default();
    (path, pairs)
}

fn last_segment_id(path: &str) -> Option<i64> {
    path.rsplit('/').next()?.parse().ok()
}

/// Error response with a structured body
pub fn error_response(status: u16, message: &str) -> HttpResponse {
    HttpResponse::with_status(status, &json!({ "error": { "message": message } }))
}

pub mod fixtures {
    //! Raw service documents
    use serde_json::{json, Value};

    pub fn question(id: i64, name: &str, query: &str) -> Value {
        json!({
            "id": id,
            "name": name,
            "path": "/org/analytics",
            "type": "question",
            "content": {
                "query": query,
                "database_name": "main",
                "parameters": [],
                "vizSettings": { "type": "table" }
            },
            "references": [],
            "companyId": 1
        })
    }

    pub fn dashboard(id: i64, name: &str, questions: &[i64]) -> Value {
        let assets: Vec<Value> =
            questions.iter().map(|q| json!({ "type": "question", "id": q })).collect();
        json!({
            "id": id,
            "name": name,
            "path": "/org/analytics",
            "type": "dashboard",
            "content": { "assets": assets, "layout": { "columns": 12 } },
            "references": questions,
            "companyId": 1
        })
    }

    pub fn folder(id: i64, name: &str, path: &str) -> Value {
        json!({
            "id": id,
            "name": name,
            "path": path,
            "type": "folder",
            "content": {},
            "references": [],
            "companyId": 1
        })
    }
}

/// Fake service, manual clock and a manager wired over them
pub struct TestEnv {
    pub service: Arc<FakeDocumentService>,
    pub clock: Arc<ManualClock>,
    pub files: FileStateManager,
}

impl TestEnv {
    pub const START_MS: u64 = 1_700_000_000_000;

    pub fn new(documents: impl IntoIterator<Item = Value>) -> Self {
        Self::with_config(documents, SyncConfig::new().with_company_id(1))
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_config(documents: impl IntoIterator<Item = Value>, config: SyncConfig) -> Self {
        let service = Arc::new(FakeDocumentService::with_documents(documents));
        let clock = Arc::new(ManualClock::new(Self::START_MS));
        let transport: Arc<dyn Transport> = Arc::clone(&service) as Arc<dyn Transport>;
        let time: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
        let files = FileStateManager::connect(config, transport, time);
        Self { service, clock, files }
    }
}
