//! Single and batched calls against the SDK routes, with `{data, error}` state.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::Form;
use serde_json::Value as JsonValue;

use super::error::{ApiError, ErrorHandler, report_error};
use super::transport::{ApiClient, RequestBody};
use crate::batch::{BatchOptions, BatchProgress, ProgressCallback, run_batch};
use crate::types::RecordId;
use crate::url::{Query, join_url, join_url_opt, merge_query, split_path_query};

/// Progress callback for batched API calls.
pub type ApiProgressCallback = ProgressCallback<JsonValue, ApiError>;

/// Route of an [`ApiCall`]: fixed, or recomputed on every execution.
#[derive(Clone)]
pub enum ApiPath {
    Fixed(String),
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl ApiPath {
    pub fn dynamic(f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self::Dynamic(Arc::new(f))
    }

    fn resolve(&self) -> String {
        match self {
            Self::Fixed(path) => path.clone(),
            Self::Dynamic(f) => f(),
        }
    }
}

impl fmt::Debug for ApiPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(path) => f.debug_tuple("Fixed").field(path).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<&str> for ApiPath {
    fn from(path: &str) -> Self {
        Self::Fixed(path.to_string())
    }
}

impl From<String> for ApiPath {
    fn from(path: String) -> Self {
        Self::Fixed(path)
    }
}

/// Per-call defaults.
#[derive(Clone, Default)]
pub struct ApiOptions {
    pub method: Method,
    pub body: Option<JsonValue>,
    pub query: Option<Query>,
    pub headers: HeaderMap,
    pub error_context: Option<String>,
    pub on_error: Option<ErrorHandler>,
    pub disable_batch: bool,
    pub batch_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub on_progress: Option<ApiProgressCallback>,
    /// Fail the whole execution when any batch item fails.
    pub fail_on_batch_error: bool,
}

impl ApiOptions {
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_error_context(mut self, context: impl Into<String>) -> Self {
        self.error_context = Some(context.into());
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, handler: impl Fn(&ApiError, Option<&str>) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn without_batching(mut self) -> Self {
        self.disable_batch = true;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    #[must_use]
    pub fn with_progress(
        mut self,
        callback: impl Fn(&BatchProgress<JsonValue, ApiError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn fail_on_batch_error(mut self) -> Self {
        self.fail_on_batch_error = true;
        self
    }
}

/// Per-execution overrides.
#[derive(Default)]
pub struct ExecuteOptions {
    pub body: Option<JsonValue>,
    /// Appended to the path for a single call.
    pub id: Option<RecordId>,
    pub query: Option<Query>,
    /// One call per id (PATCH/DELETE).
    pub ids: Vec<RecordId>,
    /// One upload per form (POST).
    pub files: Vec<Form>,
    pub batch_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub on_progress: Option<ApiProgressCallback>,
}

impl ExecuteOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<RecordId>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn with_ids<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<RecordId>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_files(mut self, files: Vec<Form>) -> Self {
        self.files = files;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    #[must_use]
    pub fn with_progress(
        mut self,
        callback: impl Fn(&BatchProgress<JsonValue, ApiError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

/// Result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiData {
    Single(JsonValue),
    /// One entry per id or file, in input order.
    Batch(Vec<Result<JsonValue, ApiError>>),
}

impl ApiData {
    #[must_use]
    pub fn single(&self) -> Option<&JsonValue> {
        match self {
            Self::Single(value) => Some(value),
            Self::Batch(_) => None,
        }
    }

    #[must_use]
    pub fn into_single(self) -> Option<JsonValue> {
        match self {
            Self::Single(value) => Some(value),
            Self::Batch(_) => None,
        }
    }

    #[must_use]
    pub fn batch(&self) -> Option<&[Result<JsonValue, ApiError>]> {
        match self {
            Self::Single(_) => None,
            Self::Batch(results) => Some(results),
        }
    }
}

/// How one execution is carried out.
enum Plan {
    Single(Option<RecordId>),
    Ids(Vec<RecordId>),
    Files(Vec<Form>),
}

impl Plan {
    /// Batching needs an id list with PATCH/DELETE, or a file list with POST.
    fn choose(method: &Method, disable_batch: bool, ids: Vec<RecordId>, files: Vec<Form>, id: Option<RecordId>) -> Self {
        if disable_batch {
            return Self::Single(id);
        }
        if !ids.is_empty() && (*method == Method::PATCH || *method == Method::DELETE) {
            return Self::Ids(ids);
        }
        if *method == Method::POST && !files.is_empty() {
            return Self::Files(files);
        }
        Self::Single(id)
    }
}

#[derive(Default)]
struct CallState {
    data: Option<ApiData>,
    error: Option<ApiError>,
    pending: usize,
}

/// Clears the pending flag even if the execution future is dropped.
struct PendingGuard<'a>(&'a Mutex<CallState>);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending = state.pending.saturating_sub(1);
    }
}

/// A reusable API call bound to a path and default options.
///
/// ```rust,no_run
/// use enfyra_sdk::client::{ApiCall, ApiClient, ApiOptions, ExecuteOptions};
/// use reqwest::Method;
///
/// # async fn run() -> Result<(), enfyra_sdk::client::ApiError> {
/// let client = ApiClient::new("http://localhost:3000")?;
/// let remove = ApiCall::new(client, "/posts", ApiOptions::new(Method::DELETE).with_batch_size(10));
///
/// let data = remove.execute(ExecuteOptions::new().with_ids([1_i64, 2, 3])).await?;
/// assert_eq!(data.batch().map(<[_]>::len), Some(3));
/// # Ok(())
/// # }
/// ```
pub struct ApiCall {
    client: ApiClient,
    path: ApiPath,
    options: ApiOptions,
    state: Mutex<CallState>,
}

impl ApiCall {
    #[must_use]
    pub fn new(client: ApiClient, path: impl Into<ApiPath>, options: ApiOptions) -> Self {
        Self {
            client,
            path: path.into(),
            options,
            state: Mutex::new(CallState::default()),
        }
    }

    /// Data of the last successful execution.
    #[must_use]
    pub fn data(&self) -> Option<ApiData> {
        self.lock().data.clone()
    }

    /// Error of the last execution, cleared when a new one starts.
    #[must_use]
    pub fn error(&self) -> Option<ApiError> {
        self.lock().error.clone()
    }

    #[must_use]
    pub fn pending(&self) -> bool {
        self.lock().pending > 0
    }

    /// Run the call once.
    ///
    /// Failures are also handed to the configured error handler (or logged)
    /// and kept in [`error()`](Self::error).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when a single call fails, or when a batch fails
    /// and [`ApiOptions::fail_on_batch_error`] is set.
    pub async fn execute(&self, exec: ExecuteOptions) -> Result<ApiData, ApiError> {
        {
            let mut state = self.lock();
            state.pending += 1;
            state.error = None;
        }
        let _pending = PendingGuard(&self.state);

        let result = self.run(exec).await;

        match &result {
            Ok(data) => self.lock().data = Some(data.clone()),
            Err(error) => {
                report_error(error, self.options.error_context.as_deref(), self.options.on_error.as_ref());
                self.lock().error = Some(error.clone());
            }
        }
        result
    }

    async fn run(&self, exec: ExecuteOptions) -> Result<ApiData, ApiError> {
        let (raw_path, path_query) = split_path_query(&self.path.resolve());
        let path = raw_path.trim_start_matches('/');
        let query = merge_query([Some(&path_query), self.options.query.as_ref(), exec.query.as_ref()]);
        let body = exec.body.or_else(|| self.options.body.clone());
        let prefix = self.client.api_prefix();

        let batch = BatchOptions {
            batch_size: exec.batch_size.or(self.options.batch_size),
            concurrency: exec.concurrency.or(self.options.concurrency),
            on_progress: exec.on_progress.or_else(|| self.options.on_progress.clone()),
        };

        let plan = Plan::choose(&self.options.method, self.options.disable_batch, exec.ids, exec.files, exec.id);

        match plan {
            Plan::Single(id) => {
                let id = id.map(|id| id.to_string());
                let url = self
                    .client
                    .url_for(&join_url_opt([Some(prefix), Some(path), id.as_deref()]), &query)?;
                let value = self
                    .client
                    .send(self.options.method.clone(), url, body.into(), &self.options.headers)
                    .await?;
                Ok(ApiData::Single(value))
            }
            Plan::Ids(ids) => {
                let query = &query;
                let body = &body;
                let outcome = run_batch(
                    ids,
                    |id, _| async move {
                        let target = join_url([prefix, path, &id.to_string()]);
                        let url = self.client.url_for(&target, query)?;
                        self.client
                            .send(self.options.method.clone(), url, body.clone().into(), &self.options.headers)
                            .await
                    },
                    batch,
                )
                .await;
                self.finish_batch(outcome.results)
            }
            Plan::Files(files) => {
                let url = self.client.url_for(&join_url([prefix, path]), &query)?;
                let url = &url;
                let outcome = run_batch(
                    files,
                    |form, _| async move {
                        self.client
                            .send(
                                self.options.method.clone(),
                                url.clone(),
                                RequestBody::Multipart(form),
                                &self.options.headers,
                            )
                            .await
                    },
                    batch,
                )
                .await;
                self.finish_batch(outcome.results)
            }
        }
    }

    fn finish_batch(&self, results: Vec<Result<JsonValue, ApiError>>) -> Result<ApiData, ApiError> {
        if self.options.fail_on_batch_error {
            let failed = results.iter().filter(|r| r.is_err()).count();
            if let Some(Err(first)) = results.iter().find(|r| r.is_err()) {
                return Err(ApiError {
                    message: format!("{failed} of {} batch requests failed: {}", results.len(), first.message),
                    ..first.clone()
                });
            }
        }
        Ok(ApiData::Batch(results))
    }

    fn lock(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::Router;
    use axum::extract::State;
    use axum::http::{StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Clone, Default)]
    struct Server {
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        hits: Arc<Mutex<Vec<String>>>,
    }

    async fn handle(State(server): State<Server>, method: axum::http::Method, uri: Uri, body: String) -> Response {
        let now = server.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        server.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.in_flight.fetch_sub(1, Ordering::SeqCst);
        server.hits.lock().unwrap().push(format!("{method} {uri}"));

        if uri.path().ends_with("/bad") {
            return (StatusCode::UNPROCESSABLE_ENTITY, axum::Json(json!({"message": "Bad record"}))).into_response();
        }
        axum::Json(json!({"method": method.as_str(), "uri": uri.to_string(), "body": body})).into_response()
    }

    async fn spawn_server() -> (SocketAddr, Server) {
        let server = Server::default();
        let app = Router::new().fallback(handle).with_state(server.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, server)
    }

    fn client(addr: SocketAddr) -> ApiClient {
        ApiClient::new(&format!("http://{addr}")).unwrap()
    }

    fn ids<const N: usize>(ids: [&str; N]) -> Vec<RecordId> {
        ids.into_iter().map(RecordId::from).collect()
    }

    #[test]
    fn test_batch_eligibility() {
        let some_ids = || ids(["1"]);
        let forms = || vec![Form::new()];

        assert!(matches!(Plan::choose(&Method::PATCH, false, some_ids(), vec![], None), Plan::Ids(_)));
        assert!(matches!(Plan::choose(&Method::DELETE, false, some_ids(), vec![], None), Plan::Ids(_)));
        assert!(matches!(Plan::choose(&Method::POST, false, vec![], forms(), None), Plan::Files(_)));
        assert!(matches!(Plan::choose(&Method::POST, false, some_ids(), vec![], None), Plan::Single(None)));
        assert!(matches!(Plan::choose(&Method::PATCH, false, vec![], forms(), None), Plan::Single(None)));
        assert!(matches!(Plan::choose(&Method::GET, false, some_ids(), forms(), None), Plan::Single(None)));
        assert!(matches!(
            Plan::choose(&Method::PATCH, true, some_ids(), vec![], Some(RecordId::Int(4))),
            Plan::Single(Some(RecordId::Int(4)))
        ));
    }

    #[tokio::test]
    async fn test_single_call_layers_query_and_id() {
        let (addr, _) = spawn_server().await;
        let options = ApiOptions::default().with_query([("limit".into(), json!(10)), ("page".into(), json!(1))].into());
        let call = ApiCall::new(client(addr), "/posts?page=3&sort=id", options);

        let data = call
            .execute(
                ExecuteOptions::new()
                    .with_id(7_i64)
                    .with_query([("page".into(), json!(2))].into()),
            )
            .await
            .unwrap();

        let echo = data.single().unwrap();
        assert_eq!(echo["method"], "GET");
        assert_eq!(echo["uri"], "/enfyra/api/posts/7?limit=10&page=2&sort=id");
        assert_eq!(call.data(), Some(data));
        assert!(call.error().is_none());
        assert!(!call.pending());
    }

    #[tokio::test]
    async fn test_dynamic_path_is_resolved_per_execution() {
        let (addr, _) = spawn_server().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let call = ApiCall::new(
            client(addr),
            ApiPath::dynamic(move || format!("/page/{}", seen.fetch_add(1, Ordering::SeqCst))),
            ApiOptions::default(),
        );

        let first = call.execute(ExecuteOptions::new()).await.unwrap();
        let second = call.execute(ExecuteOptions::new()).await.unwrap();

        assert_eq!(first.single().unwrap()["uri"], "/enfyra/api/page/0");
        assert_eq!(second.single().unwrap()["uri"], "/enfyra/api/page/1");
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_recorded() {
        let (addr, _) = spawn_server().await;
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let options = ApiOptions::new(Method::PATCH)
            .with_error_context("Save")
            .with_error_handler(move |e: &ApiError, ctx: Option<&str>| {
                sink.lock().unwrap().push((e.status, ctx.map(str::to_owned)));
            });
        let call = ApiCall::new(client(addr), "/posts/bad", options);

        let err = call.execute(ExecuteOptions::new()).await.unwrap_err();

        assert_eq!(err.message, "Bad record");
        assert_eq!(call.error(), Some(err));
        assert!(call.data().is_none());
        assert_eq!(*reported.lock().unwrap(), vec![(Some(422), Some("Save".to_string()))]);
    }

    #[tokio::test]
    async fn test_id_batch_chunks_and_orders_results() {
        let (addr, server) = spawn_server().await;
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = progress.clone();
        let call = ApiCall::new(
            client(addr),
            "/posts",
            ApiOptions::new(Method::PATCH).with_body(json!({"published": true})),
        );

        let data = call
            .execute(
                ExecuteOptions::new()
                    .with_ids([1_i64, 2, 3])
                    .with_batch_size(2)
                    .with_concurrency(1)
                    .with_progress(move |p: &BatchProgress<JsonValue, ApiError>| {
                        sink.lock().unwrap().push((p.completed, p.in_progress));
                    }),
            )
            .await
            .unwrap();

        let results = data.batch().unwrap();
        let uris: Vec<_> = results.iter().map(|r| r.as_ref().unwrap()["uri"].clone()).collect();
        assert_eq!(uris, ["/enfyra/api/posts/1", "/enfyra/api/posts/2", "/enfyra/api/posts/3"]);
        assert_eq!(results[0].as_ref().unwrap()["body"], r#"{"published":true}"#);

        assert_eq!(server.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(
            *server.hits.lock().unwrap(),
            ["PATCH /enfyra/api/posts/1", "PATCH /enfyra/api/posts/2", "PATCH /enfyra/api/posts/3"]
        );
        assert_eq!(progress.lock().unwrap().last(), Some(&(3, 0)));
    }

    #[tokio::test]
    async fn test_batch_failures_are_isolated_unless_opted_in() {
        let (addr, _) = spawn_server().await;
        let targets = || ExecuteOptions::new().with_ids(ids(["1", "bad", "3"]));

        let call = ApiCall::new(client(addr), "/posts", ApiOptions::new(Method::DELETE));
        let data = call.execute(targets()).await.unwrap();
        let results = data.batch().unwrap();
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().status, Some(422));
        assert!(results[2].is_ok());

        let strict = ApiCall::new(client(addr), "/posts", ApiOptions::new(Method::DELETE).fail_on_batch_error());
        let err = strict.execute(targets()).await.unwrap_err();
        assert_eq!(err.status, Some(422));
        assert!(err.message.starts_with("1 of 3 batch requests failed"));
    }

    #[tokio::test]
    async fn test_unbounded_batch_runs_concurrently() {
        let (addr, server) = spawn_server().await;
        let call = ApiCall::new(client(addr), "/posts", ApiOptions::new(Method::DELETE));

        call.execute(ExecuteOptions::new().with_ids([1_i64, 2, 3, 4])).await.unwrap();

        assert!(server.max_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_file_batch_posts_each_form() {
        let (addr, server) = spawn_server().await;
        let call = ApiCall::new(client(addr), "/files?folder=a", ApiOptions::new(Method::POST));
        let files = vec![
            Form::new().text("name", "one.txt"),
            Form::new().text("name", "two.txt"),
        ];

        let data = call.execute(ExecuteOptions::new().with_files(files)).await.unwrap();

        let results = data.batch().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].as_ref().unwrap()["body"].as_str().unwrap().contains("one.txt"));
        assert!(results[1].as_ref().unwrap()["body"].as_str().unwrap().contains("two.txt"));
        assert!(server.hits.lock().unwrap().iter().all(|h| h == "POST /enfyra/api/files?folder=a"));
    }

    #[tokio::test]
    async fn test_disabled_batching_makes_one_call() {
        let (addr, server) = spawn_server().await;
        let call = ApiCall::new(client(addr), "/posts", ApiOptions::new(Method::DELETE).without_batching());

        let data = call
            .execute(ExecuteOptions::new().with_ids([1_i64, 2]).with_id(9_i64))
            .await
            .unwrap();

        assert_eq!(data.single().unwrap()["uri"], "/enfyra/api/posts/9");
        assert_eq!(server.hits.lock().unwrap().len(), 1);
    }
}
