//! Scripted ingestion server
//!
//! Serves the upload and job status endpoints from canned replies and records
//! every upload it receives. When dropped, the server shuts down.

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// A canned HTTP response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }

    pub fn raw(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }

    pub fn accepted(job_id: &str, units_total: u32) -> Self {
        Self::json(
            200,
            serde_json::json!({ "job_id": job_id, "units_total": units_total }),
        )
    }

    pub fn processing(percent: u32, processed: u32, total: u32) -> Self {
        Self::json(
            200,
            serde_json::json!({
                "state": "processing",
                "progress_percent": percent,
                "units_processed": processed,
                "units_total": total,
            }),
        )
    }

    pub fn completed(total: u32) -> Self {
        Self::json(
            200,
            serde_json::json!({
                "state": "completed",
                "progress_percent": 100,
                "units_processed": total,
                "units_total": total,
            }),
        )
    }
}

/// One multipart upload as the server saw it.
#[derive(Debug, Clone, Default)]
pub struct RecordedUpload {
    pub authorization: Option<String>,
    /// Text fields by name.
    pub fields: BTreeMap<String, String>,
    /// Field names in the order they were sent.
    pub field_order: Vec<String>,
    pub file_name: Option<String>,
    pub file_content_type: Option<String>,
    pub file_bytes: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    uploads: Mutex<Vec<RecordedUpload>>,
    upload_replies: Mutex<VecDeque<Reply>>,
    status_replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    status_calls: Mutex<HashMap<String, usize>>,
    status_delay: Mutex<Duration>,
}

pub struct MockIngestionServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    state: Arc<MockState>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockIngestionServer {
    /// Spawns a new server on a random port.
    ///
    /// Uploads without a queued reply are accepted as `srv-<n>` with 3 units;
    /// status requests without a script report `completed`.
    pub async fn spawn() -> Self {
        let state = Arc::new(MockState::default());

        let app = Router::new()
            .route("/v1/ingestion/upload", post(upload))
            .route("/v1/ingestion/job/{id}", get(job_status))
            .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
            .with_state(state.clone());

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            state,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Queue the reply for the next upload request.
    pub fn push_upload_reply(&self, reply: Reply) {
        self.state.upload_replies.lock().unwrap().push_back(reply);
    }

    /// Script the status endpoint for one job. The last reply repeats.
    pub fn set_status_replies(&self, job_id: &str, replies: Vec<Reply>) {
        self.state
            .status_replies
            .lock()
            .unwrap()
            .insert(job_id.to_string(), replies.into());
    }

    /// Hold every status reply back for `delay`.
    pub fn set_status_delay(&self, delay: Duration) {
        *self.state.status_delay.lock().unwrap() = delay;
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.state.uploads.lock().unwrap().clone()
    }

    pub fn status_calls(&self, job_id: &str) -> usize {
        self.state
            .status_calls
            .lock()
            .unwrap()
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }
}

fn respond(reply: Reply) -> impl IntoResponse {
    (
        StatusCode::from_u16(reply.status).expect("Invalid status code"),
        [(CONTENT_TYPE, "application/json")],
        reply.body,
    )
}

async fn upload(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut recorded = RecordedUpload {
        authorization: headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ..Default::default()
    };

    while let Some(field) = multipart.next_field().await.expect("Bad multipart body") {
        let name = field.name().unwrap_or_default().to_string();
        recorded.field_order.push(name.clone());
        if name == "file" {
            recorded.file_name = field.file_name().map(str::to_string);
            recorded.file_content_type = field.content_type().map(str::to_string);
            recorded.file_bytes = field.bytes().await.expect("Bad file field").to_vec();
        } else {
            let value = field.text().await.expect("Bad text field");
            recorded.fields.insert(name, value);
        }
    }

    let count = {
        let mut uploads = state.uploads.lock().unwrap();
        uploads.push(recorded);
        uploads.len()
    };
    let reply = state
        .upload_replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Reply::accepted(&format!("srv-{}", count), 3));
    respond(reply)
}

async fn job_status(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> impl IntoResponse {
    *state
        .status_calls
        .lock()
        .unwrap()
        .entry(id.clone())
        .or_insert(0) += 1;

    let delay = *state.status_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let reply = {
        let mut scripts = state.status_replies.lock().unwrap();
        match scripts.get_mut(&id) {
            Some(replies) if replies.len() > 1 => replies.pop_front(),
            Some(replies) => replies.front().cloned(),
            None => None,
        }
    };
    respond(reply.unwrap_or_else(|| Reply::completed(3)))
}
