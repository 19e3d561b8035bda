use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Typed client for the coordinator wire protocol.
///
/// This is the surface worker processes and producers program against; the
/// integration tests drive the server through it too.
#[derive(Clone, Debug)]
pub struct CoordinatorClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateTaskRequest {
    pub text: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_submissions: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<i64>,
}

/// A claimed task as handed out by `/tasks/next`.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkItem {
    pub task_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub ok: bool,
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardEntry {
    pub worker_id: String,
    pub points: i64,
}

impl CoordinatorClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub async fn register(
        &self,
        worker_id: &str,
        capabilities: Option<&[String]>,
    ) -> anyhow::Result<()> {
        let capabilities_json = capabilities.map(|caps| serde_json::json!(caps).to_string());
        self.http
            .post(self.url("/workers/register")?)
            .json(&serde_json::json!({
                "worker_id": worker_id,
                "capabilities_json": capabilities_json,
            }))
            .send()
            .await
            .context("POST /workers/register")?
            .error_for_status()
            .context("register status")?;
        Ok(())
    }

    pub async fn heartbeat(&self, worker_id: &str) -> anyhow::Result<HeartbeatResponse> {
        let resp = self
            .http
            .post(self.url("/workers/heartbeat")?)
            .json(&serde_json::json!({ "worker_id": worker_id }))
            .send()
            .await
            .context("POST /workers/heartbeat")?
            .error_for_status()
            .context("heartbeat status")?;

        resp.json().await.context("decode heartbeat")
    }

    pub async fn create_task(&self, req: &CreateTaskRequest) -> anyhow::Result<String> {
        #[derive(Deserialize)]
        struct Created {
            task_id: String,
        }

        let resp = self
            .http
            .post(self.url("/tasks")?)
            .json(req)
            .send()
            .await
            .context("POST /tasks")?
            .error_for_status()
            .context("create task status")?;

        Ok(resp.json::<Created>().await.context("decode create task")?.task_id)
    }

    /// Pull the next eligible task, or `None` when there is no work.
    pub async fn next_task(&self, worker_id: &str) -> anyhow::Result<Option<WorkItem>> {
        #[derive(Deserialize)]
        struct NextResponse {
            task_id: Option<String>,
            text: Option<String>,
        }

        let resp = self
            .http
            .post(self.url("/tasks/next")?)
            .json(&serde_json::json!({ "worker_id": worker_id }))
            .send()
            .await
            .context("POST /tasks/next")?
            .error_for_status()
            .context("next task status")?;

        let next: NextResponse = resp.json().await.context("decode next task")?;
        Ok(match (next.task_id, next.text) {
            (Some(task_id), Some(text)) => Some(WorkItem { task_id, text }),
            _ => None,
        })
    }

    pub async fn submit(
        &self,
        worker_id: &str,
        task_id: &str,
        label: &str,
        confidence: f64,
    ) -> anyhow::Result<SubmitResponse> {
        let resp = self
            .http
            .post(self.url("/workers/submit")?)
            .json(&serde_json::json!({
                "worker_id": worker_id,
                "task_id": task_id,
                "label": label,
                "confidence": confidence,
            }))
            .send()
            .await
            .context("POST /workers/submit")?
            .error_for_status()
            .context("submit status")?;

        resp.json().await.context("decode submit")
    }

    pub async fn leaderboard(&self) -> anyhow::Result<Vec<LeaderboardEntry>> {
        let resp = self
            .http
            .get(self.url("/leaderboard")?)
            .send()
            .await
            .context("GET /leaderboard")?
            .error_for_status()
            .context("leaderboard status")?;

        resp.json().await.context("decode leaderboard")
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        let base = Url::parse(&self.base_url).context("parse coordinator base URL")?;
        base.join(path).context("join coordinator URL")
    }
}
