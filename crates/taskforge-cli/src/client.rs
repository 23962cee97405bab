//! Taskforge HTTP/WebSocket client — talks to a running `taskforge-server`.

use futures::StreamExt;
use reqwest::Url;
use taskforge_core::{Frame, Task};
use tokio_tungstenite::tungstenite::Message;

/// Client for a `taskforge-server` instance.
#[derive(Debug, Clone)]
pub struct TaskforgeClient {
    base_url: Url,
    http: reqwest::Client,
}

impl TaskforgeClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            http: reqwest::Client::new(),
        })
    }

    /// Build a client from `TASKFORGE_URL`, defaulting to
    /// `http://localhost:8080`.
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url =
            std::env::var("TASKFORGE_URL").unwrap_or_else(|_| "http://localhost:8080".into());
        Self::new(&base_url)
    }

    fn url(&self, path: &str) -> Url {
        self.base_url
            .join(path)
            .expect("path must be a valid relative URL")
    }

    pub async fn create_task(
        &self,
        input_prompt: &str,
        title: Option<&str>,
    ) -> anyhow::Result<Task> {
        let resp = self
            .http
            .post(self.url("/tasks"))
            .json(&serde_json::json!({ "input_prompt": input_prompt, "title": title }))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn list_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let resp = self
            .http
            .get(self.url("/tasks"))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn get_task(&self, task_id: &str) -> anyhow::Result<Task> {
        let resp = self
            .http
            .get(self.url(&format!("/tasks/{task_id}")))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn start_task(&self, task_id: &str) -> anyhow::Result<()> {
        self.http
            .post(self.url(&format!("/tasks/{task_id}/start")))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn stop_task(&self, task_id: &str) -> anyhow::Result<()> {
        self.http
            .post(self.url(&format!("/tasks/{task_id}/stop")))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn delete_task(&self, task_id: &str) -> anyhow::Result<()> {
        self.http
            .delete(self.url(&format!("/tasks/{task_id}")))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Connect to the push-stream endpoint and invoke `on_frame` for
    /// every frame received, until the server closes the connection.
    pub async fn watch(
        &self,
        task_id: &str,
        mut on_frame: impl FnMut(Frame),
    ) -> anyhow::Result<()> {
        let mut ws_url = self.base_url.join(&format!("/stream/{task_id}"))?;
        ws_url
            .set_scheme(if self.base_url.scheme() == "https" {
                "wss"
            } else {
                "ws"
            })
            .map_err(|_| anyhow::anyhow!("failed to derive websocket scheme"))?;

        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await?;
        let (_sender, mut receiver) = ws_stream.split();

        while let Some(message) = receiver.next().await {
            match message? {
                Message::Text(text) => {
                    let frame: Frame = serde_json::from_str(&text)?;
                    on_frame(frame);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }
}
