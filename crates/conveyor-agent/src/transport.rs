//! Talking to Conveyor servers over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use conveyor_config::ServerEntry;
use conveyor_core::ResourceId;
use conveyor_core::protocol::{
    ClaimRequest, ClaimResponse, Command, JobFinishedReport, PingReport, ReadyJobs, Reply,
    StepReport,
};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

/// Pings are best effort; a slow server gets pinged again later.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Failures that mean a request was not delivered.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Server answered {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl TransportError {
    fn from_reqwest(url: &Url, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout {
                url: url.to_string(),
            }
        } else {
            TransportError::Request {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// A queued report for the server that handed out the job.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StepStarted {
        stepresult_id: ResourceId,
        report: StepReport,
    },
    StepUpdated {
        stepresult_id: ResourceId,
        report: StepReport,
    },
    StepCompleted {
        stepresult_id: ResourceId,
        report: StepReport,
    },
    JobFinished {
        job_id: ResourceId,
        report: JobFinishedReport,
    },
}

impl Message {
    fn endpoint(&self) -> (&'static str, ResourceId) {
        match self {
            Message::StepStarted { stepresult_id, .. } => ("start_step_result", *stepresult_id),
            Message::StepUpdated { stepresult_id, .. } => ("update_step_result", *stepresult_id),
            Message::StepCompleted { stepresult_id, .. } => {
                ("complete_step_result", *stepresult_id)
            }
            Message::JobFinished { job_id, .. } => ("job_finished", *job_id),
        }
    }

    fn body(&self) -> serde_json::Result<Value> {
        match self {
            Message::StepStarted { report, .. }
            | Message::StepUpdated { report, .. }
            | Message::StepCompleted { report, .. } => serde_json::to_value(report),
            Message::JobFinished { report, .. } => serde_json::to_value(report),
        }
    }
}

/// Everything the agent asks of a server.
#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn ready_jobs(
        &self,
        server: &ServerEntry,
        configs: &[String],
    ) -> Result<ReadyJobs, TransportError>;

    async fn claim_job(
        &self,
        server: &ServerEntry,
        config: &str,
        job_id: ResourceId,
    ) -> Result<ClaimResponse, TransportError>;

    /// Deliver one report. `Ok` means the server has it and the reply says
    /// what to do next.
    async fn post(&self, server: &ServerEntry, message: &Message) -> Result<Reply, TransportError>;

    async fn ping(&self, server: &ServerEntry) -> Result<Reply, TransportError>;
}

fn stop_reply(message: &str) -> Reply {
    Reply::ok(message).with_command(Command::Stop)
}

/// Map an HTTP answer to a report onto the reply the agent acts on.
///
/// `None` means the report was not accepted and should be retried.
pub fn interpret_reply(status: StatusCode, body: &[u8]) -> Option<Reply> {
    match status {
        StatusCode::BAD_REQUEST => Some(stop_reply("Server rejected the report")),
        StatusCode::PAYLOAD_TOO_LARGE => Some(stop_reply("Server refused the output size")),
        // Server-side storage failure. The job keeps running.
        StatusCode::INTERNAL_SERVER_ERROR => Some(Reply::ok("")),
        s if s.is_success() => Some(
            serde_json::from_slice(body)
                .unwrap_or_else(|_| stop_reply("Server reply was not valid JSON")),
        ),
        _ => None,
    }
}

/// [`ServerApi`] over reqwest.
pub struct HttpServerApi {
    client: reqwest::Client,
    insecure: reqwest::Client,
    client_name: String,
}

impl HttpServerApi {
    pub fn new(client_name: impl Into<String>, request_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("conveyor-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;
        let insecure = reqwest::Client::builder()
            .user_agent(concat!("conveyor-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            insecure,
            client_name: client_name.into(),
        })
    }

    fn http(&self, server: &ServerEntry) -> &reqwest::Client {
        if server.verify_ssl {
            &self.client
        } else {
            &self.insecure
        }
    }

    fn url(&self, server: &ServerEntry, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url =
            Url::parse(&server.url).map_err(|_| TransportError::InvalidUrl(server.url.clone()))?;
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(server.url.clone()))?
            .pop_if_empty()
            .push("client")
            .extend(segments);
        Ok(url)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        url: &Url,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.json().await.map_err(|e| TransportError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn ready_jobs(
        &self,
        server: &ServerEntry,
        configs: &[String],
    ) -> Result<ReadyJobs, TransportError> {
        let mut url = self.url(server, &["ready_jobs", &server.build_key, &self.client_name])?;
        url.query_pairs_mut()
            .append_pair("configs", &configs.join(","));
        debug!(%url, "Checking for ready jobs");
        let response = self
            .http(server)
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&url, e))?;
        Self::decode(&url, response).await
    }

    async fn claim_job(
        &self,
        server: &ServerEntry,
        config: &str,
        job_id: ResourceId,
    ) -> Result<ClaimResponse, TransportError> {
        let url = self.url(
            server,
            &["claim_job", &server.build_key, config, &self.client_name],
        )?;
        let body = ClaimRequest {
            job_id,
            client_name: self.client_name.clone(),
        };
        let response = self
            .http(server)
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&url, e))?;
        Self::decode(&url, response).await
    }

    async fn post(&self, server: &ServerEntry, message: &Message) -> Result<Reply, TransportError> {
        let (endpoint, id) = message.endpoint();
        let id = id.to_string();
        let url = self.url(
            server,
            &[endpoint, &server.build_key, &self.client_name, &id],
        )?;

        let body = match message.body() {
            Ok(body) => body,
            Err(e) => {
                warn!(%url, error = %e, "Could not serialize report");
                return Ok(stop_reply("Report could not be serialized"));
            }
        };

        debug!(%url, "Posting report");
        let response = self
            .http(server)
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&url, e))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(&url, e))?;
        match status {
            StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => {
                warn!(%url, %status, "Stopping because the server refused the report");
            }
            StatusCode::INTERNAL_SERVER_ERROR => {
                warn!(%url, "Server error while posting report");
            }
            _ => {}
        }
        interpret_reply(status, &bytes).ok_or_else(|| TransportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }

    async fn ping(&self, server: &ServerEntry) -> Result<Reply, TransportError> {
        let url = self.url(server, &["ping", &self.client_name])?;
        let body = PingReport {
            client_name: self.client_name.clone(),
        };
        let response = self
            .http(server)
            .post(url.clone())
            .timeout(PING_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&url, e))?;
        Self::decode(&url, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(url: &str) -> ServerEntry {
        ServerEntry {
            url: url.to_string(),
            build_key: "key 1".to_string(),
            verify_ssl: true,
        }
    }

    #[test]
    fn test_refused_reports_mean_stop() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::PAYLOAD_TOO_LARGE] {
            let reply = interpret_reply(status, b"").unwrap();
            assert_eq!(reply.command, Some(Command::Stop));
        }
    }

    #[test]
    fn test_server_error_counts_as_delivered() {
        let reply = interpret_reply(StatusCode::INTERNAL_SERVER_ERROR, b"oops").unwrap();
        assert_eq!(reply.command, None);
        assert_eq!(reply.status, "OK");
    }

    #[test]
    fn test_garbage_reply_means_stop() {
        let reply = interpret_reply(StatusCode::OK, b"<html>").unwrap();
        assert_eq!(reply.command, Some(Command::Stop));

        let reply = interpret_reply(
            StatusCode::OK,
            br#"{"status":"OK","message":"","next_step":true,"command":"cancel"}"#,
        )
        .unwrap();
        assert_eq!(reply.command, Some(Command::Cancel));
    }

    #[test]
    fn test_other_statuses_are_retried() {
        assert!(interpret_reply(StatusCode::BAD_GATEWAY, b"").is_none());
        assert!(interpret_reply(StatusCode::NOT_FOUND, b"").is_none());
    }

    #[test]
    fn test_urls_escape_segments() {
        let api = HttpServerApi::new("box 7", Duration::from_secs(5)).unwrap();
        let url = api
            .url(&server("https://ci.example.org/"), &["ping", "box 7"])
            .unwrap();
        assert_eq!(url.as_str(), "https://ci.example.org/client/ping/box%207");

        let url = api
            .url(&server("https://ci.example.org/conveyor"), &["ready_jobs"])
            .unwrap();
        assert_eq!(url.as_str(), "https://ci.example.org/conveyor/client/ready_jobs");

        assert!(matches!(
            api.url(&server("not a url"), &["ping"]),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_messages_pick_their_endpoint() {
        let id = ResourceId::new();
        let message = Message::StepCompleted {
            stepresult_id: id,
            report: StepReport::default(),
        };
        assert_eq!(message.endpoint(), ("complete_step_result", id));
        let body = message.body().unwrap();
        assert_eq!(body["exit_status"], 0);
    }
}
