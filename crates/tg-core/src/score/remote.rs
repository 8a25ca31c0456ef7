use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::DateTime;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{ScoreError, ScoreProvider, ScoreRequest};
use crate::types::AnalysisStats;

/// Subset of the reputation API's URL report that feeds the score.
#[derive(Debug, Default, Deserialize)]
pub struct UrlReport {
    #[serde(default)]
    pub data: ReportData,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportData {
    #[serde(default)]
    pub attributes: ReportAttributes,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportAttributes {
    #[serde(default)]
    pub last_analysis_stats: AnalysisStats,
    /// Unix seconds.
    #[serde(default)]
    pub last_analysis_date: Option<i64>,
}

/// Parse a URL report body. Missing sections count as zero detections.
pub fn parse_report(body: &str) -> Result<UrlReport, serde_json::Error> {
    serde_json::from_str(body)
}

/// Scores URLs from a remote reputation service.
///
/// One GET per call against `<endpoint>/urls/<base64url(url)>`. A 404 means
/// the service has never seen the URL and scores 0.
pub struct RemoteReputationScorer {
    client: Client,
    endpoint: String,
}

impl RemoteReputationScorer {
    pub fn new(endpoint: &str) -> Result<Self, ScoreError> {
        let client = Client::builder().user_agent("ThreatGuard/0.1").build()?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    /// Lookup URL for a target, using unpadded URL-safe base64 as the id.
    pub fn lookup_url(&self, url: &str) -> String {
        format!("{}/urls/{}", self.endpoint, URL_SAFE_NO_PAD.encode(url.as_bytes()))
    }
}

#[async_trait]
impl ScoreProvider for RemoteReputationScorer {
    async fn score(&self, request: ScoreRequest<'_>) -> Result<u8, ScoreError> {
        let lookup = self.lookup_url(request.url);
        debug!("Reputation lookup for {} via {}", request.url, lookup);

        let response = self
            .client
            .get(&lookup)
            .header("accept", "application/json")
            .header("x-apikey", request.credential)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::NOT_FOUND {
            warn!("Reputation service has no report for {}, scoring 0", request.url);
            return Ok(0);
        }
        if !status.is_success() {
            return Err(ScoreError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let report = parse_report(&body)?;
        let attributes = &report.data.attributes;
        match attributes
            .last_analysis_date
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
        {
            Some(date) => debug!("Last analysis of {}: {}", request.url, date.to_rfc3339()),
            None => debug!("Last analysis of {}: not available", request.url),
        }

        let score = attributes.last_analysis_stats.threat_score();
        info!(
            "Reputation threat score for {}: {}/100 ({:?})",
            request.url, score, attributes.last_analysis_stats
        );
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(status_line: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[test]
    fn test_lookup_url_encoding() {
        let scorer = RemoteReputationScorer::with_client(Client::new(), "https://api.example/v3/");
        assert_eq!(
            scorer.lookup_url("http://a.b/?x=1"),
            format!("https://api.example/v3/urls/{}", URL_SAFE_NO_PAD.encode("http://a.b/?x=1"))
        );
        assert!(!scorer.lookup_url("https://example.com/??>>").contains('='));
        assert!(!scorer.lookup_url("https://example.com/??>>").contains('+'));
    }

    #[test]
    fn test_parse_report() {
        let body = r#"{"data":{"attributes":{
            "last_analysis_date": 1700000000,
            "last_analysis_stats":{"malicious":6,"suspicious":0,"harmless":3,"undetected":1,"timeout":2}
        }}}"#;
        let report = parse_report(body).unwrap();
        assert_eq!(report.data.attributes.last_analysis_stats.threat_score(), 60);
        assert_eq!(report.data.attributes.last_analysis_date, Some(1_700_000_000));

        let empty = parse_report("{}").unwrap();
        assert_eq!(empty.data.attributes.last_analysis_stats.threat_score(), 0);
    }

    #[tokio::test]
    async fn test_success_maps_stats() {
        let body = r#"{"data":{"attributes":{"last_analysis_stats":{"malicious":1,"suspicious":1,"harmless":2,"undetected":0}}}}"#;
        let (endpoint, server) = serve_once("200 OK", body).await;
        let scorer = RemoteReputationScorer::new(&endpoint).unwrap();

        let score = scorer
            .score(ScoreRequest::new("https://example.com/").with_credential("secret"))
            .await
            .unwrap();
        assert_eq!(score, 50);

        let raw = server.await.unwrap().to_lowercase();
        assert!(raw.starts_with("get /urls/"));
        assert!(raw.contains("x-apikey: secret"));
        assert!(raw.contains("accept: application/json"));
    }

    #[tokio::test]
    async fn test_not_found_scores_zero() {
        let (endpoint, server) = serve_once("404 Not Found", r#"{"error":{"code":"NotFoundError"}}"#).await;
        let scorer = RemoteReputationScorer::new(&endpoint).unwrap();
        let score = scorer.score(ScoreRequest::new("https://new.example/")).await.unwrap();
        assert_eq!(score, 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_other_failure_is_error() {
        let (endpoint, server) = serve_once("401 Unauthorized", "bad key").await;
        let scorer = RemoteReputationScorer::new(&endpoint).unwrap();
        let err = scorer.score(ScoreRequest::new("https://a.example/")).await.unwrap_err();
        match err {
            ScoreError::Provider { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad key");
            }
            other => panic!("unexpected error: {other}"),
        }
        server.await.unwrap();
    }
}
