use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;

use crate::config::Settings;
use crate::custom_date::parse_due_date;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// GitLab's own rolling window, wide enough to cover the 3 week threshold.
const DUE_DATE_FILTER: &str = "next_month_and_previous_two_weeks";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("cannot read CA certificate {}: {source}", .path.display())]
    Certificate {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid API token header value")]
    Token(#[from] reqwest::header::InvalidHeaderValue),
    #[error("GitLab request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("GitLab returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("unexpected issues response: {0}")]
    Parse(String),
}

/// An open issue that has a due date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub iid: u16,
    pub title: String,
    pub due_date: DateTime<Utc>,
    pub web_url: String,
}

/// Where the scheduler gets its tasks from.
pub trait IssueSource: Send + Sync {
    fn fetch_issues(&self) -> BoxFuture<'_, Result<Vec<Issue>, SourceError>>;
}

#[derive(Deserialize)]
struct RawIssue {
    iid: u16,
    title: String,
    due_date: Option<String>,
    web_url: String,
}

/// Parses the `GET /groups/:id/issues` response body. One malformed issue
/// rejects the whole response.
pub fn parse_issues(body: &str, tz: Tz) -> Result<Vec<Issue>, SourceError> {
    let raw: Vec<RawIssue> =
        serde_json::from_str(body).map_err(|e| SourceError::Parse(e.to_string()))?;

    let mut issues = Vec::with_capacity(raw.len());
    for item in raw {
        // The due date filter should exclude these, but GitLab is not strict about it
        let Some(due_date) = item.due_date else {
            continue;
        };
        let due_date =
            parse_due_date(&due_date, tz).map_err(|e| SourceError::Parse(e.to_string()))?;

        issues.push(Issue {
            iid: item.iid,
            title: item.title,
            due_date,
            web_url: item.web_url,
        });
    }

    Ok(issues)
}

pub struct GitlabIssueSource {
    client: reqwest::Client,
    issues_url: String,
    tz: Tz,
}

impl GitlabIssueSource {
    /// `base_url` must end with `/`.
    pub fn new(
        base_url: &str,
        group: &str,
        api_token: &str,
        ca_cert: Option<&Path>,
        tz: Tz,
    ) -> Result<Self, SourceError> {
        let mut headers = HeaderMap::new();
        let mut token = HeaderValue::from_str(api_token)?;
        token.set_sensitive(true);
        headers.insert(HeaderName::from_static("private-token"), token);

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT);

        if let Some(path) = ca_cert {
            let pem = std::fs::read(path).map_err(|source| SourceError::Certificate {
                path: path.to_path_buf(),
                source,
            })?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            issues_url: format!("{base_url}api/v4/groups/{group}/issues"),
            tz,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SourceError> {
        Self::new(
            &settings.gitlab_url,
            &settings.gitlab_group,
            &settings.gitlab_api_token,
            settings.gitlab_https_public_cert.as_deref(),
            settings.timezone,
        )
    }

    async fn query(&self) -> Result<Vec<Issue>, SourceError> {
        let response = self
            .client
            .get(&self.issues_url)
            .query(&[("state", "opened"), ("due_date", DUE_DATE_FILTER)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status));
        }

        let body = response.text().await?;
        parse_issues(&body, self.tz)
    }
}

impl IssueSource for GitlabIssueSource {
    fn fetch_issues(&self) -> BoxFuture<'_, Result<Vec<Issue>, SourceError>> {
        Box::pin(self.query())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ISSUES: &str = r#"[
        {"iid": 3, "title": "Renew passport", "due_date": "2024-04-22",
         "web_url": "https://gitlab.home/home/tasks/-/issues/3", "state": "opened"},
        {"iid": 7, "title": "Someday", "due_date": null,
         "web_url": "https://gitlab.home/home/tasks/-/issues/7"}
    ]"#;

    #[test]
    fn parses_issues_and_skips_undated() {
        let issues = parse_issues(ISSUES, Tz::UTC).unwrap();

        assert_eq!(
            issues,
            vec![Issue {
                iid: 3,
                title: "Renew passport".to_string(),
                due_date: Utc.with_ymd_and_hms(2024, 4, 22, 0, 0, 0).unwrap(),
                web_url: "https://gitlab.home/home/tasks/-/issues/3".to_string(),
            }]
        );
    }

    #[test]
    fn rejects_non_array_root() {
        assert!(matches!(
            parse_issues(r#"{"message": "401 Unauthorized"}"#, Tz::UTC),
            Err(SourceError::Parse(_))
        ));
    }

    #[test]
    fn one_bad_issue_rejects_response() {
        let body = r#"[
            {"iid": 1, "title": "ok", "due_date": "2024-01-01", "web_url": "u"},
            {"iid": 70000, "title": "iid overflow", "due_date": "2024-01-01", "web_url": "u"}
        ]"#;
        assert!(parse_issues(body, Tz::UTC).is_err());

        let body = r#"[{"iid": 1, "title": "bad date", "due_date": "tomorrow", "web_url": "u"}]"#;
        assert!(parse_issues(body, Tz::UTC).is_err());
    }

    #[tokio::test]
    async fn queries_group_issues_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/groups/home/issues"))
            .and(query_param("state", "opened"))
            .and(query_param("due_date", DUE_DATE_FILTER))
            .and(header("private-token", "glpat-test"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ISSUES))
            .expect(1)
            .mount(&server)
            .await;

        let base = format!("{}/", server.uri());
        let source = GitlabIssueSource::new(&base, "home", "glpat-test", None, Tz::UTC).unwrap();
        let issues = source.fetch_issues().await.unwrap();

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].iid, 3);
    }

    #[tokio::test]
    async fn http_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let base = format!("{}/", server.uri());
        let source = GitlabIssueSource::new(&base, "home", "wrong", None, Tz::UTC).unwrap();

        match source.fetch_issues().await {
            Err(SourceError::Status(status)) => assert_eq!(status.as_u16(), 401),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn missing_ca_certificate_fails() {
        let result = GitlabIssueSource::new(
            "https://gitlab.home/",
            "home",
            "t",
            Some(Path::new("/nonexistent/gitlab.crt")),
            Tz::UTC,
        );
        assert!(matches!(result, Err(SourceError::Certificate { .. })));
    }
}
