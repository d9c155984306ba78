//! CLI command implementations.

pub mod clouds;
pub mod events;
pub mod fleet;

use anyhow::{Context, Result, bail};
use cyclone_config::{SystemConfig, load_system_config};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Thin JSON client for the server's REST API.
pub struct ApiClient {
    base: Url,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let base = Url::parse(api_url).with_context(|| format!("invalid API URL {}", api_url))?;
        Ok(Self {
            base,
            http: reqwest::Client::new(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let url = self.url(path)?;
        debug!(%url, "GET");
        let response = self.http.get(url).send().await?;
        read(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.url(path)?;
        debug!(%url, "DELETE");
        let response = self.http.delete(url).send().await?;
        read(response).await?;
        Ok(())
    }
}

async fn read(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    let text = response.text().await?;
    if !status.is_success() {
        bail!(error_message(status, &text));
    }
    Ok(serde_json::from_str(&text)?)
}

/// `404 Not Found: cloud x` from an error response body.
fn error_message(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    if detail.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, detail)
    }
}

pub fn validate(path: &str) -> Result<()> {
    match load_system_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            print_summary(&config);
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_summary(config: &SystemConfig) {
    println!("  listen:      {}", config.server.listen);
    println!(
        "  database:    {}",
        if config.server.database_url.is_some() { "postgres" } else { "in-memory" }
    );
    println!("  worker:      {}", config.worker.env.worker_image);
    println!("  timeout:     {:?}", config.worker.timeout);
    println!("  max retry:   {}", config.manager.max_retry);
    for cloud in &config.clouds {
        println!("  cloud:       {} ({})", cloud.name, cloud.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_prefers_error_field() {
        assert_eq!(
            error_message(StatusCode::NOT_FOUND, r#"{"error":"not found: cloud x"}"#),
            "404 Not Found: not found: cloud x"
        );
        assert_eq!(
            error_message(StatusCode::BAD_GATEWAY, "upstream down\n"),
            "502 Bad Gateway: upstream down"
        );
        assert_eq!(
            error_message(StatusCode::INTERNAL_SERVER_ERROR, ""),
            "500 Internal Server Error"
        );
    }

    #[test]
    fn test_client_joins_paths() {
        let client = ApiClient::new("http://localhost:7099").unwrap();
        assert_eq!(
            client.url("/api/v1/clouds").unwrap().as_str(),
            "http://localhost:7099/api/v1/clouds"
        );
        assert!(ApiClient::new("not a url").is_err());
    }
}
