//! Resource and worker listings.

use anyhow::Result;
use serde_json::Value;

use super::ApiClient;

pub async fn resources(client: &ApiClient) -> Result<()> {
    let resources = client.get("/api/v1/resources").await?;
    println!("{:<24} {:<18} USED/LIMIT", "CLOUD", "RESOURCE");
    for line in resource_lines(&resources) {
        println!("{}", line);
    }
    Ok(())
}

pub async fn workers(client: &ApiClient) -> Result<()> {
    let workers = client.get("/api/v1/workers").await?;
    println!("{:<16} {:<52} STATUS", "CLOUD", "WORKER");
    for (cloud, list) in workers.as_object().into_iter().flatten() {
        for worker in list.as_array().into_iter().flatten() {
            println!(
                "{:<16} {:<52} {}",
                cloud,
                worker["name"].as_str().unwrap_or("-"),
                worker["status"].as_str().unwrap_or("-")
            );
        }
    }
    Ok(())
}

/// One line per cloud and limited resource.
fn resource_lines(resources: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    for (cloud, resource) in resources.as_object().into_iter().flatten() {
        let limits = resource["limit"].as_object();
        if limits.is_none_or(|l| l.is_empty()) {
            lines.push(format!("{:<24} {:<18} unmetered", cloud, "-"));
            continue;
        }
        for (name, limit) in limits.into_iter().flatten() {
            let used = resource["used"][name].as_str().unwrap_or("0");
            lines.push(format!(
                "{:<24} {:<18} {}/{}",
                cloud,
                name,
                used,
                limit.as_str().unwrap_or("-")
            ));
        }
    }
    lines
}
