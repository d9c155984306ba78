//! Cloud commands.

use anyhow::Result;

use super::ApiClient;

pub async fn list(client: &ApiClient) -> Result<()> {
    let clouds = client.get("/api/v1/clouds").await?;
    let clouds = clouds.as_array().cloned().unwrap_or_default();
    if clouds.is_empty() {
        println!("No clouds registered");
        return Ok(());
    }
    println!("{:<24} KIND", "NAME");
    for cloud in clouds {
        println!(
            "{:<24} {}",
            cloud["name"].as_str().unwrap_or("-"),
            cloud["kind"].as_str().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn ping(client: &ApiClient, name: &str) -> Result<()> {
    client.get(&format!("/api/v1/clouds/{}/ping", name)).await?;
    println!("Cloud {} is reachable", name);
    Ok(())
}

pub async fn delete(client: &ApiClient, name: &str) -> Result<()> {
    client.delete(&format!("/api/v1/clouds/{}", name)).await?;
    println!("Cloud {} deleted", name);
    Ok(())
}
