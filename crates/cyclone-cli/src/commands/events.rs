//! Event commands.

use anyhow::Result;

use super::ApiClient;

pub async fn get(client: &ApiClient, id: &str) -> Result<()> {
    let event = client.get(&format!("/api/v1/events/{}", id)).await?;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

pub async fn delete(client: &ApiClient, id: &str) -> Result<()> {
    client.delete(&format!("/api/v1/events/{}", id)).await?;
    println!("Event {} deleted", id);
    Ok(())
}
