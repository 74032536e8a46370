//! `get_my_ip`: public IP address of the host the bot runs on.

use std::sync::Arc;

use reqwest::Client;

use super::{fetch_json, Capability, CapabilityRegistry, CapabilityResult};

/// Default lookup endpoint.
pub const DEFAULT_URL: &str = "https://api.ipify.org";

/// Query the ipify service and return its JSON object (`{ "ip": "…" }`).
pub async fn my_ip(client: &Client, base_url: &str) -> CapabilityResult {
    let url = format!("{}?format=json", base_url.trim_end_matches('/'));
    match fetch_json(client, &url).await {
        Ok(v) => CapabilityResult::from_value("ip", v),
        Err(e) => CapabilityResult::error(e),
    }
}

pub fn register(registry: &mut CapabilityRegistry, client: Client, base_url: &str) -> anyhow::Result<()> {
    let base_url = base_url.to_string();
    registry.register(Capability::new(
        "get_my_ip",
        "Gets the ip address of where the bot is currently hosted",
        vec![],
        Arc::new(move |_args, _ctx| {
            let client = client.clone();
            let base_url = base_url.clone();
            Box::pin(async move { my_ip(&client, &base_url).await })
        }),
    ))
}
