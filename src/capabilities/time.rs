//! Local (no network) capabilities: timestamp conversion and sender id.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat};
use serde_json::{json, Map};

use super::{CallContext, Capability, CapabilityRegistry, CapabilityResult, ParamKind, ParamSpec};

/// Convert a unix timestamp (seconds) to an RFC 3339 UTC date.
pub fn unix_timestamp(timestamp: i64) -> CapabilityResult {
    match DateTime::from_timestamp(timestamp, 0) {
        Some(t) => {
            let mut map = Map::new();
            map.insert(
                "time".into(),
                json!(t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
            CapabilityResult::ok(map)
        }
        None => CapabilityResult::error(format!("timestamp out of range: {timestamp}")),
    }
}

/// Id of the user who sent the triggering message.
pub fn my_id(ctx: &CallContext) -> CapabilityResult {
    match ctx.sender_id {
        Some(id) => {
            let mut map = Map::new();
            map.insert("id".into(), json!(id));
            CapabilityResult::ok(map)
        }
        None => CapabilityResult::error("sender is unknown"),
    }
}

pub fn register(registry: &mut CapabilityRegistry) -> anyhow::Result<()> {
    registry.register(Capability::new(
        "unix_timestamp",
        "converts an integer to date and time using unix timestamps",
        vec![ParamSpec::required("timestamp", ParamKind::Integer, "")],
        Arc::new(|args, _ctx| {
            Box::pin(async move {
                match args.i64("timestamp") {
                    Some(ts) => unix_timestamp(ts),
                    None => CapabilityResult::error("missing required argument `timestamp`"),
                }
            })
        }),
    ))?;
    registry.register(Capability::new(
        "my_id",
        "returns the id of the user that sent the message",
        vec![],
        Arc::new(|_args, ctx| Box::pin(async move { my_id(&ctx) })),
    ))
}
