//! OpenDota lookups: player account, recent matches, and the hero list.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, SecondsFormat};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{fetch_json, Capability, CapabilityRegistry, CapabilityResult, ParamKind, ParamSpec};

/// Default OpenDota API base.
pub const DEFAULT_URL: &str = "https://api.opendota.com/api";

/// Upper bound on `limit` for the matches lookup.
pub const MAX_MATCHES: i64 = 10;

/// Player slots at or above this value are on the Dire side.
const DIRE_SLOT_START: i64 = 128;

// ── Hero table ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Hero {
    pub id: u32,
    pub name: String,
    pub localized_name: String,
}

fn heroes() -> &'static HashMap<u32, Hero> {
    static HEROES: OnceLock<HashMap<u32, Hero>> = OnceLock::new();
    HEROES.get_or_init(|| {
        match serde_json::from_str::<Vec<Hero>>(include_str!("heroes.json")) {
            Ok(list) => list.into_iter().map(|h| (h.id, h)).collect(),
            Err(e) => {
                warn!(error = %e, "embedded hero table failed to parse");
                HashMap::new()
            }
        }
    })
}

/// Localised hero name for an OpenDota hero id.
pub fn hero_name(id: u32) -> Option<&'static str> {
    heroes().get(&id).map(|h| h.localized_name.as_str())
}

// ── Match summaries ──────────────────────────────────────────

/// Subset of an OpenDota `players/{id}/matches` row.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct MatchRow {
    match_id: Option<i64>,
    player_slot: Option<i64>,
    radiant_win: Option<bool>,
    duration: Option<f64>,
    hero_id: Option<u32>,
    start_time: Option<i64>,
    kills: Option<i64>,
    deaths: Option<i64>,
    assists: Option<i64>,
    leaver_status: Option<i64>,
    party_size: Option<i64>,
}

fn summarize_match(row: &MatchRow) -> Value {
    let dire = row.player_slot.unwrap_or(0) >= DIRE_SLOT_START;
    let radiant_win = row.radiant_win.unwrap_or(false);
    let won = if dire { !radiant_win } else { radiant_win };
    let start_time = row
        .start_time
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true));
    let hero_id = row.hero_id.unwrap_or(0);
    let hero = hero_name(hero_id)
        .map(String::from)
        .unwrap_or_else(|| format!("unknown hero {hero_id}"));

    json!({
        "match_id": row.match_id,
        "team": if dire { "dire" } else { "radiant" },
        "won": won,
        "duration_minutes": row.duration.unwrap_or(0.0) / 60.0,
        "hero": hero,
        "start_time": start_time,
        "kills": row.kills,
        "deaths": row.deaths,
        "assists": row.assists,
        "did_player_leave": row.leaver_status.unwrap_or(0) != 0,
        "party_size": row.party_size,
    })
}

fn valid_player_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit())
}

// ── Lookups ──────────────────────────────────────────────────

pub async fn player_account(client: &Client, base_url: &str, player_id: &str) -> CapabilityResult {
    if !valid_player_id(player_id) {
        return CapabilityResult::error(format!("invalid player id: {player_id}"));
    }
    debug!(player_id, "fetching dota account");
    let url = format!("{}/players/{player_id}", base_url.trim_end_matches('/'));
    match fetch_json(client, &url).await {
        Ok(v) => CapabilityResult::from_value("account", v),
        Err(e) => CapabilityResult::error(e),
    }
}

/// Recent matches for a player.  `limit` is clamped to `1..=MAX_MATCHES`.
pub async fn player_matches(
    client: &Client,
    base_url: &str,
    player_id: &str,
    limit: i64,
) -> CapabilityResult {
    if !valid_player_id(player_id) {
        return CapabilityResult::error(format!("invalid player id: {player_id}"));
    }
    let limit = limit.clamp(1, MAX_MATCHES);
    debug!(player_id, limit, "fetching dota matches");
    let url = format!(
        "{}/players/{player_id}/matches?limit={limit}",
        base_url.trim_end_matches('/')
    );

    let body = match fetch_json(client, &url).await {
        Ok(v) => v,
        Err(e) => return CapabilityResult::error(e),
    };
    let rows: Vec<MatchRow> = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => return CapabilityResult::error(format!("unexpected matches payload: {e}")),
    };

    let items: Vec<Value> = rows.iter().map(summarize_match).collect();
    CapabilityResult::from_value("items", json!({ "items": items }))
}

pub async fn heroes_list(client: &Client, base_url: &str) -> CapabilityResult {
    debug!("fetching dota heroes");
    let url = format!("{}/heroes", base_url.trim_end_matches('/'));
    match fetch_json(client, &url).await {
        Ok(v @ Value::Array(_)) => CapabilityResult::from_value("heroes", json!({ "heroes": v })),
        Ok(other) => CapabilityResult::error(format!(
            "unexpected heroes payload: {}",
            crate::utils::truncate_str(&other.to_string(), 120)
        )),
        Err(e) => CapabilityResult::error(e),
    }
}

pub fn register(registry: &mut CapabilityRegistry, client: Client, base_url: &str) -> anyhow::Result<()> {
    let base: Arc<str> = Arc::from(base_url);

    {
        let client = client.clone();
        let base = Arc::clone(&base);
        registry.register(Capability::new(
            "dota_player_account",
            "Gets dota player account information",
            vec![ParamSpec::required("playerId", ParamKind::String, "The player ID")],
            Arc::new(move |args, _ctx| {
                let client = client.clone();
                let base = Arc::clone(&base);
                Box::pin(async move {
                    let id = args.str("playerId").unwrap_or_default();
                    player_account(&client, &base, id).await
                })
            }),
        ))?;
    }

    {
        let client = client.clone();
        let base = Arc::clone(&base);
        registry.register(Capability::new(
            "dota_player_matches",
            "Gets match information for a dota player by id.",
            vec![
                ParamSpec::required("playerId", ParamKind::String, "The player ID"),
                ParamSpec::required(
                    "limit",
                    ParamKind::Integer,
                    "The number of matches to fetch, not higher than 10",
                ),
            ],
            Arc::new(move |args, _ctx| {
                let client = client.clone();
                let base = Arc::clone(&base);
                Box::pin(async move {
                    let id = args.str("playerId").unwrap_or_default();
                    let limit = args.i64("limit").unwrap_or(MAX_MATCHES);
                    player_matches(&client, &base, id, limit).await
                })
            }),
        ))?;
    }

    registry.register(Capability::new(
        "dota_heroes",
        "Gets information for each dota hero and their id.",
        vec![],
        Arc::new(move |_args, _ctx| {
            let client = client.clone();
            let base = Arc::clone(&base);
            Box::pin(async move { heroes_list(&client, &base).await })
        }),
    ))
}
