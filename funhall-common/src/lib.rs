// Copyright (C) 2026 FunHall Games
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const WORKING_SET_CAP: usize = 2000;
pub const DEFAULT_BUCKET_LIMIT: usize = 60;

/// Placeholder theming for the `exclusive` bucket; override via the curation
/// config file.
pub const DEFAULT_EXCLUSIVE_KEYWORDS: [&str; 8] = [
    "christmas", "santa", "xmas", "jingle", "snow", "gift", "elf", "noel",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameRecord {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub thumb: Option<String>,
    pub rtp: Option<f64>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    /// Epoch-millis shadow of `published_at` for cheap sorting.
    pub published_at_ts: i64,
    pub created_at_ts: i64,
    pub enabled: bool,
    pub api_url: Option<String>,
    pub embed_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub thumb: Option<String>,
    pub demo_url: Option<String>,
    pub rtp: Option<f64>,
}

impl GameSummary {
    pub fn from_record(record: &GameRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            provider: record.provider.clone(),
            thumb: record.thumb.clone(),
            demo_url: record.embed_url.clone(),
            rtp: record.rtp,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BucketId {
    Best,
    New,
    Rtp97,
    Exclusive,
}

impl BucketId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::New => "new",
            Self::Rtp97 => "rtp97",
            Self::Exclusive => "exclusive",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BucketMeta {
    pub id: BucketId,
    pub title: &'static str,
    pub icon: &'static str,
}

/// Home-page buckets in display order.
pub const HOME_BUCKETS: [BucketMeta; 4] = [
    BucketMeta {
        id: BucketId::Exclusive,
        title: "Exclusive",
        icon: "/icons/exclusive.svg",
    },
    BucketMeta {
        id: BucketId::Best,
        title: "Best Games",
        icon: "/icons/best.svg",
    },
    BucketMeta {
        id: BucketId::New,
        title: "New Games",
        icon: "/icons/new.svg",
    },
    BucketMeta {
        id: BucketId::Rtp97,
        title: "RTP 97%+",
        icon: "/icons/rtp97.svg",
    },
];

/// One ranked entry of a category bucket run. The summary is denormalized so
/// serving a bucket costs a single document read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryItem {
    pub rank: u32,
    pub game: GameSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurationLists {
    pub exclusive_keywords: Vec<String>,
    pub best_games: Vec<String>,
}

impl Default for CurationLists {
    fn default() -> Self {
        Self {
            exclusive_keywords: DEFAULT_EXCLUSIVE_KEYWORDS
                .iter()
                .map(ToString::to_string)
                .collect(),
            best_games: Vec::new(),
        }
    }
}

/// Coerce the upstream `published` field: boolean `true`, numeric `1`, or the
/// string `"1"` count as published; everything else does not.
pub fn coerce_published(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64() == Some(1),
        Some(Value::String(text)) => text == "1",
        _ => false,
    }
}

/// Coerce a number or numeric string to a float; anything else is `None`.
pub fn coerce_rtp(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn coerce_id(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

fn coerce_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    }
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let text = coerce_string(value)?;
    DateTime::parse_from_rfc3339(&text)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Normalize one raw upstream record into a `GameRecord`.
///
/// Field fallbacks: name `name` → `title` → `""`; provider `provider.name` →
/// `provider.title` → flat `provider` string → `""`; `published_at` falls
/// back to `updated_at`. Records without a usable id are dropped. The embed
/// URL is left unset; the caller derives it from `api_url` when a token is
/// configured.
pub fn normalize_game(raw: &Value) -> Option<GameRecord> {
    let id = coerce_id(raw.get("id"))?;

    let name = coerce_string(raw.get("name"))
        .or_else(|| coerce_string(raw.get("title")))
        .unwrap_or_default();

    let provider = coerce_string(raw.get("provider").and_then(|p| p.get("name")))
        .or_else(|| coerce_string(raw.get("provider").and_then(|p| p.get("title"))))
        .or_else(|| coerce_string(raw.get("provider")))
        .unwrap_or_default();

    let published = coerce_published(raw.get("published"));
    let published_at =
        parse_timestamp(raw.get("published_at")).or_else(|| parse_timestamp(raw.get("updated_at")));
    let created_at = parse_timestamp(raw.get("created_at"));

    Some(GameRecord {
        id,
        name,
        provider,
        thumb: coerce_string(raw.get("thumb")),
        rtp: coerce_rtp(raw.get("rtp")),
        published_at,
        created_at,
        published_at_ts: published_at.map(|at| at.timestamp_millis()).unwrap_or(0),
        created_at_ts: created_at.map(|at| at.timestamp_millis()).unwrap_or(0),
        enabled: published,
        api_url: coerce_string(raw.get("url")).or_else(|| coerce_string(raw.get("api_url"))),
        embed_url: None,
    })
}

pub type SelectFn = fn(&[GameRecord], &CurationLists, usize) -> Vec<GameRecord>;

/// Bucket selection rules in rebuild order. Precedence and membership live in
/// this table rather than in branching code.
pub const CATEGORY_RULES: [(BucketId, SelectFn); 4] = [
    (BucketId::Best, select_best),
    (BucketId::Rtp97, select_rtp97),
    (BucketId::New, select_new),
    (BucketId::Exclusive, select_exclusive),
];

pub fn select_best(pool: &[GameRecord], _curation: &CurationLists, limit: usize) -> Vec<GameRecord> {
    let mut picks: Vec<GameRecord> = pool.to_vec();
    picks.sort_by(|a, b| {
        b.published_at_ts
            .cmp(&a.published_at_ts)
            .then_with(|| a.id.cmp(&b.id))
    });
    picks.truncate(limit);
    picks
}

pub fn select_new(pool: &[GameRecord], _curation: &CurationLists, limit: usize) -> Vec<GameRecord> {
    let mut picks: Vec<GameRecord> = pool.to_vec();
    picks.sort_by(|a, b| {
        b.created_at_ts
            .cmp(&a.created_at_ts)
            .then_with(|| a.id.cmp(&b.id))
    });
    picks.truncate(limit);
    picks
}

pub fn select_rtp97(
    pool: &[GameRecord],
    _curation: &CurationLists,
    limit: usize,
) -> Vec<GameRecord> {
    let mut picks: Vec<GameRecord> = pool
        .iter()
        .filter(|game| game.rtp.is_some_and(|rtp| rtp >= 97.0))
        .cloned()
        .collect();
    picks.sort_by(|a, b| {
        b.rtp
            .partial_cmp(&a.rtp)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    picks.truncate(limit);
    picks
}

/// Keyword-matched bucket; falls back to the `best` pool when nothing in the
/// working set matches.
pub fn select_exclusive(
    pool: &[GameRecord],
    curation: &CurationLists,
    limit: usize,
) -> Vec<GameRecord> {
    let keywords: Vec<String> = curation
        .exclusive_keywords
        .iter()
        .map(|keyword| keyword.to_lowercase())
        .filter(|keyword| !keyword.is_empty())
        .collect();

    let mut picks: Vec<GameRecord> = pool
        .iter()
        .filter(|game| {
            let name = game.name.to_lowercase();
            keywords.iter().any(|keyword| name.contains(keyword))
        })
        .cloned()
        .collect();

    if picks.is_empty() {
        return select_best(pool, curation, limit);
    }

    picks.sort_by(|a, b| {
        b.published_at_ts
            .cmp(&a.published_at_ts)
            .then_with(|| a.id.cmp(&b.id))
    });
    picks.truncate(limit);
    picks
}

/// Pinned-first merge: curated entries in order (deduplicated), then the
/// ranked tail skipping anything already included, up to `limit`.
pub fn merge_pinned_first<T: Clone>(
    pinned: &[T],
    ranked: &[T],
    limit: usize,
    id_of: impl Fn(&T) -> &str,
) -> Vec<T> {
    let mut merged: Vec<T> = Vec::with_capacity(limit);
    let mut seen: Vec<String> = Vec::new();

    for entry in pinned.iter().chain(ranked.iter()) {
        if merged.len() >= limit {
            break;
        }
        let id = id_of(entry);
        if seen.iter().any(|known| known == id) {
            continue;
        }
        seen.push(id.to_string());
        merged.push(entry.clone());
    }

    merged
}

fn match_key(name: &str) -> String {
    name.chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Fuzzy-match curated display names against a pool of upstream records.
/// Returns the matched game ids (curated order, first hit wins) and the
/// curated names that matched nothing.
pub fn match_curated_names(pool: &[GameRecord], names: &[String]) -> (Vec<String>, Vec<String>) {
    let mut pinned = Vec::new();
    let mut missed = Vec::new();

    for name in names {
        let wanted = match_key(name);
        if wanted.is_empty() {
            missed.push(name.clone());
            continue;
        }
        let hit = pool.iter().find(|game| {
            let candidate = match_key(&game.name);
            !candidate.is_empty() && (candidate.contains(&wanted) || wanted.contains(&candidate))
        });
        match hit {
            Some(game) if !pinned.contains(&game.id) => pinned.push(game.id.clone()),
            Some(_) => {}
            None => missed.push(name.clone()),
        }
    }

    (pinned, missed)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    VideoNote,
    Document,
    Audio,
    Text,
}

/// First matching kind wins when capturing a broadcast draft.
pub const MEDIA_PRECEDENCE: [MediaKind; 6] = [
    MediaKind::Photo,
    MediaKind::Video,
    MediaKind::VideoNote,
    MediaKind::Document,
    MediaKind::Audio,
    MediaKind::Text,
];

/// Provider-agnostic view of one inbound chat message. Media fields carry
/// provider file ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub text: Option<String>,
    pub photo: Option<String>,
    pub video: Option<String>,
    pub video_note: Option<String>,
    pub document: Option<String>,
    pub audio: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastPayload {
    pub kind: MediaKind,
    /// Message text for `Text`, provider file id otherwise.
    pub content: String,
    pub caption: Option<String>,
}

impl BroadcastPayload {
    pub fn from_message(message: &InboundMessage) -> Option<Self> {
        for kind in MEDIA_PRECEDENCE {
            let content = match kind {
                MediaKind::Photo => message.photo.as_deref(),
                MediaKind::Video => message.video.as_deref(),
                MediaKind::VideoNote => message.video_note.as_deref(),
                MediaKind::Document => message.document.as_deref(),
                MediaKind::Audio => message.audio.as_deref(),
                MediaKind::Text => message.text.as_deref(),
            };
            let Some(content) = content.map(str::trim).filter(|content| !content.is_empty())
            else {
                continue;
            };
            let caption = if kind == MediaKind::Text {
                None
            } else {
                message.caption.clone()
            };
            return Some(Self {
                kind,
                content: content.to_string(),
                caption,
            });
        }
        None
    }

    pub fn describe(&self) -> &'static str {
        match self.kind {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::VideoNote => "video note",
            MediaKind::Document => "document",
            MediaKind::Audio => "audio",
            MediaKind::Text => "text message",
        }
    }
}

/// Per-admin-chat broadcast draft state. Volatile: drafts do not survive a
/// restart.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftState {
    WaitingForMessage,
    Confirming(BroadcastPayload),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DraftEvent<'a> {
    StartBroadcast,
    Inbound(&'a InboundMessage),
    Approve,
    Decline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DraftEffect {
    Reply(String),
    EchoDraft(BroadcastPayload),
    FanOut(BroadcastPayload),
}

/// Pure broadcast-draft transition function. Callers key state per admin
/// chat and execute the returned effects.
pub fn advance(
    state: Option<DraftState>,
    event: DraftEvent<'_>,
    is_admin: bool,
) -> (Option<DraftState>, Vec<DraftEffect>) {
    match event {
        DraftEvent::StartBroadcast => {
            if !is_admin {
                return (
                    state,
                    vec![DraftEffect::Reply(
                        "This command is for administrators only.".to_string(),
                    )],
                );
            }
            (
                Some(DraftState::WaitingForMessage),
                vec![DraftEffect::Reply(
                    "Send the message to broadcast (text, photo, video, video note, document, or audio)."
                        .to_string(),
                )],
            )
        }
        DraftEvent::Inbound(message) => match state {
            Some(DraftState::WaitingForMessage) => match BroadcastPayload::from_message(message) {
                Some(payload) => (
                    Some(DraftState::Confirming(payload.clone())),
                    vec![DraftEffect::EchoDraft(payload)],
                ),
                None => (
                    None,
                    vec![DraftEffect::Reply(
                        "Unsupported message type; broadcast cancelled.".to_string(),
                    )],
                ),
            },
            other => (other, vec![]),
        },
        DraftEvent::Approve => match state {
            Some(DraftState::Confirming(payload)) if is_admin => {
                (None, vec![DraftEffect::FanOut(payload)])
            }
            other => (other, vec![]),
        },
        DraftEvent::Decline => match state {
            Some(DraftState::Confirming(_)) => (
                None,
                vec![DraftEffect::Reply("Broadcast cancelled.".to_string())],
            ),
            other => (other, vec![]),
        },
    }
}

/// Replace `${VAR_NAME}` patterns in a string with values from environment
/// variables. Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}
