//! crates/talk_diary_core/src/report.rs
//!
//! Daily diary reports.
//!
//! Reports are produced by an external summarization job and stored by the
//! backend as a nested JSON document. This module projects that document onto
//! the flat view model the diary screens render. Any optional sub-object may be
//! missing from the stored document; the projection fills in empty values
//! instead. A report without a target date is not displayable and is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DefaultOnError};
use tracing::warn;
use uuid::Uuid;

//=========================================================================================
// Backend-shaped Record
//=========================================================================================

/// A report row exactly as the backend returns it.
#[derive(Debug, Clone)]
pub struct ReportRecord {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Nested Content Schema (input)
//=========================================================================================

// Every optional node is read leniently: a value of the wrong JSON type is
// treated as absent, so only a missing target date makes a report invalid.
// The target date itself is read from the raw document.

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReportContent {
    #[serde_as(deserialize_as = "DefaultOnError")]
    dashboard: Option<Dashboard>,
    #[serde_as(deserialize_as = "DefaultOnError<Option<Vec<DefaultOnError>>>")]
    special_moments: Option<Vec<SpecialMoment>>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    summary_image: Option<SummaryImage>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Dashboard {
    #[serde_as(deserialize_as = "DefaultOnError")]
    summary: Option<Summary>,
    #[serde_as(deserialize_as = "DefaultOnError<Option<Vec<DefaultOnError>>>")]
    keywords: Option<Vec<KeywordTag>>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    emotion_weather: Option<EmotionWeather>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    best_chemistry: Option<BestChemistry>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Summary {
    #[serde_as(deserialize_as = "DefaultOnError")]
    title: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    text: Option<String>,
}

/// Display colors are chosen by the summarizer; the view model only keeps the
/// text, so they are accepted and ignored.
#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KeywordTag {
    #[serde_as(deserialize_as = "DefaultOnError")]
    text: Option<String>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EmotionWeather {
    #[serde_as(deserialize_as = "DefaultOnError")]
    dominant: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    score: Option<f64>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    description: Option<String>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BestChemistry {
    #[serde_as(deserialize_as = "DefaultOnError")]
    name: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    chat_id: Option<String>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SpecialMoment {
    #[serde_as(deserialize_as = "DefaultOnError")]
    tag: Option<KeywordTag>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    title: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    preview_text: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    sender: Option<MomentSender>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    source_context: Option<SourceContext>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MomentSender {
    #[serde_as(deserialize_as = "DefaultOnError")]
    name: Option<String>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SourceContext {
    #[serde_as(deserialize_as = "DefaultOnError")]
    chat_id: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    original_message_id: Option<String>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SummaryImage {
    #[serde_as(deserialize_as = "DefaultOnError")]
    image_url: Option<String>,
}

//=========================================================================================
// Flattened View Model (output)
//=========================================================================================

/// A report ready for display, keyed by the date it summarizes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyReport {
    pub id: Uuid,
    pub user_id: Uuid,
    pub report_date: String,
    pub content: DailyReportContent,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyReportContent {
    pub daily_summary: DailySummary,
    pub special_conversations: Vec<SpecialConversation>,
    pub ai_image_summary: AiImageSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub title: String,
    pub summary_text: String,
    pub keywords: Vec<String>,
    pub emotion_weather: String,
    /// The dominant emotion label, carried through unchanged.
    pub emotion_icon: Option<String>,
    pub emotion_score: Option<f64>,
    pub best_tikitaka: BestTikitaka,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BestTikitaka {
    pub name: String,
    pub chat_id: Option<String>,
}

/// One special moment, pointing back at the message it quotes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialConversation {
    pub keyword: String,
    pub title: String,
    pub preview: String,
    pub sender_name: String,
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiImageSummary {
    /// Never an empty string, so "has image" is a single `is_some` check.
    pub image_url: Option<String>,
}

//=========================================================================================
// Normalization
//=========================================================================================

/// Returns true when `content` carries a non-empty `report_meta.target_date`.
pub fn is_valid_report_content(content: &Value) -> bool {
    target_date_of(content).is_some()
}

fn target_date_of(content: &Value) -> Option<&str> {
    content
        .get("report_meta")?
        .get("target_date")?
        .as_str()
        .filter(|date| !date.is_empty())
}

/// Projects a backend report onto the display view model.
///
/// Returns `None` only when the report has no target date. Optional fields
/// that are missing or hold the wrong JSON type fall back to empty values.
pub fn normalize_report(record: &ReportRecord) -> Option<DailyReport> {
    let Some(target_date) = target_date_of(&record.content) else {
        warn!(report_id = %record.id, "Skipping report without a target date");
        return None;
    };

    // Only a non-object document can fail to deserialize, and having a target
    // date already rules that out.
    let content = ReportContent::deserialize(&record.content).unwrap_or_default();

    Some(DailyReport {
        id: record.id,
        user_id: record.profile_id,
        report_date: target_date.to_string(),
        content: flatten(content),
        created_at: record.created_at,
    })
}

/// Normalizes a batch, dropping reports that are not displayable.
pub fn normalize_reports<'a, I>(records: I) -> Vec<DailyReport>
where
    I: IntoIterator<Item = &'a ReportRecord>,
{
    records.into_iter().filter_map(normalize_report).collect()
}

fn flatten(content: ReportContent) -> DailyReportContent {
    let dashboard = content.dashboard.unwrap_or_default();
    let summary = dashboard.summary.unwrap_or_default();
    let emotion = dashboard.emotion_weather.unwrap_or_default();
    let best = dashboard.best_chemistry.unwrap_or_default();

    let keywords = dashboard
        .keywords
        .unwrap_or_default()
        .into_iter()
        .map(|k| k.text.unwrap_or_default())
        .collect();

    let special_conversations = content
        .special_moments
        .unwrap_or_default()
        .into_iter()
        .map(flatten_moment)
        .collect();

    let image_url = content
        .summary_image
        .and_then(|image| image.image_url)
        .filter(|url| !url.is_empty());

    DailyReportContent {
        daily_summary: DailySummary {
            title: summary.title.unwrap_or_default(),
            summary_text: summary.text.unwrap_or_default(),
            keywords,
            emotion_weather: emotion_weather_label(&emotion),
            emotion_icon: emotion.dominant,
            emotion_score: emotion.score,
            best_tikitaka: BestTikitaka {
                name: best.name.unwrap_or_default(),
                chat_id: best.chat_id,
            },
        },
        special_conversations,
        ai_image_summary: AiImageSummary { image_url },
    }
}

fn flatten_moment(moment: SpecialMoment) -> SpecialConversation {
    let source = moment.source_context.unwrap_or_default();
    SpecialConversation {
        keyword: moment.tag.and_then(|t| t.text).unwrap_or_default(),
        title: moment.title.unwrap_or_default(),
        preview: moment.preview_text.unwrap_or_default(),
        sender_name: moment.sender.and_then(|s| s.name).unwrap_or_default(),
        chat_id: source.chat_id.unwrap_or_default(),
        message_id: source.original_message_id,
    }
}

fn emotion_weather_label(emotion: &EmotionWeather) -> String {
    if let Some(description) = emotion.description.as_deref().filter(|d| !d.is_empty()) {
        return description.to_string();
    }
    match (&emotion.dominant, emotion.score) {
        (Some(dominant), Some(score)) => format!("{} {}%", dominant, score.round() as i64),
        _ => String::new(),
    }
}
