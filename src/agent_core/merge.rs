//! Merge: turn a tool outcome into model instructions or a direct answer.
//!
//! Tool data is rendered as compact text and injected as an authoritative
//! system message ahead of the user's prompt. A failed or skipped tool call
//! becomes an explicit note instead, so the model never pretends to have
//! live data it does not have.

use serde_json::Value;

use crate::inference::ChatMessage;

use super::types::{ConversationContext, Domain, ExtractedArgument};

// ─── Caller-visible notices ──────────────────────────────────────────────────

pub const TOOL_UNAVAILABLE_NOTICE: &str =
    "Note: live data is unavailable right now, so this answer is not based on current information.";

pub const NO_TOOL_DATA_NOTICE: &str =
    "Note: no live data was used for this answer because the request did not say what to look up.";

pub const INCOMPLETE_NOTICE: &str = "[The answer may be incomplete: the response was interrupted.]";

pub const MODEL_UNAVAILABLE_MESSAGE: &str =
    "Sorry, the language model is unavailable right now. Please try again in a moment.";

/// Used when a domain configures the clarify policy without its own text.
pub const DEFAULT_CLARIFY_QUESTION: &str = "Could you tell me which one you mean?";

// ─── Tool context ────────────────────────────────────────────────────────────

/// What the merge step knows about the tool phase.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContext<'a> {
    /// No tool was indicated.
    None,
    /// The tool answered; `rendered` is the compact text form.
    Data {
        domain: Domain,
        argument: Option<&'a ExtractedArgument>,
        rendered: String,
    },
    /// The tool was called and failed, or the tool phase ran out of time.
    Unavailable { domain: Domain },
    /// A tool was indicated but its argument could not be extracted.
    NotUsed { domain: Domain },
}

impl ToolContext<'_> {
    /// Notice streamed to the caller before the answer, if any.
    pub fn notice(&self) -> Option<&'static str> {
        match self {
            ToolContext::Unavailable { .. } => Some(TOOL_UNAVAILABLE_NOTICE),
            ToolContext::NotUsed { .. } => Some(NO_TOOL_DATA_NOTICE),
            ToolContext::None | ToolContext::Data { .. } => None,
        }
    }
}

/// Build the message list for the generation call.
///
/// Order: system prompt, retrieved context, prior turns, tool context,
/// user prompt.
pub fn compose_messages(
    system_prompt: &str,
    context: &ConversationContext,
    tool: &ToolContext<'_>,
    prompt: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(context.prior_turns.len() + 4);

    if !system_prompt.trim().is_empty() {
        messages.push(ChatMessage::system(system_prompt.trim()));
    }

    if let Some(retrieved) = context.retrieved_context.as_deref().filter(|r| !r.trim().is_empty()) {
        messages.push(ChatMessage::system(format!(
            "Reference material that may help with the question:\n\n{}",
            retrieved.trim()
        )));
    }

    messages.extend(context.prior_turns.iter().cloned());

    match tool {
        ToolContext::None => {}
        ToolContext::Data {
            domain,
            argument,
            rendered,
        } => {
            let subject = argument
                .and_then(|a| a.normalized_name.as_deref().or(a.value.as_deref()))
                .map(|s| format!(" for {s}"))
                .unwrap_or_default();
            messages.push(ChatMessage::system(format!(
                "Live {domain} data{subject}, retrieved just now. Treat it as authoritative and \
                 base your answer on it. Do not invent values it does not contain.\n\n{rendered}"
            )));
        }
        ToolContext::Unavailable { domain } => {
            messages.push(ChatMessage::system(format!(
                "The live {domain} service could not be reached. Answer from general knowledge, \
                 say that current {domain} data is unavailable, and do not make up current values."
            )));
        }
        ToolContext::NotUsed { domain } => {
            messages.push(ChatMessage::system(format!(
                "The question looks like a {domain} question, but it did not say what to look up, \
                 so no live data was retrieved. Answer from general knowledge and do not make up \
                 current values."
            )));
        }
    }

    messages.push(ChatMessage::user(prompt));
    messages
}

// ─── Rendering ───────────────────────────────────────────────────────────────

/// Render a tool result as compact text, at most `limit` bytes.
pub fn render_tool_result(domain: Domain, result: &Value, limit: usize) -> String {
    let data = unwrap_data(result);

    if let Some(text) = preformatted_text(data) {
        return bounded(text, limit);
    }

    let rendered = match domain {
        Domain::Weather => render_weather(data),
        Domain::Stock => render_stock(data),
        Domain::Search => render_search(data),
    };

    match rendered {
        Some(text) => bounded(&text, limit),
        None => {
            let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
            bounded(&pretty, limit)
        }
    }
}

/// Truncate `s` to at most `max_bytes` bytes on a char boundary.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn bounded(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    tracing::debug!(original_len = text.len(), limit, "tool result truncated");
    format!("{}\n[... truncated]", truncate_utf8(text, limit))
}

/// Servers sometimes wrap the payload as `{"data": {...}}`.
fn unwrap_data(value: &Value) -> &Value {
    match value.get("data") {
        Some(inner) if inner.is_object() || inner.is_array() => inner,
        _ => value,
    }
}

/// `{"content": [{"type": "text", "text": ".."}]}` is already prose.
fn preformatted_text(value: &Value) -> Option<&str> {
    value
        .get("content")?
        .as_array()?
        .iter()
        .find(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
}

/// First present field among `keys`.
fn field<'v>(value: &'v Value, keys: &[&str]) -> Option<&'v Value> {
    keys.iter().find_map(|k| value.get(*k)).filter(|v| !v.is_null())
}

/// Scalars as plain text; objects by one of `nested` keys.
fn scalar(value: &Value, nested: &[&str]) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(_) => field(value, nested).and_then(|v| scalar(v, &[])),
        _ => None,
    }
}

fn line(out: &mut Vec<String>, label: &str, value: Option<String>, unit: &str) {
    if let Some(v) = value {
        out.push(format!("{label}: {v}{unit}"));
    }
}

fn render_weather(data: &Value) -> Option<String> {
    if !data.is_object() {
        return None;
    }
    let mut out = Vec::new();

    let city = field(data, &["city_korean", "city", "location"]).and_then(|v| scalar(v, &[]));
    if let Some(city) = &city {
        out.push(format!("Location: {city}"));
    }
    line(
        &mut out,
        "Conditions",
        field(data, &["description_korean", "description", "weather"]).and_then(|v| scalar(v, &["main"])),
        "",
    );
    line(
        &mut out,
        "Temperature",
        field(data, &["temperature", "temp"]).and_then(|v| scalar(v, &["celsius", "current", "temp"])),
        "°C",
    );
    line(
        &mut out,
        "Feels like",
        field(data, &["feels_like"]).and_then(|v| scalar(v, &["celsius", "current"])),
        "°C",
    );
    line(
        &mut out,
        "Humidity",
        field(data, &["humidity"]).and_then(|v| scalar(v, &["current", "humidity"])),
        "%",
    );
    line(
        &mut out,
        "Wind",
        field(data, &["wind"]).and_then(|v| scalar(v, &["speed", "wind_speed"])),
        " m/s",
    );
    line(
        &mut out,
        "Pressure",
        field(data, &["pressure"]).and_then(|v| scalar(v, &["current", "pressure"])),
        " hPa",
    );
    line(
        &mut out,
        "Precipitation chance",
        field(data, &["precipitation"]).and_then(|v| scalar(v, &["probability", "chance"])),
        "%",
    );
    if let (Some(rise), Some(set)) = (
        field(data, &["sunrise"]).and_then(|v| scalar(v, &[])),
        field(data, &["sunset"]).and_then(|v| scalar(v, &[])),
    ) {
        out.push(format!("Sunrise: {rise}, sunset: {set}"));
    }

    if let Some(days) = field(data, &["forecast", "daily"]).and_then(Value::as_array) {
        out.push("Forecast:".to_string());
        for day in days {
            let date = field(day, &["date", "day", "dt_txt"]).and_then(|v| scalar(v, &[]));
            let desc = field(day, &["description_korean", "description", "weather"])
                .and_then(|v| scalar(v, &["main"]));
            let high = field(day, &["temp_max", "max", "high"]).and_then(|v| scalar(v, &["celsius"]));
            let low = field(day, &["temp_min", "min", "low"]).and_then(|v| scalar(v, &["celsius"]));
            let mut parts = Vec::new();
            if let Some(desc) = desc {
                parts.push(desc);
            }
            match (high, low) {
                (Some(h), Some(l)) => parts.push(format!("{l}°C to {h}°C")),
                (Some(h), None) => parts.push(format!("high {h}°C")),
                (None, Some(l)) => parts.push(format!("low {l}°C")),
                (None, None) => {}
            }
            out.push(format!("- {}: {}", date.unwrap_or_else(|| "?".into()), parts.join(", ")));
        }
    }

    line(
        &mut out,
        "Updated",
        field(data, &["timestamp", "updated_at"]).and_then(|v| scalar(v, &[])),
        "",
    );

    // Only a location line means nothing weather-shaped was found.
    (out.len() > usize::from(city.is_some())).then(|| out.join("\n"))
}

fn render_stock(data: &Value) -> Option<String> {
    if !data.is_object() {
        return None;
    }
    let mut out = Vec::new();

    let name = field(data, &["name", "company_name", "stock_name"]).and_then(|v| scalar(v, &[]));
    let code = field(data, &["code", "stock_code", "symbol"]).and_then(|v| scalar(v, &[]));
    match (&name, &code) {
        (Some(n), Some(c)) => out.push(format!("Company: {n} ({c})")),
        (Some(n), None) => out.push(format!("Company: {n}")),
        (None, Some(c)) => out.push(format!("Code: {c}")),
        (None, None) => {}
    }
    let header = out.len();

    line(&mut out, "Price", field(data, &["price", "current_price"]).and_then(|v| scalar(v, &[])), "");
    let change = field(data, &["change", "price_change"]).and_then(|v| scalar(v, &[]));
    let rate = field(data, &["change_rate", "price_change_rate", "change_percent"]).and_then(|v| scalar(v, &[]));
    match (change, rate) {
        (Some(c), Some(r)) => out.push(format!("Change: {c} ({r}%)")),
        (Some(c), None) => out.push(format!("Change: {c}")),
        (None, Some(r)) => out.push(format!("Change: {r}%")),
        (None, None) => {}
    }
    line(&mut out, "Volume", field(data, &["volume", "trading_volume"]).and_then(|v| scalar(v, &[])), "");
    line(
        &mut out,
        "Market cap",
        field(data, &["market_cap", "market_capitalization"]).and_then(|v| scalar(v, &[])),
        "",
    );
    line(&mut out, "As of", field(data, &["timestamp", "date"]).and_then(|v| scalar(v, &[])), "");

    (out.len() > header).then(|| out.join("\n"))
}

fn render_search(data: &Value) -> Option<String> {
    let results = match data {
        Value::Array(items) => items,
        other => field(other, &["results", "items", "organic_results"])?.as_array()?,
    };

    let mut out = Vec::new();
    if let Some(total) = data.get("total_results").and_then(|v| scalar(v, &[])) {
        out.push(format!("About {total} results."));
    }
    for (i, item) in results.iter().enumerate() {
        let title = field(item, &["title"]).and_then(|v| scalar(v, &[])).unwrap_or_default();
        let mut entry = format!("{}. {title}", i + 1);
        if let Some(link) = field(item, &["link", "url"]).and_then(|v| scalar(v, &[])) {
            entry.push_str(&format!(" <{link}>"));
        }
        if let Some(snippet) = field(item, &["snippet", "description"]).and_then(|v| scalar(v, &[])) {
            entry.push_str(&format!("\n   {}", snippet.trim()));
        }
        out.push(entry);
    }
    if results.is_empty() {
        out.push("No results.".to_string());
    }
    Some(out.join("\n"))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
