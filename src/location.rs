//! Location expansion: splits a city or state search into neighborhood
//! searches once the broad query stops returning pages.
//!
//! Sub-locations use the geocoder-friendly form
//! `Neighborhood, City, State of State, Brazil`, without accents.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::errors::AppError;
use crate::hashing::{fold_accents, normalize_text};
use crate::services::{error_body, join_url, parse_json, send, status_error};

/// Brazilian states: abbreviation and plain name.
const STATES: &[(&str, &str)] = &[
    ("AC", "Acre"),
    ("AL", "Alagoas"),
    ("AP", "Amapa"),
    ("AM", "Amazonas"),
    ("BA", "Bahia"),
    ("CE", "Ceara"),
    ("DF", "Distrito Federal"),
    ("ES", "Espirito Santo"),
    ("GO", "Goias"),
    ("MA", "Maranhao"),
    ("MT", "Mato Grosso"),
    ("MS", "Mato Grosso do Sul"),
    ("MG", "Minas Gerais"),
    ("PA", "Para"),
    ("PB", "Paraiba"),
    ("PR", "Parana"),
    ("PE", "Pernambuco"),
    ("PI", "Piaui"),
    ("RJ", "Rio de Janeiro"),
    ("RN", "Rio Grande do Norte"),
    ("RS", "Rio Grande do Sul"),
    ("RO", "Rondonia"),
    ("RR", "Roraima"),
    ("SC", "Santa Catarina"),
    ("SP", "Sao Paulo"),
    ("SE", "Sergipe"),
    ("TO", "Tocantins"),
];

/// Parts that carry no location information.
const IGNORED_PARTS: &[&str] = &["brasil", "brazil", "br", "america do sul", "south america"];

/// Words kept lowercase in place names.
const LOWERCASE_WORDS: &[&str] = &["de", "do", "da", "dos", "das", "of"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationLevel {
    Neighborhood,
    City,
    State,
}

/// City and state of a location that can be expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLocation {
    pub level: LocationLevel,
    /// `None` for a whole state.
    pub city: Option<String>,
    pub state: String,
}

impl ParsedLocation {
    /// City when known, otherwise the state.
    pub fn area(&self) -> &str {
        self.city.as_deref().unwrap_or(&self.state)
    }
}

/// Canonical state name for an abbreviation or a (possibly accented) name.
pub fn state_name(part: &str) -> Option<&'static str> {
    let part = part.trim();
    let folded = normalize_text(part);
    STATES
        .iter()
        .find(|(abbr, name)| abbr.eq_ignore_ascii_case(part) || normalize_text(name) == folded)
        .map(|(_, name)| *name)
}

/// Comma-separated parts minus country names, with any `State of ` prefix removed.
fn relevant_parts(location: &str) -> Vec<&str> {
    location
        .split(',')
        .map(|part| {
            let part = part.trim();
            match part.get(..9) {
                Some(prefix) if prefix.eq_ignore_ascii_case("state of ") => part[9..].trim(),
                _ => part,
            }
        })
        .filter(|part| {
            let folded = normalize_text(part);
            !folded.is_empty() && !IGNORED_PARTS.contains(&folded.as_str())
        })
        .collect()
}

/// Guesses whether `location` names a neighborhood, a city or a state.
pub fn detect_location_level(location: &str) -> LocationLevel {
    let parts = relevant_parts(location);

    // Repeated name ("Rondonia, Rondonia"): a state when the name is one.
    if parts.len() >= 2 && normalize_text(parts[0]) == normalize_text(parts[1]) {
        return if state_name(parts[0]).is_some() {
            LocationLevel::State
        } else {
            LocationLevel::City
        };
    }

    match parts.as_slice() {
        [] => LocationLevel::City,
        [only] => {
            if state_name(only).is_some() {
                LocationLevel::State
            } else {
                LocationLevel::City
            }
        }
        [first, second] => {
            if state_name(second).is_some() {
                LocationLevel::City
            } else if state_name(first).is_some() {
                LocationLevel::State
            } else {
                LocationLevel::City
            }
        }
        _ => LocationLevel::Neighborhood,
    }
}

/// City and state of `location`, or `None` for a neighborhood.
pub fn parse_location(location: &str) -> Option<ParsedLocation> {
    let level = detect_location_level(location);
    let parts = relevant_parts(location);
    let canonical = |part: &str| {
        state_name(part)
            .map(str::to_string)
            .unwrap_or_else(|| title_case(part))
    };

    match level {
        LocationLevel::Neighborhood => None,
        LocationLevel::State => Some(ParsedLocation {
            level,
            city: None,
            state: canonical(parts.first().copied().unwrap_or(location)),
        }),
        LocationLevel::City => {
            let city = parts.first().copied().unwrap_or(location);
            Some(ParsedLocation {
                level,
                city: Some(title_case(city)),
                state: canonical(parts.get(1).copied().unwrap_or(city)),
            })
        }
    }
}

/// Strips accents and capitalizes each word of each comma-separated part.
pub fn title_case(raw: &str) -> String {
    fold_accents(raw)
        .split(',')
        .map(|part| {
            part.split_whitespace()
                .map(|word| {
                    let lower = word.to_lowercase();
                    if LOWERCASE_WORDS.contains(&lower.as_str()) {
                        return lower;
                    }
                    let mut chars = lower.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars).collect(),
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `Neighborhood, City, State of State, Brazil`.
pub fn format_sub_location(neighborhood: &str, city: &str, state: &str) -> String {
    format!(
        "{}, {}, State of {}, Brazil",
        title_case(neighborhood),
        title_case(city),
        title_case(state)
    )
}

/// Whether `location` already has the sub-location form.
pub fn is_sub_location_format(location: &str) -> bool {
    let parts: Vec<&str> = location.split(',').map(str::trim).collect();
    parts.len() >= 4
        && parts.iter().any(|p| p.starts_with("State of "))
        && parts.last() == Some(&"Brazil")
        && fold_accents(location) == location
}

/// Neighborhood name of a sub-location (its first part).
pub fn neighborhood_of(sub_location: &str) -> &str {
    sub_location.split(',').next().unwrap_or(sub_location).trim()
}

/// Brings expander answers into sub-location form, dropping repeats and
/// anything already searched.
pub fn clean_sub_locations(
    candidates: Vec<String>,
    already_searched: &[String],
    parsed: &ParsedLocation,
) -> Vec<String> {
    let mut seen: HashSet<String> = already_searched.iter().map(|l| normalize_text(l)).collect();
    let mut cleaned = Vec::new();

    for candidate in candidates {
        let candidate = candidate.trim();
        if neighborhood_of(candidate).is_empty() {
            continue;
        }
        let formatted = if is_sub_location_format(candidate) {
            title_case(candidate)
        } else {
            format_sub_location(neighborhood_of(candidate), parsed.area(), &parsed.state)
        };
        if seen.insert(normalize_text(&formatted)) {
            cleaned.push(formatted);
        } else {
            tracing::debug!("Dropping repeated sub-location '{}'", formatted);
        }
    }
    cleaned
}

#[async_trait]
pub trait LocationExpander: Send + Sync {
    /// Up to `wanted` sub-locations of `location` where `search_term`
    /// businesses are likely, skipping `already_searched`.
    async fn sub_locations(
        &self,
        search_term: &str,
        location: &ParsedLocation,
        already_searched: &[String],
        wanted: usize,
    ) -> Result<Vec<String>, AppError>;
}

/// Fixed neighborhood lists per city or state.
#[derive(Debug, Clone, Default)]
pub struct StaticNeighborhoods {
    areas: HashMap<String, Vec<String>>,
}

impl StaticNeighborhoods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_area(mut self, area: &str, neighborhoods: &[&str]) -> Self {
        self.areas.insert(
            normalize_text(area),
            neighborhoods.iter().map(|n| n.to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl LocationExpander for StaticNeighborhoods {
    async fn sub_locations(
        &self,
        _search_term: &str,
        location: &ParsedLocation,
        already_searched: &[String],
        wanted: usize,
    ) -> Result<Vec<String>, AppError> {
        let Some(neighborhoods) = self.areas.get(&normalize_text(location.area())) else {
            return Ok(Vec::new());
        };
        let searched: HashSet<String> = already_searched.iter().map(|l| normalize_text(l)).collect();
        Ok(neighborhoods
            .iter()
            .map(|n| format_sub_location(n, location.area(), &location.state))
            .filter(|l| !searched.contains(&normalize_text(l)))
            .take(wanted)
            .collect())
    }
}

// ============ Chat-completions expander ============

/// Asks an OpenAI-compatible chat-completions API (OpenRouter by default)
/// for neighborhoods.
pub struct ChatCompletionsExpander {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NeighborhoodAnswer {
    locations: Vec<String>,
    #[serde(default)]
    has_more_neighborhoods: Option<bool>,
}

const SYSTEM_PROMPT: &str = "You list Brazilian neighborhoods for local business searches. \
Answer only with JSON of the form {\"locations\": [\"Neighborhood, City, State of State, Brazil\"], \
\"has_more_neighborhoods\": true}. Write names without accents.";

impl ChatCompletionsExpander {
    pub fn new(client: Client, base_url: String, api_key: String, model: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            model,
        }
    }

    fn user_prompt(
        search_term: &str,
        location: &ParsedLocation,
        already_searched: &[String],
        wanted: usize,
    ) -> String {
        let area = match &location.city {
            Some(city) => format!("the city of {}, {}", city, location.state),
            None => format!("the main cities of the state of {}", location.state),
        };
        let searched = if already_searched.is_empty() {
            "none yet".to_string()
        } else {
            already_searched.join("\n")
        };
        format!(
            "List {} neighborhoods in {} where businesses matching \"{}\" are most likely found, \
             busiest first.\nAlready searched:\n{}",
            wanted, area, search_term, searched
        )
    }

    /// The JSON object inside a model answer that may wrap it in prose or fences.
    pub fn parse_answer(content: &str) -> Result<Vec<String>, AppError> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"\{[\s\S]*\}").expect("json object regex is valid")
        });
        let object = re.find(content).ok_or_else(|| {
            AppError::MalformedData("Expansion answer contains no JSON object".to_string())
        })?;
        let answer: NeighborhoodAnswer = serde_json::from_str(object.as_str()).map_err(|e| {
            AppError::MalformedData(format!("Failed to parse expansion answer: {}", e))
        })?;
        tracing::debug!(
            "Expansion answer: {} locations (more available: {})",
            answer.locations.len(),
            answer.has_more_neighborhoods.unwrap_or(true)
        );
        Ok(answer.locations)
    }
}

#[async_trait]
impl LocationExpander for ChatCompletionsExpander {
    async fn sub_locations(
        &self,
        search_term: &str,
        location: &ParsedLocation,
        already_searched: &[String],
        wanted: usize,
    ) -> Result<Vec<String>, AppError> {
        let url = join_url(&self.base_url, "chat/completions");
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": Self::user_prompt(search_term, location, already_searched, wanted),
                },
            ],
            "temperature": 0.2,
        });
        tracing::info!(
            "Requesting {} sub-locations of '{}' from {}",
            wanted,
            location.area(),
            self.model
        );

        let response = send(
            "Location expansion",
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(status_error("Location expansion", status, &error_body(response).await));
        }

        let parsed: ChatResponse = parse_json("Location expansion", response).await?;
        let content = parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| {
                AppError::MalformedData("Location expansion returned an empty answer".to_string())
            })?;
        let mut locations = Self::parse_answer(&content)?;
        locations.truncate(wanted);
        Ok(locations)
    }
}
