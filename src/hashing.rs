use sha2::{Digest, Sha256};

use crate::errors::AppError;
use crate::models::{CnpjSearchFilters, SourcePayload, SourceType};
use crate::normalize::{normalize_cnpj, normalize_instagram_username};

/// Hex-encoded SHA-256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Plain letter for a lowercase Portuguese accented letter.
fn plain_letter(c: char) -> Option<char> {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' => Some('a'),
        'é' | 'è' | 'ê' | 'ë' => Some('e'),
        'í' | 'ì' | 'î' | 'ï' => Some('i'),
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => Some('o'),
        'ú' | 'ù' | 'û' | 'ü' => Some('u'),
        'ç' => Some('c'),
        'ñ' => Some('n'),
        _ => None,
    }
}

/// Replaces Portuguese accented letters with plain ones, keeping case.
pub fn fold_accents(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if let Some(plain) = plain_letter(c) {
                return plain;
            }
            let lower = c.to_lowercase().next().unwrap_or(c);
            match plain_letter(lower) {
                Some(plain) => plain.to_ascii_uppercase(),
                None => c,
            }
        })
        .collect()
}

/// Lowercases, folds Portuguese accents and collapses whitespace and punctuation.
pub fn normalize_text(raw: &str) -> String {
    let folded: String = raw
        .to_lowercase()
        .chars()
        .map(|c| match plain_letter(c) {
            Some(plain) => plain,
            None if c.is_alphanumeric() => c,
            None => ' ',
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Identity key for a search result, before hashing.
///
/// Maps places use name plus address (falling back to the searched location),
/// registry companies their CNPJ, Instagram profiles their username.
pub fn identity_key(payload: &SourcePayload, search_location: &str) -> Result<String, AppError> {
    match payload {
        SourcePayload::GoogleMaps(place) => {
            let name = normalize_text(&place.title);
            if name.is_empty() {
                return Err(AppError::MalformedData("maps result without title".into()));
            }
            let location = place
                .address
                .as_deref()
                .filter(|a| !a.trim().is_empty())
                .unwrap_or(search_location);
            Ok(format!("maps|{}|{}", name, normalize_text(location)))
        }
        SourcePayload::Cnpj(company) => normalize_cnpj(&company.cnpj)
            .map(|cnpj| format!("cnpj|{}", cnpj))
            .ok_or_else(|| {
                AppError::MalformedData(format!("invalid CNPJ in registry result: {}", company.cnpj))
            }),
        SourcePayload::Instagram(profile) => normalize_instagram_username(&profile.username)
            .map(|username| format!("instagram|{}", username))
            .ok_or_else(|| {
                AppError::MalformedData(format!(
                    "invalid instagram username: {}",
                    profile.username
                ))
            }),
    }
}

/// Deduplication hash stored on the staging record.
pub fn deduplication_hash(
    payload: &SourcePayload,
    search_location: &str,
) -> Result<String, AppError> {
    identity_key(payload, search_location).map(|key| sha256_hex(&key))
}

/// Hash identifying a search query for resume/exhaustion tracking.
pub fn query_hash(
    source: SourceType,
    search_term: &str,
    location: &str,
    cnpj_filters: Option<&CnpjSearchFilters>,
) -> String {
    let mut key = format!(
        "{}|{}|{}",
        source.as_str(),
        normalize_text(search_term),
        normalize_text(location)
    );
    if let Some(filters) = cnpj_filters {
        key.push_str(&format!(
            "|uf={}|mun={}|cnae={}|active={}",
            filters.uf.as_deref().map(normalize_text).unwrap_or_default(),
            filters.municipio.as_deref().map(normalize_text).unwrap_or_default(),
            filters.cnae.as_deref().unwrap_or_default(),
            filters.only_active
        ));
    }
    sha256_hex(&key)
}
