//! Merges listing data and enrichment results into one value per contact field.
//!
//! A single priority table decides every field; the winning provider is kept
//! next to the value so the CRM can show where it came from.

use crate::models::{ContactChannels, DataSource, SourcePayload, SourcedValue, StagingRecord};
use crate::normalize::{
    business_domain, extract_emails, extract_phones, extract_whatsapp_numbers, normalize_email,
    normalize_phone,
};

/// Highest priority first.
pub const PRIORITY: [DataSource; 5] = [
    DataSource::CnpjRegistry,
    DataSource::GoogleMaps,
    DataSource::WebsiteScrape,
    DataSource::Instagram,
    DataSource::Whois,
];

pub fn priority(source: DataSource) -> usize {
    PRIORITY
        .iter()
        .position(|s| *s == source)
        .unwrap_or(PRIORITY.len())
}

/// Best candidate by priority; earlier candidates win ties.
pub fn pick(candidates: Vec<SourcedValue>) -> Option<SourcedValue> {
    candidates
        .into_iter()
        .enumerate()
        .min_by_key(|(idx, c)| (priority(c.source), *idx))
        .map(|(_, c)| c)
}

/// Recomputes the consolidated contact channels for a record.
pub fn consolidate(record: &StagingRecord) -> ContactChannels {
    ContactChannels {
        phone: pick(phone_candidates(record)),
        email: pick(email_candidates(record)),
        website: pick(website_candidates(record)),
    }
}

fn sourced(values: impl IntoIterator<Item = String>, source: DataSource) -> Vec<SourcedValue> {
    values
        .into_iter()
        .map(|value| SourcedValue { value, source })
        .collect()
}

fn phone_candidates(record: &StagingRecord) -> Vec<SourcedValue> {
    let mut raw: Vec<SourcedValue> = Vec::new();
    let listing = record.payload.listing_source();

    match &record.payload {
        SourcePayload::GoogleMaps(place) => {
            raw.extend(sourced(place.phone_number.clone(), listing));
        }
        SourcePayload::Cnpj(company) => {
            raw.extend(sourced(company.phones.clone(), listing));
        }
        SourcePayload::Instagram(profile) => {
            let bio = profile.biography.as_deref().unwrap_or_default();
            let link = profile.external_url.as_deref().unwrap_or_default();
            raw.extend(sourced(extract_whatsapp_numbers(link), listing));
            raw.extend(sourced(extract_whatsapp_numbers(bio), listing));
            raw.extend(sourced(extract_phones(bio), listing));
        }
    }

    if let Some(company) = &record.enrichment.cnpj {
        raw.extend(sourced(company.phones.clone(), DataSource::CnpjRegistry));
    }
    if let Some(site) = &record.enrichment.website {
        raw.extend(sourced(site.whatsapp.clone(), DataSource::WebsiteScrape));
        raw.extend(sourced(site.phones.clone(), DataSource::WebsiteScrape));
    }
    if let Some(whois) = &record.enrichment.whois {
        raw.extend(sourced(whois.phones.clone(), DataSource::Whois));
    }

    raw.into_iter()
        .filter_map(|c| {
            normalize_phone(&c.value).map(|value| SourcedValue {
                value,
                source: c.source,
            })
        })
        .collect()
}

fn email_candidates(record: &StagingRecord) -> Vec<SourcedValue> {
    let mut raw: Vec<SourcedValue> = Vec::new();
    let listing = record.payload.listing_source();

    match &record.payload {
        SourcePayload::GoogleMaps(_) => {}
        SourcePayload::Cnpj(company) => raw.extend(sourced(company.emails.clone(), listing)),
        SourcePayload::Instagram(profile) => {
            let bio = profile.biography.as_deref().unwrap_or_default();
            raw.extend(sourced(extract_emails(bio), listing));
        }
    }

    if let Some(company) = &record.enrichment.cnpj {
        raw.extend(sourced(company.emails.clone(), DataSource::CnpjRegistry));
    }
    if let Some(site) = &record.enrichment.website {
        raw.extend(sourced(site.emails.clone(), DataSource::WebsiteScrape));
    }
    if let Some(whois) = &record.enrichment.whois {
        raw.extend(sourced(whois.emails.clone(), DataSource::Whois));
    }

    raw.into_iter()
        .filter_map(|c| {
            normalize_email(&c.value).map(|value| SourcedValue {
                value,
                source: c.source,
            })
        })
        .collect()
}

fn website_candidates(record: &StagingRecord) -> Vec<SourcedValue> {
    let mut candidates = Vec::new();

    if let Some(url) = record.payload.website() {
        if business_domain(url).is_some() {
            candidates.push(SourcedValue {
                value: url.trim().to_string(),
                source: record.payload.listing_source(),
            });
        }
    }
    if let Some(site) = &record.enrichment.website {
        if business_domain(&site.url).is_some() {
            candidates.push(SourcedValue {
                value: site.url.clone(),
                source: DataSource::WebsiteScrape,
            });
        }
    }
    if let Some(whois) = &record.enrichment.whois {
        if business_domain(&whois.domain).is_some() {
            candidates.push(SourcedValue {
                value: format!("https://{}", whois.domain),
                source: DataSource::Whois,
            });
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CnpjCompany, ExtractionConfig, ExtractionRun, InstagramProfile, MapsPlace,
        QualificationFilters, ScrapedContacts, WhoisData,
    };
    use chrono::Utc;
    use uuid::Uuid;

    fn staging(payload: SourcePayload) -> StagingRecord {
        let config = ExtractionConfig {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            name: "t".into(),
            source: payload.source_type(),
            search_term: "padaria".into(),
            location: "sp".into(),
            target_quantity: 10,
            filters: QualificationFilters::default(),
            funnel_id: Uuid::new_v4(),
            column_id: Uuid::new_v4(),
            schedule: None,
            max_pages: None,
            cnpj_filters: None,
        };
        let run = ExtractionRun::new(&config, Utc::now());
        StagingRecord::discovered(&run, payload, "h".into(), Utc::now())
    }

    #[test]
    fn test_cnpj_phone_beats_whois_phone() {
        let mut record = staging(SourcePayload::GoogleMaps(MapsPlace {
            title: "Padaria".into(),
            ..Default::default()
        }));
        record.enrichment.whois = Some(WhoisData {
            domain: "padaria.com.br".into(),
            phones: vec!["(11) 3456-7890".into()],
            ..Default::default()
        });
        record.enrichment.cnpj = Some(CnpjCompany {
            cnpj: "11222333000181".into(),
            phones: vec!["(21) 99876-5432".into()],
            ..Default::default()
        });

        let channels = consolidate(&record);
        let phone = channels.phone.unwrap();
        assert_eq!(phone.source, DataSource::CnpjRegistry);
        assert_eq!(phone.value, "+5521998765432");
    }

    #[test]
    fn test_website_scrape_beats_whois_and_invalid_phones_are_dropped() {
        let mut record = staging(SourcePayload::GoogleMaps(MapsPlace {
            title: "Padaria".into(),
            phone_number: Some("123".into()),
            website: Some("https://padaria.com.br".into()),
            ..Default::default()
        }));
        record.enrichment.website = Some(ScrapedContacts {
            url: "https://padaria.com.br".into(),
            phones: vec!["(11) 98765-4321".into()],
            emails: vec!["contato@padaria.com.br".into()],
            whatsapp: vec![],
        });
        record.enrichment.whois = Some(WhoisData {
            domain: "padaria.com.br".into(),
            phones: vec!["(11) 3456-7890".into()],
            emails: vec!["dono@padaria.com.br".into()],
            ..Default::default()
        });

        let channels = consolidate(&record);
        assert_eq!(channels.phone.unwrap().source, DataSource::WebsiteScrape);
        let email = channels.email.unwrap();
        assert_eq!(email.value, "contato@padaria.com.br");
        assert_eq!(email.source, DataSource::WebsiteScrape);
        assert_eq!(channels.website.unwrap().source, DataSource::GoogleMaps);
    }

    #[test]
    fn test_instagram_bio_contacts_and_blocked_link() {
        let record = staging(SourcePayload::Instagram(InstagramProfile {
            username: "padaria".into(),
            biography: Some("Encomendas (11) 98765-4321 contato@padaria.com.br".into()),
            external_url: Some("https://linktr.ee/padaria".into()),
            profile_url: "https://instagram.com/padaria".into(),
            ..Default::default()
        }));
        let channels = consolidate(&record);
        assert_eq!(channels.phone.unwrap().source, DataSource::Instagram);
        assert_eq!(channels.email.unwrap().source, DataSource::Instagram);
        assert!(channels.website.is_none());
    }

    #[test]
    fn test_priority_table_is_total() {
        for source in PRIORITY {
            assert!(priority(source) < PRIORITY.len());
        }
        assert!(priority(DataSource::CnpjRegistry) < priority(DataSource::WebsiteScrape));
        assert!(priority(DataSource::WebsiteScrape) < priority(DataSource::Whois));
    }
}
