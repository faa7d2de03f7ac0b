//! Contact validation and normalization shared by discovery and enrichment.

use phonenumber::{country::Id as CountryId, Mode};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Domains that are never treated as a company website (social networks,
/// link aggregators, shorteners, marketplaces, messaging links).
pub const BLOCKED_DOMAINS: &[&str] = &[
    // Social networks
    "instagram.com",
    "facebook.com",
    "linkedin.com",
    "twitter.com",
    "x.com",
    "youtube.com",
    "tiktok.com",
    "snapchat.com",
    "threads.net",
    "pinterest.com",
    "reddit.com",
    "tumblr.com",
    "vimeo.com",
    // Link-in-bio aggregators
    "linktr.ee",
    "linktree.com",
    "bio.link",
    "beacons.ai",
    "milkshake.app",
    "hoo.be",
    "solo.to",
    "link.me",
    "tap.bio",
    "taplink.cc",
    "campsite.bio",
    "allmylinks.com",
    "linkpop.com",
    "stan.store",
    "bio.site",
    // Site builders
    "carrd.co",
    "wixsite.com",
    "wordpress.com",
    "blogspot.com",
    "sites.google.com",
    "webnode.page",
    // Messaging
    "wa.me",
    "whatsapp.com",
    "api.whatsapp.com",
    "telegram.me",
    "t.me",
    "discord.gg",
    // Shorteners
    "bit.ly",
    "goo.gl",
    "tinyurl.com",
    "cutt.ly",
    "rebrand.ly",
    // Google services
    "business.google.com",
    "g.page",
    "maps.google.com",
    "forms.gle",
    "docs.google.com",
    "drive.google.com",
    // Marketplaces
    "mercadolivre.com.br",
    "mercadolibre.com",
    "olx.com.br",
    "amazon.com.br",
    "shopee.com.br",
    "ifood.com.br",
    "sympla.com.br",
    // Scheduling and forms
    "calendly.com",
    "typeform.com",
    "jotform.com",
    // Placeholders
    "localhost",
    "example.com",
    "test.com",
];

/// Instagram paths that are not profiles.
const INSTAGRAM_RESERVED_PATHS: &[&str] = &[
    "p", "reel", "reels", "stories", "explore", "accounts", "directory", "about", "legal", "tv",
    "live", "highlights", "guide", "guides", "tagged", "channel", "saved", "api", "developer",
    "help", "privacy", "terms", "press", "jobs", "brand", "blog", "direct", "emails", "settings",
    "session", "login", "challenge", "web", "static", "data", "loc", "locations",
];

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // RFC 5322 simplified: local@domain.tld
    RE.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email regex is valid")
    })
}

fn email_in_text_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}")
            .expect("email search regex is valid")
    })
}

fn phone_in_text_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // (11) 99999-9999, 11 9999-9999, +55 11 99999-9999
    RE.get_or_init(|| {
        Regex::new(r"(?:\+?55[\s.-]?)?\(?\d{2}\)?[\s.-]?\d{4,5}[\s.-]?\d{4}")
            .expect("phone search regex is valid")
    })
}

fn whatsapp_link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:wa\.me/|api\.whatsapp\.com/send\?phone=)(\d{10,13})")
            .expect("whatsapp link regex is valid")
    })
}

fn cnpj_in_text_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{2}\.?\d{3}\.?\d{3}/?\d{4}-?\d{2}").expect("cnpj regex is valid")
    })
}

fn instagram_username_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_.]{1,30}$").expect("username regex is valid"))
}

/// Validates and normalizes a Brazilian phone number to E.164 format.
///
/// Uses the `phonenumber` crate (libphonenumber port) with Brazil as the
/// default region, so local numbers without country code are accepted.
///
/// # Arguments
///
/// * `raw` - The phone number as found in the source.
///
/// # Returns
///
/// * `(bool, String)` - `(true, "+5511987654321")` when valid, `(false, reason)` otherwise.
pub fn validate_br_phone(raw: &str) -> (bool, String) {
    if raw.trim().is_empty() || raw.len() < 8 {
        return (false, "Phone too short".to_string());
    }

    match phonenumber::parse(Some(CountryId::BR), raw) {
        Ok(number) => {
            if phonenumber::is_valid(&number) {
                let formatted = number.format().mode(Mode::E164).to_string();
                tracing::debug!("✓ Valid BR phone: {} → {}", raw, formatted);
                (true, formatted)
            } else {
                tracing::debug!("❌ Invalid BR phone number: {}", raw);
                (false, "Invalid Brazilian phone number".to_string())
            }
        }
        Err(e) => {
            tracing::debug!("❌ Failed to parse BR phone '{}': {:?}", raw, e);
            (false, format!("Parse error: {:?}", e))
        }
    }
}

/// E.164 form of a phone, or `None` when it does not validate.
pub fn normalize_phone(raw: &str) -> Option<String> {
    match validate_br_phone(raw) {
        (true, formatted) => Some(formatted),
        (false, _) => None,
    }
}

/// Validates email format and rejects placeholder patterns.
///
/// Checks for:
/// - Basic email format (contains @ and .)
/// - Fake/placeholder patterns (repeated digits like 9999, 1111)
/// - Valid domain structure
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    let fake_patterns = ["999999", "111111", "000000", "123456789"];
    if let Some(pattern) = fake_patterns.iter().find(|p| email.contains(*p)) {
        tracing::debug!(
            "❌ Invalid email detected (fake pattern '{}'): {}",
            pattern,
            email
        );
        return false;
    }

    email_regex().is_match(email)
}

/// Lowercased, trimmed email when valid.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().trim_end_matches('.').to_lowercase();
    is_valid_email(&email).then_some(email)
}

/// Keeps only the digits of `raw`.
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Checks the two CNPJ verification digits.
pub fn is_valid_cnpj(digits: &str) -> bool {
    let nums: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();
    if nums.len() != 14 || digits.len() != 14 {
        return false;
    }
    if nums.iter().all(|d| *d == nums[0]) {
        return false;
    }

    let check = |len: usize| -> u32 {
        let weights: &[u32] = if len == 12 {
            &[5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2]
        } else {
            &[6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2]
        };
        let sum: u32 = nums[..len].iter().zip(weights).map(|(d, w)| d * w).sum();
        let rest = sum % 11;
        if rest < 2 {
            0
        } else {
            11 - rest
        }
    };

    check(12) == nums[12] && check(13) == nums[13]
}

/// 14-digit CNPJ from any punctuation style, if the check digits hold.
pub fn normalize_cnpj(raw: &str) -> Option<String> {
    let digits = digits_only(raw);
    is_valid_cnpj(&digits).then_some(digits)
}

/// `XX.XXX.XXX/XXXX-XX`
pub fn format_cnpj(digits: &str) -> String {
    if digits.len() != 14 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return digits.to_string();
    }
    format!(
        "{}.{}.{}/{}-{}",
        &digits[0..2],
        &digits[2..5],
        &digits[5..8],
        &digits[8..12],
        &digits[12..14]
    )
}

/// First valid CNPJ mentioned in free text (WHOIS owner document, page footers).
pub fn extract_cnpj_from_text(text: &str) -> Option<String> {
    cnpj_in_text_regex()
        .find_iter(text)
        .find_map(|m| normalize_cnpj(m.as_str()))
}

/// Bare host of a URL: scheme added when missing, `www.` and port dropped, lowercased.
pub fn extract_domain(raw_url: &str) -> Option<String> {
    let trimmed = raw_url.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let parsed = url::Url::parse(&with_scheme).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    host.contains('.').then_some(host)
}

/// True for social, aggregator, messaging, marketplace and government hosts.
pub fn is_blocked_domain(domain: &str) -> bool {
    let domain = domain.to_lowercase();
    if domain.ends_with(".gov") || domain.ends_with(".gov.br") {
        return true;
    }
    BLOCKED_DOMAINS
        .iter()
        .any(|blocked| domain == *blocked || domain.ends_with(&format!(".{}", blocked)))
}

/// Domain worth scraping as a company website, if any.
pub fn business_domain(raw_url: &str) -> Option<String> {
    extract_domain(raw_url).filter(|d| !is_blocked_domain(d))
}

/// WHOIS lookups only cover registro.br domains.
pub fn is_br_domain(domain: &str) -> bool {
    domain.ends_with(".br")
}

/// Trims, drops a leading `@` and lowercases; `None` if not a valid handle.
pub fn normalize_instagram_username(raw: &str) -> Option<String> {
    let username = raw.trim().trim_start_matches('@').to_lowercase();
    if INSTAGRAM_RESERVED_PATHS.contains(&username.as_str()) {
        return None;
    }
    instagram_username_regex()
        .is_match(&username)
        .then_some(username)
}

/// Username from an instagram.com profile, post or stories URL, or from `@handle`.
pub fn extract_instagram_username(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('@') {
        return normalize_instagram_username(trimmed);
    }

    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let parsed = url::Url::parse(&with_scheme).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    if host != "instagram.com" && !host.ends_with(".instagram.com") {
        return None;
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        ["stories", user, ..] => normalize_instagram_username(user),
        [first, ..] => normalize_instagram_username(first),
        [] => None,
    }
}

/// Valid emails found in free text, lowercased, in order of appearance.
pub fn extract_emails(text: &str) -> Vec<String> {
    dedup(
        email_in_text_regex()
            .find_iter(text)
            .filter_map(|m| normalize_email(m.as_str())),
    )
}

/// Brazilian phone numbers found in free text, as digits without the 55 prefix.
pub fn extract_phones(text: &str) -> Vec<String> {
    dedup(
        phone_in_text_regex()
            .find_iter(text)
            .map(|m| digits_only(m.as_str()))
            .filter(|p| (10..=13).contains(&p.len()))
            .map(|p| strip_country_code(&p)),
    )
}

/// Numbers from `wa.me/` and `api.whatsapp.com/send?phone=` links.
pub fn extract_whatsapp_numbers(text: &str) -> Vec<String> {
    dedup(
        whatsapp_link_regex()
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .map(|m| strip_country_code(m.as_str())),
    )
}

fn strip_country_code(digits: &str) -> String {
    match digits.strip_prefix("55") {
        Some(rest) if digits.len() > 11 => rest.to_string(),
        _ => digits.to_string(),
    }
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.filter(|item| seen.insert(item.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cnpj_check_digits() {
        assert!(is_valid_cnpj("11222333000181"));
        assert!(!is_valid_cnpj("11222333000182"));
        assert!(!is_valid_cnpj("11111111111111"));
        assert!(!is_valid_cnpj("1122233300018"));
        assert_eq!(normalize_cnpj("11.222.333/0001-81").as_deref(), Some("11222333000181"));
        assert_eq!(format_cnpj("11222333000181"), "11.222.333/0001-81");
    }

    #[test]
    fn test_extract_cnpj_from_whois_text() {
        let text = "owner: Padaria Pao Quente LTDA\nownerid: 11.222.333/0001-81\ncountry: BR";
        assert_eq!(extract_cnpj_from_text(text).as_deref(), Some("11222333000181"));
        assert_eq!(extract_cnpj_from_text("ownerid: 123.456.789-00"), None);
    }

    #[test]
    fn test_extract_domain_and_blocklist() {
        assert_eq!(
            extract_domain("www.PadariaPaoQuente.com.br/contato").as_deref(),
            Some("padariapaoquente.com.br")
        );
        assert_eq!(extract_domain("not a url"), None);
        assert!(is_blocked_domain("instagram.com"));
        assert!(is_blocked_domain("m.facebook.com"));
        assert!(is_blocked_domain("receita.fazenda.gov.br"));
        assert!(!is_blocked_domain("myfacebook.company.com"));
        assert_eq!(business_domain("https://linktr.ee/padaria"), None);
        assert!(is_br_domain("padaria.com.br"));
        assert!(!is_br_domain("padaria.com"));
    }

    #[test]
    fn test_instagram_usernames() {
        assert_eq!(normalize_instagram_username(" @Padaria.Centro ").as_deref(), Some("padaria.centro"));
        assert_eq!(normalize_instagram_username("explore"), None);
        assert_eq!(normalize_instagram_username("has space"), None);
        assert_eq!(
            extract_instagram_username("https://www.instagram.com/padaria_sp/?hl=pt").as_deref(),
            Some("padaria_sp")
        );
        assert_eq!(
            extract_instagram_username("https://instagram.com/stories/padaria_sp/123").as_deref(),
            Some("padaria_sp")
        );
        assert_eq!(extract_instagram_username("https://instagram.com/p/Cx123/"), None);
        assert_eq!(extract_instagram_username("https://facebook.com/padaria"), None);
    }

    #[test]
    fn test_bio_contact_extraction() {
        let bio = "Pães artesanais 🍞 Pedidos: (11) 98765-4321 | contato@padaria.com.br \
                   wa.me/5511987654321 fake 999999@gmail.com";
        assert_eq!(extract_emails(bio), vec!["contato@padaria.com.br".to_string()]);
        assert!(extract_phones(bio).contains(&"11987654321".to_string()));
        assert_eq!(extract_whatsapp_numbers(bio), vec!["11987654321".to_string()]);
    }

    #[test]
    fn test_email_validation_rejects_placeholders() {
        assert!(is_valid_email("contato@padaria.com.br"));
        assert!(!is_valid_email("1199999999333@gmail.com"));
        assert!(!is_valid_email("no-at-sign.com"));
        assert_eq!(normalize_email(" Contato@Padaria.com.br ").as_deref(), Some("contato@padaria.com.br"));
    }

    #[test]
    fn test_br_phone_normalization() {
        assert_eq!(normalize_phone("(11) 98765-4321").as_deref(), Some("+5511987654321"));
        assert_eq!(normalize_phone("123"), None);
    }
}
