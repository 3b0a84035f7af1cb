use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of pageviews accepted in one `POST /count` request.
pub const MAX_HITS_PER_REQUEST: usize = 100;

/// Body of `POST /count`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CountRequest {
    /// Don't try to group pageviews into sessions; every pageview counts as a visit.
    pub no_sessions: bool,
    pub hits: Vec<CountHit>,
}

/// One pageview or event as submitted by an API client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CountHit {
    /// Path of the pageview, or the event name.
    pub path: String,
    pub title: String,
    pub event: bool,
    /// Referrer: a URL (the `Referer` header) or any free-form string.
    #[serde(rename = "ref")]
    pub referrer: String,
    /// Screen size as `[width, height, scaling]`.
    pub size: Vec<f64>,
    /// Query string of the pageview; campaign parameters are read from it.
    pub query: String,
    /// Bot hint from the client script. The server stores it as-is.
    pub bot: i32,
    /// `User-Agent` header.
    pub browser: String,
    /// ISO-3166-1 alpha-2 country code.
    pub location: String,
    /// Client IP; only used to derive a session, never stored.
    pub ip: String,
    /// When the pageview happened; may be in the past but not in the future.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Client-managed session identifier; used for grouping only, never stored.
    pub session: String,
}

/// How the referrer of a hit was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefScheme {
    /// An http(s) URL, stored without its scheme.
    #[serde(rename = "h")]
    Http,
    /// Any other free-form referrer value.
    #[serde(rename = "o")]
    Other,
    /// Generated by the server.
    #[serde(rename = "g")]
    Generated,
    /// Taken from a campaign parameter in the query string.
    #[serde(rename = "c")]
    Campaign,
}

impl RefScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            RefScheme::Http => "h",
            RefScheme::Other => "o",
            RefScheme::Generated => "g",
            RefScheme::Campaign => "c",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "h" => Some(RefScheme::Http),
            "o" => Some(RefScheme::Other),
            "g" => Some(RefScheme::Generated),
            "c" => Some(RefScheme::Campaign),
            _ => None,
        }
    }
}

/// Query parameters that carry a campaign name, in priority order.
const CAMPAIGN_PARAMS: [&str; 3] = ["utm_source", "ref", "src"];

/// A normalized pageview, as buffered and stored.
///
/// The client IP and session token never make it into this struct; they are
/// consumed by the session resolver and only the opaque `session` number and
/// the `first_visit` flag remain.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub website_id: String,
    pub path: String,
    pub title: String,
    pub event: bool,
    pub referrer: String,
    pub ref_scheme: Option<RefScheme>,
    /// `"width,height,scaling"`, or empty.
    pub size: String,
    pub query: String,
    pub bot: i32,
    pub browser: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
    /// Opaque session number, assigned by the memstore.
    pub session: Option<i64>,
    pub first_visit: bool,
}

impl Hit {
    /// Build a hit from a submitted record. `now` is used when the record
    /// carries no timestamp.
    pub fn from_count(website_id: &str, count: &CountHit, now: DateTime<Utc>) -> Self {
        let mut hit = Self {
            website_id: website_id.to_string(),
            path: count.path.clone(),
            title: count.title.clone(),
            event: count.event,
            referrer: count.referrer.clone(),
            ref_scheme: None,
            size: format_size(&count.size),
            query: count.query.clone(),
            bot: count.bot,
            browser: count.browser.clone(),
            location: count.location.clone(),
            created_at: count.created_at.unwrap_or(now),
            session: None,
            first_visit: false,
        };
        hit.defaults();
        hit
    }

    /// Normalize fields in place: trim, derive the referrer scheme, and
    /// truncate the timestamp to whole seconds.
    pub fn defaults(&mut self) {
        self.path = self.path.trim().to_string();
        if self.event {
            self.path = self.path.trim_start_matches('/').to_string();
        }
        self.title = self.title.trim().to_string();
        self.location = self.location.trim().to_ascii_uppercase();
        self.created_at = self.created_at.trunc_subsecs(0);
        if self.ref_scheme.is_none() {
            self.derive_referrer();
        }
    }

    fn derive_referrer(&mut self) {
        let referrer = self.referrer.trim();
        if referrer.is_empty() {
            match campaign_from_query(&self.query) {
                Some(campaign) => {
                    self.referrer = campaign;
                    self.ref_scheme = Some(RefScheme::Campaign);
                }
                None => {
                    self.referrer.clear();
                    self.ref_scheme = None;
                }
            }
            return;
        }

        match url::Url::parse(referrer) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                let host = parsed.host_str().unwrap_or_default();
                let mut stripped = format!("{host}{}", parsed.path());
                if let Some(q) = parsed.query() {
                    stripped.push('?');
                    stripped.push_str(q);
                }
                self.referrer = stripped.trim_end_matches('/').to_string();
                self.ref_scheme = Some(RefScheme::Http);
            }
            _ => {
                self.referrer = referrer.to_string();
                self.ref_scheme = Some(RefScheme::Other);
            }
        }
    }

    /// Check the hit against the server clock.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let mut v = ValidationError::default();
        if self.path.is_empty() {
            v.add("path", "must be set");
        }
        if self.created_at > now {
            v.add("created_at", "in the future");
        }
        if self.bot < 0 {
            v.add("bot", "must be zero or positive");
        }
        if !self.location.is_empty()
            && !(self.location.len() == 2 && self.location.chars().all(|c| c.is_ascii_alphabetic()))
        {
            v.add("location", "must be a two-letter code");
        }

        if v.is_empty() {
            Ok(())
        } else {
            Err(v)
        }
    }
}

fn campaign_from_query(query: &str) -> Option<String> {
    let query = query.trim().trim_start_matches('?');
    if query.is_empty() {
        return None;
    }
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    CAMPAIGN_PARAMS.iter().find_map(|name| {
        pairs
            .iter()
            .find(|(k, v)| k == name && !v.trim().is_empty())
            .map(|(_, v)| v.trim().to_string())
    })
}

fn format_size(size: &[f64]) -> String {
    size.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a stored `"w,h,scale"` size back into numbers. Unparseable parts are skipped.
pub fn parse_size(size: &str) -> Vec<f64> {
    size.split(',')
        .filter_map(|part| part.trim().parse::<f64>().ok())
        .collect()
}

/// Field-level validation failures for a single hit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    problems: Vec<(&'static str, String)>,
}

impl ValidationError {
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.problems.push((field, message.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.problems.iter().any(|(f, _)| *f == field)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .problems
            .iter()
            .map(|(field, msg)| format!("{field}: {msg}"))
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 6, 18, 14, 42, 0)
            .single()
            .expect("valid date")
    }

    fn count(path: &str) -> CountHit {
        CountHit {
            path: path.to_string(),
            ..CountHit::default()
        }
    }

    #[test]
    fn missing_created_at_defaults_to_now() {
        let hit = Hit::from_count("site_test", &count("/foo"), now());
        assert_eq!(hit.created_at, now());
        assert!(hit.validate(now()).is_ok());
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let mut c = count("/");
        c.created_at = Some(now() + Duration::minutes(5));
        let hit = Hit::from_count("site_test", &c, now());
        let err = hit.validate(now()).expect_err("future hit must fail");
        assert!(err.has_field("created_at"));
        assert_eq!(err.to_string(), "created_at: in the future");
    }

    #[test]
    fn empty_path_and_bad_location_are_both_reported() {
        let mut c = count("   ");
        c.location = "NLD".to_string();
        let hit = Hit::from_count("site_test", &c, now());
        let err = hit.validate(now()).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "path: must be set; location: must be a two-letter code"
        );
    }

    #[test]
    fn subsecond_precision_is_dropped() {
        let mut c = count("/foo");
        c.created_at = Some(now() - Duration::milliseconds(1500));
        let hit = Hit::from_count("site_test", &c, now());
        assert_eq!(hit.created_at, now() - Duration::seconds(2));
    }

    #[test]
    fn http_referrer_is_stored_without_scheme() {
        let mut c = count("/foo");
        c.referrer = "https://news.example.com/item/".to_string();
        let hit = Hit::from_count("site_test", &c, now());
        assert_eq!(hit.referrer, "news.example.com/item");
        assert_eq!(hit.ref_scheme, Some(RefScheme::Http));
    }

    #[test]
    fn campaign_is_read_from_query_when_referrer_is_empty() {
        let mut c = count("/foo");
        c.query = "?utm_source=newsletter&x=1".to_string();
        let hit = Hit::from_count("site_test", &c, now());
        assert_eq!(hit.referrer, "newsletter");
        assert_eq!(hit.ref_scheme, Some(RefScheme::Campaign));
    }

    #[test]
    fn free_form_referrer_is_other() {
        let mut c = count("/foo");
        c.referrer = "my app".to_string();
        let hit = Hit::from_count("site_test", &c, now());
        assert_eq!(hit.ref_scheme, Some(RefScheme::Other));
    }

    #[test]
    fn event_names_lose_leading_slash() {
        let mut c = count("/signup-click");
        c.event = true;
        let hit = Hit::from_count("site_test", &c, now());
        assert_eq!(hit.path, "signup-click");
    }

    #[test]
    fn size_round_trips_through_string_form() {
        let mut c = count("/foo");
        c.size = vec![1920.0, 1080.0, 1.5];
        let hit = Hit::from_count("site_test", &c, now());
        assert_eq!(hit.size, "1920,1080,1.5");
        assert_eq!(parse_size(&hit.size), vec![1920.0, 1080.0, 1.5]);
    }
}
