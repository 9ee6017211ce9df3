//! Per-request visitor context: derived from the user agent, client IP and
//! request headers. Ephemeral; only its digest is persisted.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Windows,
    MacOs,
    Linux,
    Android,
    Ios,
    ChromeOs,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Browser {
    Chrome,
    Firefox,
    Safari,
    Edge,
    Opera,
    SamsungInternet,
    InternetExplorer,
    #[default]
    Other,
}

/// Coarse, IP-derived location. Countries are ISO 3166-1 alpha-2, upper case.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeoLocation {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

impl GeoLocation {
    /// Fill unset fields from `other`.
    fn or(mut self, other: GeoLocation) -> Self {
        self.country = self.country.or(other.country);
        self.region = self.region.or(other.region);
        self.city = self.city.or(other.city);
        self
    }

    fn normalized(mut self) -> Self {
        self.country = non_empty(self.country).map(|c| c.to_ascii_uppercase());
        self.region = non_empty(self.region);
        self.city = non_empty(self.city);
        self
    }
}

/// IP → coarse geo lookup.
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Option<GeoLocation>;
}

/// Resolver for deployments without a geo database.
pub struct NoGeoResolver;

impl GeoResolver for NoGeoResolver {
    fn resolve(&self, _ip: IpAddr) -> Option<GeoLocation> {
        None
    }
}

/// Raw request facts the context is derived from.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub user_agent: Option<String>,
    pub ip: Option<IpAddr>,
    pub accept_language: Option<String>,
    /// Geo supplied by an upstream CDN; wins over the resolver.
    pub geo_hint: GeoLocation,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VisitorContext {
    pub device: DeviceType,
    pub os: Os,
    pub browser: Browser,
    pub geo: GeoLocation,
    pub language: Option<String>,
    pub ip: Option<IpAddr>,
    pub now: DateTime<Utc>,
}

impl VisitorContext {
    /// A context carrying nothing but the clock.
    pub fn anonymous(now: DateTime<Utc>) -> Self {
        Self {
            device: DeviceType::Unknown,
            os: Os::Other,
            browser: Browser::Other,
            geo: GeoLocation::default(),
            language: None,
            ip: None,
            now,
        }
    }

    pub fn resolve(meta: &RequestMeta, geo: &dyn GeoResolver, now: DateTime<Utc>) -> Self {
        let ua = meta.user_agent.as_deref().unwrap_or_default();
        let looked_up = meta.ip.and_then(|ip| geo.resolve(ip)).unwrap_or_default();

        Self {
            device: parse_device(ua),
            os: parse_os(ua),
            browser: parse_browser(ua),
            geo: meta.geo_hint.clone().or(looked_up).normalized(),
            language: meta.accept_language.as_deref().and_then(primary_language),
            ip: meta.ip,
            now,
        }
    }

    /// Apply client-supplied context. Unknown keys and unparseable values
    /// are ignored.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, String>) {
        for (key, value) in overrides {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                "device" => {
                    if let Some(device) = parse_keyword(value) {
                        self.device = device;
                    }
                }
                "os" => {
                    if let Some(os) = parse_keyword(value) {
                        self.os = os;
                    }
                }
                "browser" => {
                    if let Some(browser) = parse_keyword(value) {
                        self.browser = browser;
                    }
                }
                "country" => self.geo.country = Some(value.to_ascii_uppercase()),
                "region" => self.geo.region = Some(value.to_string()),
                "city" => self.geo.city = Some(value.to_string()),
                "language" => self.language = primary_language(value),
                _ => {}
            }
        }
    }

    /// Stable SHA-256 digest stored with delivery events. The IP is reduced
    /// to its network prefix first.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        let fields = [
            keyword(&self.device),
            keyword(&self.os),
            keyword(&self.browser),
            self.geo.country.clone().unwrap_or_default(),
            self.geo.region.clone().unwrap_or_default(),
            self.geo.city.clone().unwrap_or_default(),
            self.language.clone().unwrap_or_default(),
            self.ip.map(network_prefix).unwrap_or_default(),
        ];
        for field in fields {
            hasher.update(field.as_bytes());
            hasher.update(b"|");
        }
        hex::encode(hasher.finalize())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_keyword<T: DeserializeOwned>(value: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase())).ok()
}

fn keyword<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

fn network_prefix(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.0/24")
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}::/48", s[0], s[1], s[2])
        }
    }
}

/// Primary subtag of the highest-priority language in an `Accept-Language`
/// header, lower-cased (`"de-DE,de;q=0.9"` → `"de"`).
pub fn primary_language(header: &str) -> Option<String> {
    let mut best: Option<(f32, &str)> = None;
    for part in header.split(',') {
        let mut pieces = part.trim().split(';');
        let tag = pieces.next().unwrap_or_default().trim();
        if tag.is_empty() || tag == "*" {
            continue;
        }
        let quality = pieces
            .find_map(|p| p.trim().strip_prefix("q="))
            .and_then(|q| q.parse::<f32>().ok())
            .unwrap_or(1.0);
        if best.map_or(true, |(q, _)| quality > q) {
            best = Some((quality, tag));
        }
    }
    best.and_then(|(_, tag)| tag.split(['-', '_']).next())
        .map(|primary| primary.to_ascii_lowercase())
}

pub fn parse_device(ua: &str) -> DeviceType {
    if ua.trim().is_empty() {
        return DeviceType::Unknown;
    }
    let is_android = ua.contains("Android");
    if ua.contains("iPad") || ua.contains("Tablet") || (is_android && !ua.contains("Mobile")) {
        DeviceType::Tablet
    } else if ua.contains("Mobi") || ua.contains("iPhone") || ua.contains("iPod") || is_android {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    }
}

pub fn parse_os(ua: &str) -> Os {
    // iOS agents also claim "like Mac OS X" and Android agents claim Linux.
    if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        Os::Ios
    } else if ua.contains("Android") {
        Os::Android
    } else if ua.contains("Windows") {
        Os::Windows
    } else if ua.contains("CrOS") {
        Os::ChromeOs
    } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        Os::MacOs
    } else if ua.contains("Linux") {
        Os::Linux
    } else {
        Os::Other
    }
}

pub fn parse_browser(ua: &str) -> Browser {
    // Order matters: most engines also advertise Chrome and Safari tokens.
    if ua.contains("Edg/") || ua.contains("Edge/") || ua.contains("EdgiOS") {
        Browser::Edge
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        Browser::Opera
    } else if ua.contains("SamsungBrowser") {
        Browser::SamsungInternet
    } else if ua.contains("Firefox/") || ua.contains("FxiOS") {
        Browser::Firefox
    } else if ua.contains("Chrome/") || ua.contains("CriOS") {
        Browser::Chrome
    } else if ua.contains("Safari/") {
        Browser::Safari
    } else if ua.contains("MSIE") || ua.contains("Trident/") {
        Browser::InternetExplorer
    } else {
        Browser::Other
    }
}
