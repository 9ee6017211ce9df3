//! Targeting rule set and the matcher that scores a visitor against it.
//!
//! Every dimension is a tagged variant with an explicit "any" case. An
//! unconstrained dimension neither blocks eligibility nor lowers the match
//! fraction. Configured dimensions combine with a hard AND for eligibility.

use crate::context::{Browser, DeviceType, Os, VisitorContext};
use chrono::{Datelike, Timelike, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A set constraint over one context attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", content = "values", rename_all = "snake_case")]
pub enum Constraint<T> {
    Any,
    OneOf(Vec<T>),
}

impl<T> Default for Constraint<T> {
    fn default() -> Self {
        Self::Any
    }
}

impl<T> Constraint<T> {
    /// An empty set counts as unconstrained.
    pub fn is_configured(&self) -> bool {
        matches!(self, Self::OneOf(values) if !values.is_empty())
    }
}

impl<T: PartialEq> Constraint<T> {
    /// `None` when unconstrained (an empty set counts as unconstrained).
    fn evaluate(&self, value: &T) -> Option<bool> {
        match self {
            Self::OneOf(values) if !values.is_empty() => Some(values.contains(value)),
            _ => None,
        }
    }
}

impl Constraint<String> {
    fn evaluate_text(&self, value: Option<&str>) -> Option<bool> {
        match self {
            Self::OneOf(values) if !values.is_empty() => Some(value.map_or(false, |v| {
                values.iter().any(|allowed| allowed.trim().eq_ignore_ascii_case(v))
            })),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GeoRule {
    #[default]
    Any,
    /// Each non-empty list must contain the visitor's value.
    Within {
        #[serde(default)]
        countries: Vec<String>,
        #[serde(default)]
        regions: Vec<String>,
        #[serde(default)]
        cities: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScheduleRule {
    #[default]
    Any,
    /// Allowed local hours (0–23) and weekdays, evaluated in `timezone`.
    /// An empty list leaves that part open.
    Window {
        #[serde(default = "default_timezone")]
        timezone: Tz,
        #[serde(default)]
        hours: Vec<u8>,
        #[serde(default)]
        days: Vec<Weekday>,
    },
}

impl GeoRule {
    pub fn is_configured(&self) -> bool {
        match self {
            Self::Any => false,
            Self::Within {
                countries,
                regions,
                cities,
            } => !(countries.is_empty() && regions.is_empty() && cities.is_empty()),
        }
    }
}

impl ScheduleRule {
    pub fn is_configured(&self) -> bool {
        match self {
            Self::Any => false,
            Self::Window { hours, days, .. } => !(hours.is_empty() && days.is_empty()),
        }
    }
}

fn default_timezone() -> Tz {
    Tz::UTC
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TargetingRules {
    #[serde(default)]
    pub device: Constraint<DeviceType>,
    #[serde(default)]
    pub geo: GeoRule,
    #[serde(default)]
    pub browser: Constraint<Browser>,
    #[serde(default)]
    pub os: Constraint<Os>,
    #[serde(default)]
    pub language: Constraint<String>,
    #[serde(default)]
    pub schedule: ScheduleRule,
}

/// Outcome of matching a rule set against a visitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetingMatch {
    pub eligible: bool,
    /// Matched / configured dimensions; `1.0` when nothing is configured.
    pub fraction: f64,
}

impl TargetingRules {
    /// Per-dimension outcomes; `None` marks an unconfigured dimension.
    fn outcomes(&self, ctx: &VisitorContext) -> [Option<bool>; 6] {
        [
            self.device.evaluate(&ctx.device),
            evaluate_geo(&self.geo, ctx),
            self.browser.evaluate(&ctx.browser),
            self.os.evaluate(&ctx.os),
            self.language.evaluate_text(ctx.language.as_deref()),
            evaluate_schedule(&self.schedule, ctx),
        ]
    }

    pub fn configured_dimensions(&self) -> usize {
        [
            self.device.is_configured(),
            self.geo.is_configured(),
            self.browser.is_configured(),
            self.os.is_configured(),
            self.language.is_configured(),
            self.schedule.is_configured(),
        ]
        .into_iter()
        .filter(|configured| *configured)
        .count()
    }

    pub fn matches(&self, ctx: &VisitorContext) -> TargetingMatch {
        let outcomes = self.outcomes(ctx);
        let configured = outcomes.iter().flatten().count();
        if configured == 0 {
            return TargetingMatch {
                eligible: true,
                fraction: 1.0,
            };
        }
        let matched = outcomes.iter().flatten().filter(|hit| **hit).count();
        TargetingMatch {
            eligible: matched == configured,
            fraction: matched as f64 / configured as f64,
        }
    }
}

fn in_list(list: &[String], value: Option<&str>) -> Option<bool> {
    if list.is_empty() {
        return None;
    }
    Some(value.map_or(false, |v| {
        list.iter().any(|allowed| allowed.trim().eq_ignore_ascii_case(v.trim()))
    }))
}

fn evaluate_geo(rule: &GeoRule, ctx: &VisitorContext) -> Option<bool> {
    let GeoRule::Within {
        countries,
        regions,
        cities,
    } = rule
    else {
        return None;
    };
    let checks = [
        in_list(countries, ctx.geo.country.as_deref()),
        in_list(regions, ctx.geo.region.as_deref()),
        in_list(cities, ctx.geo.city.as_deref()),
    ];
    let mut configured = checks.iter().flatten().peekable();
    configured.peek()?;
    Some(configured.all(|hit| *hit))
}

fn evaluate_schedule(rule: &ScheduleRule, ctx: &VisitorContext) -> Option<bool> {
    let ScheduleRule::Window {
        timezone,
        hours,
        days,
    } = rule
    else {
        return None;
    };
    if hours.is_empty() && days.is_empty() {
        return None;
    }
    let local = ctx.now.with_timezone(timezone);
    let hour_ok = hours.is_empty() || hours.iter().any(|h| u32::from(*h) == local.hour());
    let day_ok = days.is_empty() || days.contains(&local.weekday());
    Some(hour_ok && day_ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GeoLocation;
    use chrono::{TimeZone, Utc};

    fn mobile_us_visitor() -> VisitorContext {
        let mut ctx = VisitorContext::anonymous(Utc.with_ymd_and_hms(2024, 3, 4, 15, 30, 0).unwrap());
        ctx.device = DeviceType::Mobile;
        ctx.os = Os::Ios;
        ctx.browser = Browser::Safari;
        ctx.language = Some("en".to_string());
        ctx.geo = GeoLocation {
            country: Some("US".to_string()),
            region: Some("CA".to_string()),
            city: Some("San Francisco".to_string()),
        };
        ctx
    }

    #[test]
    fn test_unconstrained_is_full_match() {
        let rules = TargetingRules::default();
        assert_eq!(rules.configured_dimensions(), 0);
        for ctx in [mobile_us_visitor(), VisitorContext::anonymous(Utc::now())] {
            let m = rules.matches(&ctx);
            assert!(m.eligible);
            assert_eq!(m.fraction, 1.0);
        }
    }

    #[test]
    fn test_all_configured_dimensions_must_match() {
        let rules = TargetingRules {
            device: Constraint::OneOf(vec![DeviceType::Mobile]),
            os: Constraint::OneOf(vec![Os::Android]),
            ..Default::default()
        };
        let m = rules.matches(&mobile_us_visitor());
        assert!(!m.eligible);
        assert_eq!(m.fraction, 0.5);
    }

    #[test]
    fn test_empty_set_is_unconstrained() {
        let rules = TargetingRules {
            browser: Constraint::OneOf(vec![]),
            language: Constraint::OneOf(vec!["EN".to_string()]),
            ..Default::default()
        };
        assert_eq!(rules.configured_dimensions(), 1);
        let m = rules.matches(&mobile_us_visitor());
        assert!(m.eligible);
        assert_eq!(m.fraction, 1.0);
    }

    #[test]
    fn test_geo_requires_every_listed_level() {
        let rules = TargetingRules {
            geo: GeoRule::Within {
                countries: vec!["us".to_string()],
                regions: vec!["NY".to_string()],
                cities: vec![],
            },
            ..Default::default()
        };
        assert!(!rules.matches(&mobile_us_visitor()).eligible);

        let rules = TargetingRules {
            geo: GeoRule::Within {
                countries: vec!["us".to_string()],
                regions: vec![],
                cities: vec!["san francisco".to_string()],
            },
            ..Default::default()
        };
        assert!(rules.matches(&mobile_us_visitor()).eligible);

        // Unknown visitor geo never satisfies a geo constraint.
        assert!(!rules.matches(&VisitorContext::anonymous(Utc::now())).eligible);
    }

    #[test]
    fn test_schedule_uses_rule_timezone() {
        // 15:30 UTC on a Monday is 10:30 in New York (EST, UTC-5).
        let rules = TargetingRules {
            schedule: ScheduleRule::Window {
                timezone: chrono_tz::America::New_York,
                hours: vec![9, 10, 11],
                days: vec![Weekday::Mon],
            },
            ..Default::default()
        };
        assert!(rules.matches(&mobile_us_visitor()).eligible);

        let utc_rules = TargetingRules {
            schedule: ScheduleRule::Window {
                timezone: Tz::UTC,
                hours: vec![9, 10, 11],
                days: vec![],
            },
            ..Default::default()
        };
        assert!(!utc_rules.matches(&mobile_us_visitor()).eligible);
    }

    #[test]
    fn test_empty_lists_are_not_configured() {
        let rules = TargetingRules {
            device: Constraint::OneOf(vec![]),
            geo: GeoRule::Within {
                countries: vec![],
                regions: vec![],
                cities: vec!["Berlin".to_string()],
            },
            schedule: ScheduleRule::Window {
                timezone: Tz::UTC,
                hours: vec![],
                days: vec![],
            },
            ..Default::default()
        };
        assert_eq!(rules.configured_dimensions(), 1);
        // Only the city list counts, and the visitor is elsewhere.
        let m = rules.matches(&mobile_us_visitor());
        assert!(!m.eligible);
        assert_eq!(m.fraction, 0.0);
    }

    #[test]
    fn test_schedule_day_rolls_over_in_timezone() {
        // 15:30 UTC Monday is already Tuesday 00:30 in Tokyo.
        let rules = TargetingRules {
            schedule: ScheduleRule::Window {
                timezone: chrono_tz::Asia::Tokyo,
                hours: vec![],
                days: vec![Weekday::Tue],
            },
            ..Default::default()
        };
        assert!(rules.matches(&mobile_us_visitor()).eligible);
    }

    #[test]
    fn test_partial_fraction_counts_only_configured() {
        let rules = TargetingRules {
            device: Constraint::OneOf(vec![DeviceType::Mobile]),
            browser: Constraint::OneOf(vec![Browser::Chrome]),
            os: Constraint::OneOf(vec![Os::Ios]),
            language: Constraint::OneOf(vec!["de".to_string()]),
            ..Default::default()
        };
        let m = rules.matches(&mobile_us_visitor());
        assert!(!m.eligible);
        assert_eq!(m.fraction, 0.5);
    }

    #[test]
    fn test_rules_deserialize_from_stored_json() {
        let json = r#"{
            "device": {"mode": "one_of", "values": ["mobile", "tablet"]},
            "geo": {"mode": "within", "countries": ["US"]},
            "schedule": {"mode": "window", "timezone": "Europe/Berlin", "hours": [8, 9], "days": ["Mon", "Tue"]}
        }"#;
        let rules: TargetingRules = serde_json::from_str(json).unwrap();
        assert_eq!(rules.configured_dimensions(), 3);
        assert_eq!(rules.browser, Constraint::Any);
        match rules.schedule {
            ScheduleRule::Window { timezone, .. } => assert_eq!(timezone, chrono_tz::Europe::Berlin),
            ScheduleRule::Any => panic!("expected a schedule window"),
        }
    }
}
