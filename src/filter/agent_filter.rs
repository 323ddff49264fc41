// src/filter/agent_filter.rs
//! Subscription filter expressions
//!
//! An expression is a comma-separated list of terms:
//!
//! ```text
//! campaign=42,exchange=mock|adx,segment!=gambling,host=*.example.com,hour=8-18,requires=exchange
//! ```
//!
//! `key=a|b` admits either value, `key!=v` rejects `v`. Repeating a key
//! accumulates values. The empty expression (or `*`) admits everything.

use crate::events::event::BidRequest;
use crate::utils::errors::{EngineError, Result};
use std::fmt;
use std::str::FromStr;

const ALL_HOURS: u32 = (1u32 << 24) - 1;

/// Allowed and rejected values of one request attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeExclude<T> {
    pub include: Vec<T>,
    pub exclude: Vec<T>,
}

impl<T> Default for IncludeExclude<T> {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl<T: PartialEq> IncludeExclude<T> {
    pub fn is_unconstrained(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Admit a single-valued attribute; `None` only passes an empty include list
    pub fn admits(&self, value: Option<&T>) -> bool {
        match value {
            Some(v) => {
                (self.include.is_empty() || self.include.contains(v)) && !self.exclude.contains(v)
            }
            None => self.include.is_empty(),
        }
    }

    /// Admit a multi-valued attribute: any value included, none excluded
    pub fn admits_any<'a>(&self, values: impl IntoIterator<Item = &'a T> + Clone) -> bool
    where
        T: 'a,
    {
        let included = self.include.is_empty()
            || values.clone().into_iter().any(|v| self.include.contains(v));
        included && !values.into_iter().any(|v| self.exclude.contains(v))
    }
}

/// Parsed subscription filter of one agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentFilter {
    pub campaign: IncludeExclude<u64>,
    pub exchange: IncludeExclude<String>,
    pub segment: IncludeExclude<String>,

    /// Exact hosts or `*.suffix` patterns, lowercased
    pub host: IncludeExclude<String>,

    /// Bitmask of admitted hours of day (UTC); `None` admits all
    pub hours: Option<u32>,

    /// User id domains that must be present
    pub requires: Vec<String>,
}

impl AgentFilter {
    /// Filter admitting every request
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_unconstrained(&self) -> bool {
        *self == Self::default()
    }

    /// Evaluate the filter directly against one request
    pub fn matches(&self, request: &BidRequest) -> bool {
        self.campaign.admits(request.campaign.as_ref())
            && self.exchange.admits(Some(&request.exchange))
            && self.segment.admits_any(request.segments.iter())
            && self.admits_host(request.host().as_deref())
            && self.admits_hour(request.hour_of_week() % 24)
            && self.requires.iter().all(|d| request.user_ids.contains_key(d))
    }

    /// Whether requests from `exchange` can pass the exchange terms
    pub fn admits_exchange(&self, exchange: &str) -> bool {
        self.exchange.admits(Some(&exchange.to_string()))
    }

    pub fn admits_hour(&self, hour_of_day: usize) -> bool {
        self.hours.map(|m| m & (1u32 << hour_of_day) != 0).unwrap_or(true)
    }

    fn admits_host(&self, host: Option<&str>) -> bool {
        let keys = host.map(host_keys).unwrap_or_default();
        self.host.admits_any(keys.iter())
    }

    fn add_term(&mut self, key: &str, negated: bool, values: &str) -> Result<()> {
        let values: Vec<&str> = values.split('|').map(str::trim).collect();
        if values.iter().any(|v| v.is_empty()) {
            return Err(invalid(format!("empty value for '{}'", key)));
        }

        match key {
            "campaign" => {
                let ids = values
                    .iter()
                    .map(|v| v.parse::<u64>().map_err(|_| invalid(format!("bad campaign id '{}'", v))))
                    .collect::<Result<Vec<_>>>()?;
                push(&mut self.campaign, negated, ids);
            }
            "exchange" => push(&mut self.exchange, negated, owned(&values)),
            "segment" => push(&mut self.segment, negated, owned(&values)),
            "host" => push(
                &mut self.host,
                negated,
                values.iter().map(|v| v.to_ascii_lowercase()).collect(),
            ),
            "hour" => {
                let mut mask = 0u32;
                for v in &values {
                    mask |= parse_hours(v)?;
                }
                if negated {
                    mask = !mask & ALL_HOURS;
                }
                self.hours = Some(self.hours.unwrap_or(ALL_HOURS) & mask);
            }
            "requires" => {
                if negated {
                    return Err(invalid("'requires' cannot be negated".into()));
                }
                self.requires.extend(owned(&values));
            }
            other => return Err(invalid(format!("unknown filter key '{}'", other))),
        }
        Ok(())
    }
}

impl FromStr for AgentFilter {
    type Err = EngineError;

    fn from_str(expr: &str) -> Result<Self> {
        let mut filter = AgentFilter::default();

        for term in expr.split(',').map(str::trim).filter(|t| !t.is_empty() && *t != "*") {
            let (key, negated, values) = if let Some((k, v)) = term.split_once("!=") {
                (k, true, v)
            } else if let Some((k, v)) = term.split_once('=') {
                (k, false, v)
            } else {
                return Err(invalid(format!("term '{}' has no '='", term)));
            };
            filter.add_term(key.trim(), negated, values)?;
        }

        Ok(filter)
    }
}

impl fmt::Display for AgentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut terms = Vec::new();
        render(&mut terms, "campaign", &self.campaign);
        render(&mut terms, "exchange", &self.exchange);
        render(&mut terms, "segment", &self.segment);
        render(&mut terms, "host", &self.host);
        if let Some(mask) = self.hours {
            let hours: Vec<String> = (0..24u32)
                .filter(|h| mask & (1u32 << *h) != 0)
                .map(|h| h.to_string())
                .collect();
            terms.push(format!("hour={}", hours.join("|")));
        }
        if !self.requires.is_empty() {
            terms.push(format!("requires={}", self.requires.join("|")));
        }

        if terms.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", terms.join(","))
        }
    }
}

/// Lookup keys for a host: the host itself and each `*.suffix` above it
pub fn host_keys(host: &str) -> Vec<String> {
    let mut keys = vec![host.to_string()];
    let mut rest = host;
    while let Some((_, suffix)) = rest.split_once('.') {
        keys.push(format!("*.{}", suffix));
        rest = suffix;
    }
    keys
}

fn parse_hours(value: &str) -> Result<u32> {
    let parse = |s: &str| -> Result<u32> {
        match s.trim().parse::<u32>() {
            Ok(h) if h < 24 => Ok(h),
            _ => Err(invalid(format!("bad hour '{}'", s))),
        }
    };

    let (start, end) = match value.split_once('-') {
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let h = parse(value)?;
            (h, h)
        }
    };

    if start > end {
        return Err(invalid(format!("hour range '{}' is reversed", value)));
    }
    Ok((start..=end).fold(0u32, |mask, h| mask | (1u32 << h)))
}

fn push<T>(set: &mut IncludeExclude<T>, negated: bool, values: Vec<T>) {
    if negated {
        set.exclude.extend(values);
    } else {
        set.include.extend(values);
    }
}

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn render<T: fmt::Display>(terms: &mut Vec<String>, key: &str, set: &IncludeExclude<T>) {
    let join = |values: &[T]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("|");
    if !set.include.is_empty() {
        terms.push(format!("{}={}", key, join(&set.include)));
    }
    if !set.exclude.is_empty() {
        terms.push(format!("{}!={}", key, join(&set.exclude)));
    }
}

fn invalid(message: String) -> EngineError {
    EngineError::Config(format!("invalid filter: {}", message))
}
