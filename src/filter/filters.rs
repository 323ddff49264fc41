// src/filter/filters.rs
//! Builtin bid request filters
//!
//! Each filter indexes the agents' subscription terms by request attribute
//! value, so evaluating a request costs a few map lookups and bitset
//! operations regardless of how many agents are registered.

use crate::events::event::BidRequest;
use crate::filter::agent_filter::{host_keys, AgentFilter, IncludeExclude};
use crate::filter::config_set::ConfigSet;
use std::collections::HashMap;
use std::hash::Hash;

const HOURS_PER_WEEK: usize = 7 * 24;

/// Evaluation order of the builtin filters, lowest first
pub mod priority {
    pub const CAMPAIGN: u32 = 0x1000;
    pub const REQUIRED_IDS: u32 = 0x3000;
    pub const HOUR_OF_WEEK: u32 = 0x4000;
    pub const EXCHANGE_NAME: u32 = 0x5000;
    pub const SEGMENTS: u32 = 0x8000;
    pub const HOST: u32 = 0x8500;
}

/// One stage of request classification
pub trait BidFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower runs earlier; cheap and selective filters go first
    fn priority(&self) -> u32;

    fn add_agent(&mut self, slot: usize, filter: &AgentFilter);

    fn remove_agent(&mut self, slot: usize);

    /// Narrow `candidates` to the slots admitting `request`
    fn filter(&self, request: &BidRequest, candidates: &mut ConfigSet);
}

/// Every builtin filter, in no particular order
pub fn builtin() -> Vec<Box<dyn BidFilter>> {
    vec![
        Box::new(KeyedFilter::new("campaign", priority::CAMPAIGN, campaign_terms, campaign_keys)),
        Box::new(RequiredIdsFilter::default()),
        Box::new(HourOfWeekFilter::new()),
        Box::new(KeyedFilter::new("exchange", priority::EXCHANGE_NAME, exchange_terms, exchange_keys)),
        Box::new(KeyedFilter::new("segments", priority::SEGMENTS, segment_terms, segment_keys)),
        Box::new(KeyedFilter::new("host", priority::HOST, host_terms, host_request_keys)),
    ]
}

/// Include/exclude filter over one keyed request attribute
pub struct KeyedFilter<K> {
    name: &'static str,
    priority: u32,
    terms: fn(&AgentFilter) -> &IncludeExclude<K>,
    keys: fn(&BidRequest) -> Vec<K>,

    /// Agents without an include list
    unconstrained: ConfigSet,
    includes: HashMap<K, ConfigSet>,
    excludes: HashMap<K, ConfigSet>,
}

impl<K: Hash + Eq + Clone> KeyedFilter<K> {
    pub fn new(
        name: &'static str,
        priority: u32,
        terms: fn(&AgentFilter) -> &IncludeExclude<K>,
        keys: fn(&BidRequest) -> Vec<K>,
    ) -> Self {
        Self {
            name,
            priority,
            terms,
            keys,
            unconstrained: ConfigSet::new(),
            includes: HashMap::new(),
            excludes: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq + Clone + Send + Sync> BidFilter for KeyedFilter<K> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn add_agent(&mut self, slot: usize, filter: &AgentFilter) {
        let terms = (self.terms)(filter);

        if terms.include.is_empty() {
            self.unconstrained.set(slot);
        }
        for key in &terms.include {
            self.includes.entry(key.clone()).or_default().set(slot);
        }
        for key in &terms.exclude {
            self.excludes.entry(key.clone()).or_default().set(slot);
        }
    }

    fn remove_agent(&mut self, slot: usize) {
        self.unconstrained.reset(slot);
        for index in [&mut self.includes, &mut self.excludes] {
            index.values_mut().for_each(|set| set.reset(slot));
            index.retain(|_, set| !set.is_empty());
        }
    }

    fn filter(&self, request: &BidRequest, candidates: &mut ConfigSet) {
        let keys = (self.keys)(request);

        let mut admitted = self.unconstrained.clone();
        for key in &keys {
            if let Some(set) = self.includes.get(key) {
                admitted |= set;
            }
        }
        for key in &keys {
            if let Some(set) = self.excludes.get(key) {
                admitted.subtract(set);
            }
        }

        *candidates &= &admitted;
    }
}

/// Hour-of-week admission; hour terms apply to every day
pub struct HourOfWeekFilter {
    by_hour: Vec<ConfigSet>,
}

impl HourOfWeekFilter {
    pub fn new() -> Self {
        Self {
            by_hour: vec![ConfigSet::new(); HOURS_PER_WEEK],
        }
    }
}

impl Default for HourOfWeekFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BidFilter for HourOfWeekFilter {
    fn name(&self) -> &'static str {
        "hour_of_week"
    }

    fn priority(&self) -> u32 {
        priority::HOUR_OF_WEEK
    }

    fn add_agent(&mut self, slot: usize, filter: &AgentFilter) {
        for (hour, set) in self.by_hour.iter_mut().enumerate() {
            if filter.admits_hour(hour % 24) {
                set.set(slot);
            }
        }
    }

    fn remove_agent(&mut self, slot: usize) {
        self.by_hour.iter_mut().for_each(|set| set.reset(slot));
    }

    fn filter(&self, request: &BidRequest, candidates: &mut ConfigSet) {
        match self.by_hour.get(request.hour_of_week()) {
            Some(set) => *candidates &= set,
            None => candidates.clear(),
        }
    }
}

/// Rejects agents whose required user id domains are missing
#[derive(Default)]
pub struct RequiredIdsFilter {
    required: HashMap<usize, Vec<String>>,
}

impl BidFilter for RequiredIdsFilter {
    fn name(&self) -> &'static str {
        "required_ids"
    }

    fn priority(&self) -> u32 {
        priority::REQUIRED_IDS
    }

    fn add_agent(&mut self, slot: usize, filter: &AgentFilter) {
        if !filter.requires.is_empty() {
            self.required.insert(slot, filter.requires.clone());
        }
    }

    fn remove_agent(&mut self, slot: usize) {
        self.required.remove(&slot);
    }

    fn filter(&self, request: &BidRequest, candidates: &mut ConfigSet) {
        for (slot, domains) in &self.required {
            if candidates.test(*slot) && !domains.iter().all(|d| request.user_ids.contains_key(d)) {
                candidates.reset(*slot);
            }
        }
    }
}

fn campaign_terms(filter: &AgentFilter) -> &IncludeExclude<u64> {
    &filter.campaign
}

fn campaign_keys(request: &BidRequest) -> Vec<u64> {
    request.campaign.into_iter().collect()
}

fn exchange_terms(filter: &AgentFilter) -> &IncludeExclude<String> {
    &filter.exchange
}

fn exchange_keys(request: &BidRequest) -> Vec<String> {
    vec![request.exchange.clone()]
}

fn segment_terms(filter: &AgentFilter) -> &IncludeExclude<String> {
    &filter.segment
}

fn segment_keys(request: &BidRequest) -> Vec<String> {
    request.segments.clone()
}

fn host_terms(filter: &AgentFilter) -> &IncludeExclude<String> {
    &filter.host
}

fn host_request_keys(request: &BidRequest) -> Vec<String> {
    request.host().map(|h| host_keys(&h)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::fixtures::bid_request;

    fn run(filter: &dyn BidFilter, request: &BidRequest, slots: &[usize]) -> Vec<usize> {
        let mut candidates: ConfigSet = slots.iter().copied().collect();
        filter.filter(request, &mut candidates);
        candidates.iter().collect()
    }

    #[test]
    fn test_keyed_include_exclude() {
        let mut filter = KeyedFilter::new("campaign", priority::CAMPAIGN, campaign_terms, campaign_keys);
        filter.add_agent(0, &"campaign=42".parse().unwrap());
        filter.add_agent(1, &"campaign!=42".parse().unwrap());
        filter.add_agent(2, &AgentFilter::any());

        assert_eq!(run(&filter, &bid_request("a", Some(42)), &[0, 1, 2]), vec![0, 2]);
        assert_eq!(run(&filter, &bid_request("b", Some(7)), &[0, 1, 2]), vec![1, 2]);
        assert_eq!(run(&filter, &bid_request("c", None), &[0, 1, 2]), vec![1, 2]);

        filter.remove_agent(0);
        assert_eq!(run(&filter, &bid_request("d", Some(42)), &[0, 1, 2]), vec![2]);
    }

    #[test]
    fn test_host_wildcards() {
        let mut filter = KeyedFilter::new("host", priority::HOST, host_terms, host_request_keys);
        filter.add_agent(0, &"host=*.example.com".parse().unwrap());
        filter.add_agent(1, &"host=other.org".parse().unwrap());

        assert_eq!(run(&filter, &bid_request("a", None), &[0, 1]), vec![0]);
    }

    #[test]
    fn test_hour_of_week() {
        let mut filter = HourOfWeekFilter::new();
        let mut request = bid_request("a", None);
        let hour = request.hour_of_week() % 24;

        filter.add_agent(0, &format!("hour={}", hour).parse().unwrap());
        filter.add_agent(1, &format!("hour!={}", hour).parse().unwrap());
        assert_eq!(run(&filter, &request, &[0, 1]), vec![0]);

        request.timestamp = request.timestamp + chrono::Duration::hours(1);
        assert_eq!(run(&filter, &request, &[0, 1]), vec![1]);
    }

    #[test]
    fn test_required_ids() {
        let mut filter = RequiredIdsFilter::default();
        filter.add_agent(0, &"requires=exchange".parse().unwrap());
        filter.add_agent(1, &AgentFilter::any());

        let mut request = bid_request("a", None);
        assert_eq!(run(&filter, &request, &[0, 1]), vec![1]);

        request.user_ids.insert("exchange".into(), "u-9".into());
        assert_eq!(run(&filter, &request, &[0, 1]), vec![0, 1]);
    }
}
