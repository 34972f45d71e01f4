// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-endpoint routing state and weighted round robin selection.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EndpointConfig;

/// Routing state for one endpoint. Owned and mutated only by the router.
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub weight: u32,
    /// `None` means unlimited.
    pub max_concurrent: Option<usize>,
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    /// In-flight LLM requests.
    pub current_requests: usize,
    /// Worker slots held by running workers.
    pub reserved_slots: usize,
    /// Picks in the current weighted round robin cycle.
    pub weight_counter: u32,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Endpoint {
    pub fn from_config(config: &EndpointConfig) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            weight: config.weight.max(1),
            max_concurrent: config.max_concurrent,
            healthy: true,
            last_check: None,
            current_requests: 0,
            reserved_slots: 0,
            weight_counter: 0,
            api_key: config.resolve_api_key(),
        }
    }

    /// Requests plus reserved worker slots.
    pub fn load(&self) -> usize {
        self.current_requests + self.reserved_slots
    }

    pub fn has_capacity(&self) -> bool {
        self.max_concurrent.map_or(true, |max| self.load() < max)
    }

    pub fn is_available(&self) -> bool {
        self.healthy && self.has_capacity()
    }

    fn remaining_credit(&self) -> u32 {
        self.weight.saturating_sub(self.weight_counter)
    }
}

/// Pick the next endpoint by weighted round robin and bump its counter.
///
/// Only healthy endpoints with spare capacity are eligible. When none of
/// them has credit left in the current cycle, every counter resets. The
/// eligible endpoint with the most remaining credit wins; ties go to the
/// one registered first.
pub fn select(endpoints: &mut [Endpoint]) -> Option<usize> {
    let eligible = || endpoints.iter().enumerate().filter(|(_, e)| e.is_available());

    eligible().next()?;

    if eligible().all(|(_, e)| e.remaining_credit() == 0) {
        for endpoint in endpoints.iter_mut() {
            endpoint.weight_counter = 0;
        }
    }

    let mut best: Option<(usize, u32)> = None;
    for (index, endpoint) in endpoints.iter().enumerate().filter(|(_, e)| e.is_available()) {
        let credit = endpoint.remaining_credit();
        if best.map_or(true, |(_, top)| credit > top) {
            best = Some((index, credit));
        }
    }

    let (index, _) = best?;
    endpoints[index].weight_counter += 1;
    Some(index)
}
