#![cfg(test)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::clock::Clock;
use crate::config_parser::Config;
use crate::gateway_util::AppStateData;
use crate::llm::{DummyProvider, LlmProvider};
use crate::storage::StoreConnectionInfo;

/// App state over the mock store and the dummy provider, on a manual clock
pub fn get_unit_test_app_state_data(config: Arc<Config>, store_healthy: bool) -> AppStateData {
    let http_client = reqwest::Client::new();
    let store = StoreConnectionInfo::new_mock(store_healthy);
    let clock = Clock::manual(
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0)
            .single()
            .unwrap_or_default(),
    );

    AppStateData::from_components(
        config,
        http_client,
        store,
        LlmProvider::Dummy(DummyProvider),
        clock,
    )
}
