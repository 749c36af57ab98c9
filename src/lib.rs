pub mod codes;
pub mod config;
pub mod error;
pub mod exams;
pub mod handlers;
pub mod identity;
pub mod memory_store;
pub mod models;
pub mod ranking;
pub mod rooms;
pub mod routes;
pub mod scoring;
pub mod state;
pub mod store;
pub mod submissions;
pub mod subscription;
pub mod ws_protocol;

use std::sync::Arc;

pub fn build_state(config: config::Config) -> state::AppState {
    let store: Arc<dyn store::DocumentStore> = match config.local_state_path.as_ref() {
        Some(path) => Arc::new(memory_store::InMemoryStore::open(path)),
        None => Arc::new(memory_store::InMemoryStore::new()),
    };
    let provider: Arc<dyn identity::IdentityProvider> = Arc::new(identity::LocalIdentityProvider::new());
    state::AppState::new(config, store, provider)
}
