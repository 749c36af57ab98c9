use crate::codes::CodeAllocator;
use crate::config::Config;
use crate::exams::ExamRepository;
use crate::identity::{IdentityProvider, IdentityResolver};
use crate::ranking::RankingFeed;
use crate::rooms::RoomService;
use crate::store::DocumentStore;
use crate::submissions::SubmissionService;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
    pub identity: IdentityResolver,
    pub exams: ExamRepository,
    pub rooms: RoomService,
    pub submissions: SubmissionService,
    pub ranking: RankingFeed,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn DocumentStore>, provider: Arc<dyn IdentityProvider>) -> Self {
        let identity = IdentityResolver::new(store.clone(), provider);
        let codes = CodeAllocator::new(config.room_code_max_attempts);
        Self {
            exams: ExamRepository::new(store.clone()),
            rooms: RoomService::new(store.clone(), codes),
            submissions: SubmissionService::new(store.clone(), identity.clone()),
            ranking: RankingFeed::new(store.clone()),
            identity,
            store,
            config: Arc::new(config),
        }
    }
}
