use crate::models::Submission;
use crate::store::{DocumentStore, Query, SUBMISSIONS};
use crate::submissions::parse_submission;
use crate::subscription::{watch_query, Subscription};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::warn;

fn submitted_millis(submission: &Submission) -> i64 {
    submission.submitted_at.map(|t| t.timestamp_millis()).unwrap_or(0)
}

/// Percentage descending, then most recent submission first. Unsubmitted
/// attempts sort as if submitted at the epoch.
pub fn compare_for_ranking(a: &Submission, b: &Submission) -> Ordering {
    b.percentage
        .cmp(&a.percentage)
        .then_with(|| submitted_millis(b).cmp(&submitted_millis(a)))
}

pub fn rank_submissions(submissions: &mut [Submission]) {
    submissions.sort_by(compare_for_ranking);
}

/// Live leaderboard of a room.
#[derive(Clone)]
pub struct RankingFeed {
    store: Arc<dyn DocumentStore>,
}

impl RankingFeed {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Delivers the whole ranked list of the room's submissions now and after
    /// every change to it.
    pub fn subscribe<F>(&self, room_id: &str, on_update: F) -> Subscription
    where
        F: Fn(Vec<Submission>) + Send + Sync + 'static,
    {
        let query = Query::collection(SUBMISSIONS).where_eq("roomId", room_id);
        watch_query(self.store.clone(), query, move |snapshots| {
            let mut ranked: Vec<Submission> = snapshots
                .iter()
                .filter_map(|s| match parse_submission(&s.id, &s.data) {
                    Ok(submission) => Some(submission),
                    Err(err) => {
                        warn!("leaving malformed submission out of ranking: {}", err);
                        None
                    }
                })
                .collect();
            rank_submissions(&mut ranked);
            on_update(ranked);
        })
    }
}
