use crate::error::ServiceResult;
use crate::store::{DocumentStore, Query, ROOMS};
use rand::Rng;
use tracing::{debug, warn};

/// No 0/O or 1/I, so codes survive being read aloud or copied by hand.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_LENGTH: usize = 6;
pub const DEFAULT_MAX_ATTEMPTS: usize = 10;

/// Uniform draw from the code alphabet. Not suitable as a secret.
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

pub async fn is_code_unique(store: &dyn DocumentStore, code: &str) -> ServiceResult<bool> {
    let query = Query::collection(ROOMS).where_eq("code", normalize_code(code)).limit(1);
    Ok(store.query(&query).await?.is_empty())
}

/// Hands out room codes, retrying on collision.
#[derive(Debug, Clone, Copy)]
pub struct CodeAllocator {
    max_attempts: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl CodeAllocator {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// After `max_attempts` collisions the last candidate is returned anyway;
    /// uniqueness is only checked here, at creation time.
    pub async fn allocate_unique_code(&self, store: &dyn DocumentStore) -> ServiceResult<String> {
        let mut candidate = generate_code(&mut rand::thread_rng());
        for attempt in 1..=self.max_attempts {
            if is_code_unique(store, &candidate).await? {
                debug!(attempt, code = %candidate, "room code allocated");
                return Ok(candidate);
            }
            if attempt < self.max_attempts {
                candidate = generate_code(&mut rand::thread_rng());
            }
        }
        warn!(
            code = %candidate,
            attempts = self.max_attempts,
            "room code still collides after all attempts, using it anyway"
        );
        Ok(candidate)
    }
}
