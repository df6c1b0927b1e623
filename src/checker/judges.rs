//! Process-wide judge pool
//!
//! Maps each user to an ordered list of (judge, regex) entries. Writers
//! replace a user's slot atomically under the lock; readers clone the
//! immutable `Arc` slot and never block each other. Selection is
//! round-robin per `(user, scheme)` cursor.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::Result;
use crate::models::{Judge, JudgeEntry, RequestScheme};
use crate::repository::UserRepository;

#[derive(Default)]
pub struct JudgePool {
    slots: RwLock<HashMap<i64, Arc<Vec<JudgeEntry>>>>,
    cursors: DashMap<(i64, RequestScheme), usize>,
}

impl JudgePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace a user's judge list
    pub fn set_user_judges(&self, user_id: i64, entries: Vec<JudgeEntry>) {
        self.slots.write().insert(user_id, Arc::new(entries));
    }

    pub fn remove_user(&self, user_id: i64) {
        self.slots.write().remove(&user_id);
        self.cursors.retain(|(id, _), _| *id != user_id);
    }

    /// The next judge for `(user, scheme)`, round-robin over the subset of
    /// the user's judges whose URL scheme matches. `None` is fatal for the
    /// probe that asked: no statistic is written.
    pub fn next_judge(&self, user_id: i64, scheme: RequestScheme) -> Option<JudgeEntry> {
        let slot = self.slots.read().get(&user_id).cloned()?;

        let matching: Vec<&JudgeEntry> = slot
            .iter()
            .filter(|entry| entry.judge.scheme() == scheme)
            .collect();
        if matching.is_empty() {
            return None;
        }

        let mut cursor = self.cursors.entry((user_id, scheme)).or_insert(0);
        let selected = matching[*cursor % matching.len()].clone();
        *cursor = cursor.wrapping_add(1);

        Some(selected)
    }

    /// Number of users with a populated slot
    pub fn user_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Load every user's judges from the store, resolving judge IPs so the
    /// checker transports can pin them.
    pub async fn load(&self, users: &UserRepository) -> Result<()> {
        let by_user = users.judges_by_user().await?;

        // Judges are shared across users; build each once.
        let mut judge_cache: HashMap<i64, Arc<Judge>> = HashMap::new();
        for rows in by_user.values() {
            for row in rows {
                if judge_cache.contains_key(&row.judge_id) {
                    continue;
                }
                match Judge::new(row.judge_id, &row.full_string) {
                    Ok(judge) => {
                        judge_cache.insert(row.judge_id, Arc::new(judge));
                    }
                    Err(e) => warn!(judge_id = row.judge_id, "Skipping judge: {}", e),
                }
            }
        }

        futures::stream::iter(judge_cache.values().cloned())
            .for_each_concurrent(8, |judge| async move {
                if let Err(e) = judge.update_ip().await {
                    warn!(judge_id = judge.id, "Judge IP resolution failed: {}", e);
                }
            })
            .await;

        let mut loaded_users = 0usize;
        for (user_id, rows) in by_user {
            let mut entries = Vec::with_capacity(rows.len());
            for row in rows {
                let Some(judge) = judge_cache.get(&row.judge_id) else {
                    continue;
                };
                match JudgeEntry::new(judge.clone(), &row.regex) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(judge_id = row.judge_id, "Skipping judge regex: {}", e),
                }
            }

            self.set_user_judges(user_id, entries);
            loaded_users += 1;
        }

        info!(users = loaded_users, "Judge pool loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(judge_id: i64, url: &str) -> JudgeEntry {
        JudgeEntry::new(Arc::new(Judge::new(judge_id, url).unwrap()), "HTTP_HOST").unwrap()
    }

    #[test]
    fn test_next_judge_round_robin_per_scheme() {
        let pool = JudgePool::new();
        pool.set_user_judges(
            7,
            vec![
                entry(1, "http://a.example/azenv"),
                entry(2, "http://b.example/azenv"),
                entry(3, "https://c.example/azenv"),
            ],
        );

        // HTTP cursor cycles over the two http judges
        assert_eq!(pool.next_judge(7, RequestScheme::Http).unwrap().judge.id, 1);
        assert_eq!(pool.next_judge(7, RequestScheme::Http).unwrap().judge.id, 2);
        assert_eq!(pool.next_judge(7, RequestScheme::Http).unwrap().judge.id, 1);

        // HTTPS cursor is independent
        assert_eq!(pool.next_judge(7, RequestScheme::Https).unwrap().judge.id, 3);
        assert_eq!(pool.next_judge(7, RequestScheme::Https).unwrap().judge.id, 3);
    }

    #[test]
    fn test_next_judge_missing_cases() {
        let pool = JudgePool::new();

        // Unknown user
        assert!(pool.next_judge(1, RequestScheme::Http).is_none());

        // User with no judge for the scheme
        pool.set_user_judges(1, vec![entry(1, "http://a.example/azenv")]);
        assert!(pool.next_judge(1, RequestScheme::Https).is_none());
        assert!(pool.next_judge(1, RequestScheme::Http).is_some());
    }

    #[test]
    fn test_set_user_judges_replaces_atomically() {
        let pool = JudgePool::new();
        pool.set_user_judges(1, vec![entry(1, "http://a.example/azenv")]);
        assert_eq!(pool.next_judge(1, RequestScheme::Http).unwrap().judge.id, 1);

        pool.set_user_judges(1, vec![entry(9, "http://z.example/azenv")]);
        assert_eq!(pool.next_judge(1, RequestScheme::Http).unwrap().judge.id, 9);

        pool.remove_user(1);
        assert!(pool.next_judge(1, RequestScheme::Http).is_none());
        assert_eq!(pool.user_count(), 0);
    }
}
