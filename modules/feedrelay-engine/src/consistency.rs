//! Subscriber consistency job.
//!
//! Runs periodically, outside the fetch cycle, and prunes mention
//! records that no longer correspond to live platform entities:
//! orphaned records, roles gone from the cached role set, users the
//! platform confirms absent, and records of unknown type. Anything
//! inconclusive (rate limit, transient failure, permission error) is
//! retained rather than risk deleting a valid record.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use feedrelay_common::{FeedSubscription, MentionKind};

use crate::traits::{PlatformDirectory, SubscriberStore, SubscriptionStore};

/// Platform error codes that confirm the referenced entity does not
/// exist (unknown member / unknown user). Everything else is
/// inconclusive.
pub const CONFIRMED_ABSENT_CODES: &[i64] = &[10_007, 10_013];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Existence {
    Present,
    ConfirmedAbsent,
    Inconclusive,
}

pub struct ConsistencyJob {
    subscribers: Arc<dyn SubscriberStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    directory: Arc<dyn PlatformDirectory>,
    /// Bound on concurrent user existence fetches.
    fetch_concurrency: usize,
}

impl ConsistencyJob {
    pub fn new(
        subscribers: Arc<dyn SubscriberStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        directory: Arc<dyn PlatformDirectory>,
        fetch_concurrency: usize,
    ) -> Self {
        Self {
            subscribers,
            subscriptions,
            directory,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    /// Reconcile subscriber records against live platform state.
    /// Returns the number of deletions.
    pub async fn run(&self) -> Result<u64> {
        let subscribers = self.subscribers.all().await?;
        let subscriptions: HashMap<String, FeedSubscription> = self
            .subscriptions
            .all()
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let mut to_delete: Vec<String> = Vec::new();
        // Unique user target → subscriber record IDs referencing it.
        // Dedup here guarantees one fetch per user per job run.
        let mut user_refs: HashMap<String, Vec<String>> = HashMap::new();

        for subscriber in &subscribers {
            let Some(subscription) = subscriptions.get(&subscriber.subscription_id) else {
                debug!(subscriber = %subscriber.id, "Subscription gone, pruning");
                to_delete.push(subscriber.id.clone());
                continue;
            };
            match subscriber.kind {
                MentionKind::Role => {
                    match self
                        .directory
                        .role_exists(&subscription.destination_id, &subscriber.target_id)
                    {
                        Some(true) => {}
                        Some(false) => {
                            debug!(
                                subscriber = %subscriber.id,
                                role = %subscriber.target_id,
                                "Role not in cached role set, pruning"
                            );
                            to_delete.push(subscriber.id.clone());
                        }
                        // Absence must be confirmed against a loaded
                        // role set; an unloaded cache is inconclusive.
                        None => {
                            warn!(
                                subscriber = %subscriber.id,
                                destination = %subscription.destination_id,
                                "No cached role set for destination, retaining"
                            );
                        }
                    }
                }
                MentionKind::User => {
                    user_refs
                        .entry(subscriber.target_id.clone())
                        .or_default()
                        .push(subscriber.id.clone());
                }
                MentionKind::Unknown => {
                    debug!(subscriber = %subscriber.id, "Unknown mention type, pruning");
                    to_delete.push(subscriber.id.clone());
                }
            }
        }

        let outcomes: Vec<(String, Existence)> = stream::iter(
            user_refs.keys().cloned().map(|user_id| {
                let directory = self.directory.clone();
                async move {
                    let existence = match directory.fetch_user(&user_id).await {
                        Ok(()) => Existence::Present,
                        Err(e)
                            if e.code
                                .is_some_and(|c| CONFIRMED_ABSENT_CODES.contains(&c)) =>
                        {
                            Existence::ConfirmedAbsent
                        }
                        Err(e) => {
                            warn!(user = %user_id, error = %e, "Inconclusive user check, retaining");
                            Existence::Inconclusive
                        }
                    };
                    (user_id, existence)
                }
            }),
        )
        .buffer_unordered(self.fetch_concurrency)
        .collect()
        .await;

        for (user_id, existence) in outcomes {
            if existence == Existence::ConfirmedAbsent {
                if let Some(record_ids) = user_refs.get(&user_id) {
                    to_delete.extend(record_ids.iter().cloned());
                }
            }
        }

        // Execute all deletions concurrently at the end.
        let results = futures::future::join_all(
            to_delete
                .iter()
                .map(|id| self.subscribers.delete(id)),
        )
        .await;
        let mut deleted = 0u64;
        for (id, result) in to_delete.iter().zip(results) {
            match result {
                Ok(()) => deleted += 1,
                Err(e) => warn!(subscriber = %id, error = %e, "Failed to delete subscriber"),
            }
        }

        info!(
            checked = subscribers.len(),
            deleted,
            "Subscriber consistency job complete"
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        subscription, user_subscriber, MemorySubscriberStore, MemorySubscriptionStore,
        MockDirectory,
    };
    use feedrelay_common::Subscriber;

    fn job(
        subscribers: Vec<Subscriber>,
        subscriptions: Vec<FeedSubscription>,
        directory: MockDirectory,
        concurrency: usize,
    ) -> (ConsistencyJob, Arc<MemorySubscriberStore>, Arc<MockDirectory>) {
        let store = Arc::new(MemorySubscriberStore::new(subscribers));
        let directory = Arc::new(directory);
        let job = ConsistencyJob::new(
            store.clone(),
            Arc::new(MemorySubscriptionStore::new(subscriptions)),
            directory.clone(),
            concurrency,
        );
        (job, store, directory)
    }

    fn role_subscriber(id: &str, subscription_id: &str, target: &str) -> Subscriber {
        Subscriber {
            id: id.to_string(),
            subscription_id: subscription_id.to_string(),
            target_id: target.to_string(),
            kind: MentionKind::Role,
        }
    }

    #[tokio::test]
    async fn orphaned_subscribers_are_deleted() {
        let (job, store, _) = job(
            vec![user_subscriber("m1", "gone", "u1")],
            vec![],
            MockDirectory::new(),
            4,
        );
        assert_eq!(job.run().await.unwrap(), 1);
        assert!(store.remaining().is_empty());
    }

    #[tokio::test]
    async fn role_membership_is_checked_against_the_cache() {
        let directory = MockDirectory::new().with_role("g1", "r-live");
        let (job, store, directory) = job(
            vec![
                role_subscriber("m1", "s1", "r-live"),
                role_subscriber("m2", "s1", "r-dead"),
            ],
            vec![subscription("s1")],
            directory,
            4,
        );
        assert_eq!(job.run().await.unwrap(), 1);
        assert_eq!(store.remaining().len(), 1);
        assert_eq!(store.remaining()[0].id, "m1");
        // Role checks never hit the network.
        assert_eq!(directory.total_fetches(), 0);
    }

    #[tokio::test]
    async fn unloaded_role_cache_retains_role_subscribers() {
        // No role set was ever cached for the destination, as after a
        // failed startup refresh. That is not evidence of absence.
        let (job, store, _) = job(
            vec![role_subscriber("m1", "s1", "r-live")],
            vec![subscription("s1")],
            MockDirectory::new(),
            4,
        );
        assert_eq!(job.run().await.unwrap(), 0);
        assert_eq!(store.remaining().len(), 1);
    }

    #[tokio::test]
    async fn unknown_mention_type_is_deleted_unconditionally() {
        let mut odd = user_subscriber("m1", "s1", "u1");
        odd.kind = MentionKind::Unknown;
        let (job, store, _) = job(vec![odd], vec![subscription("s1")], MockDirectory::new(), 4);
        assert_eq!(job.run().await.unwrap(), 1);
        assert!(store.remaining().is_empty());
    }

    #[tokio::test]
    async fn shared_user_target_is_fetched_exactly_once() {
        let directory = MockDirectory::new().with_user("u1");
        let (job, store, directory) = job(
            vec![
                user_subscriber("m1", "s1", "u1"),
                user_subscriber("m2", "s2", "u1"),
            ],
            vec![subscription("s1"), subscription("s2")],
            directory,
            4,
        );
        assert_eq!(job.run().await.unwrap(), 0);
        assert_eq!(store.remaining().len(), 2);
        assert_eq!(directory.fetch_count("u1"), 1);
    }

    #[tokio::test]
    async fn confirmed_absence_deletes_every_referencing_record() {
        let directory = MockDirectory::new().with_user_error("u1", Some(10_013));
        let (job, store, _) = job(
            vec![
                user_subscriber("m1", "s1", "u1"),
                user_subscriber("m2", "s2", "u1"),
            ],
            vec![subscription("s1"), subscription("s2")],
            directory,
            4,
        );
        assert_eq!(job.run().await.unwrap(), 2);
        assert!(store.remaining().is_empty());
        let mut deleted = store.deleted_ids();
        deleted.sort();
        assert_eq!(deleted, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[tokio::test]
    async fn inconclusive_failures_retain_the_record() {
        // Rate limited and codeless transport errors both retain.
        let directory = MockDirectory::new()
            .with_user_error("u1", Some(429))
            .with_user_error("u2", None);
        let (job, store, _) = job(
            vec![
                user_subscriber("m1", "s1", "u1"),
                user_subscriber("m2", "s1", "u2"),
            ],
            vec![subscription("s1")],
            directory,
            4,
        );
        assert_eq!(job.run().await.unwrap(), 0);
        assert_eq!(store.remaining().len(), 2);
    }
}
