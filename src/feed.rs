//! In-memory feed state shared between the scheduler (sole writer) and the
//! HTTP handlers (readers).
//!
//! All access goes through [`FeedStore`], which owns the lock. Readers only
//! ever get copies, so nothing outlives the critical section.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Maximum number of entries kept in the feed.
pub const FEED_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedProperties {
    pub title: String,
    /// Older state files lack this; it is reset from settings on startup.
    #[serde(default)]
    pub link: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date_updated: DateTime<Utc>,
    pub author_name: String,
    pub id: String,
}

impl FeedProperties {
    /// Fresh properties with a newly generated feed id.
    pub fn new(title: &str, link: &str, author_name: &str) -> Self {
        Self {
            title: title.to_string(),
            link: link.to_string(),
            date_updated: Utc::now(),
            author_name: author_name.to_string(),
            id: generate_feed_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub summary: String,
    /// When the notification was published, not when the task is due.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date_updated: DateTime<Utc>,
    pub id: String,
}

impl FeedEntry {
    pub fn new(title: String, link: String, summary: String, date_updated: DateTime<Utc>) -> Self {
        Self {
            title,
            link,
            summary,
            date_updated,
            id: generate_feed_id(),
        }
    }
}

/// Properties plus entries, oldest first. This is both what the renderer
/// consumes and what gets written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedData {
    pub properties: FeedProperties,
    pub entries: Vec<FeedEntry>,
}

impl FeedData {
    pub fn new(properties: FeedProperties) -> Self {
        Self {
            properties,
            entries: Vec::new(),
        }
    }
}

/// `urn:uuid:60a76c80-d399-11d9-b93c-0003939e0af6` style id.
pub fn generate_feed_id() -> String {
    Uuid::new_v4().urn().to_string()
}

struct Inner {
    properties: FeedProperties,
    entries: VecDeque<FeedEntry>,
}

impl Inner {
    fn push(&mut self, entry: FeedEntry, capacity: usize) {
        if self.entries.len() == capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn copy(&self) -> FeedData {
        FeedData {
            properties: self.properties.clone(),
            entries: self.entries.iter().cloned().collect(),
        }
    }
}

/// Bounded, insertion-ordered feed. Once full, every append evicts the
/// oldest entry.
pub struct FeedStore {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl FeedStore {
    pub fn new(properties: FeedProperties) -> Self {
        Self::with_capacity(properties, FEED_CAPACITY)
    }

    pub fn with_capacity(properties: FeedProperties, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                properties,
                entries: VecDeque::with_capacity(capacity),
            }),
        }
    }

    /// Builds a store already hydrated from `data`.
    pub fn from_data(data: FeedData) -> Self {
        let mut inner = Inner {
            properties: data.properties.clone(),
            entries: VecDeque::with_capacity(FEED_CAPACITY),
        };
        replace(&mut inner, data, FEED_CAPACITY);
        Self {
            capacity: FEED_CAPACITY,
            inner: Mutex::new(inner),
        }
    }

    /// Appends `batch` in order. A batch longer than the capacity keeps only
    /// its most recent `capacity` items. The feed's `date_updated` follows
    /// the newest entry.
    pub async fn append_entries(&self, batch: Vec<FeedEntry>) {
        if batch.is_empty() {
            return;
        }

        let skip = batch.len().saturating_sub(self.capacity);
        let mut inner = self.inner.lock().await;
        for entry in batch.into_iter().skip(skip) {
            if entry.date_updated > inner.properties.date_updated {
                inner.properties.date_updated = entry.date_updated;
            }
            inner.push(entry, self.capacity);
        }
    }

    /// Consistent copy for rendering.
    pub async fn snapshot(&self) -> FeedData {
        self.inner.lock().await.copy()
    }

    /// Replaces the whole feed, trimming to the newest `capacity` entries.
    pub async fn load(&self, data: FeedData) {
        let mut inner = self.inner.lock().await;
        replace(&mut inner, data, self.capacity);
    }

    /// Copy in the persisted layout (oldest first).
    pub async fn export(&self) -> FeedData {
        self.inner.lock().await.copy()
    }

    pub async fn set_link(&self, link: &str) {
        self.inner.lock().await.properties.link = link.to_string();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn replace(inner: &mut Inner, data: FeedData, capacity: usize) {
    let skip = data.entries.len().saturating_sub(capacity);
    inner.properties = data.properties;
    inner.entries.clear();
    inner.entries.extend(data.entries.into_iter().skip(skip));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn props() -> FeedProperties {
        FeedProperties::new("My Feed", "https://example.org/feed/atom.xml", "My Name")
    }

    fn entry(n: usize) -> FeedEntry {
        FeedEntry::new(
            format!("Item {n}"),
            format!("https://example.org/{n}"),
            "summary".to_string(),
            Utc::now(),
        )
    }

    fn titles(data: &FeedData) -> Vec<String> {
        data.entries.iter().map(|e| e.title.clone()).collect()
    }

    #[tokio::test]
    async fn keeps_last_fifty_in_order() {
        let store = FeedStore::new(props());
        for n in 0..73 {
            store.append_entries(vec![entry(n)]).await;
        }

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.entries.len(), FEED_CAPACITY);
        let expected: Vec<String> = (23..73).map(|n| format!("Item {n}")).collect();
        assert_eq!(titles(&snapshot), expected);
    }

    #[tokio::test]
    async fn oversized_batch_keeps_its_tail() {
        let store = FeedStore::with_capacity(props(), 5);
        store.append_entries(vec![entry(0), entry(1)]).await;
        store.append_entries((10..18).map(entry).collect()).await;

        let snapshot = store.snapshot().await;
        assert_eq!(
            titles(&snapshot),
            vec!["Item 13", "Item 14", "Item 15", "Item 16", "Item 17"]
        );
    }

    #[tokio::test]
    async fn partial_fill_evicts_only_overflow() {
        let store = FeedStore::with_capacity(props(), 5);
        store.append_entries((1..=3).map(entry).collect()).await;
        assert_eq!(store.len().await, 3);

        store.append_entries((4..=7).map(entry).collect()).await;
        let snapshot = store.snapshot().await;
        assert_eq!(
            titles(&snapshot),
            vec!["Item 3", "Item 4", "Item 5", "Item 6", "Item 7"]
        );
    }

    #[tokio::test]
    async fn append_bumps_feed_updated_time() {
        let mut properties = props();
        properties.date_updated = Utc::now() - Duration::days(2);
        let store = FeedStore::new(properties);

        let newest = entry(1);
        let stamp = newest.date_updated;
        store.append_entries(vec![newest]).await;

        assert_eq!(store.snapshot().await.properties.date_updated, stamp);
    }

    #[tokio::test]
    async fn load_trims_to_capacity() {
        let store = FeedStore::with_capacity(props(), 3);
        let mut data = FeedData::new(props());
        data.entries = (0..6).map(entry).collect();
        store.load(data.clone()).await;

        let exported = store.export().await;
        assert_eq!(exported.properties, data.properties);
        assert_eq!(titles(&exported), vec!["Item 3", "Item 4", "Item 5"]);
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_store() {
        let store = FeedStore::new(props());
        store.append_entries(vec![entry(1)]).await;
        let before = store.snapshot().await;
        store.append_entries(vec![entry(2)]).await;

        assert_eq!(before.entries.len(), 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshots_never_see_a_partial_batch() {
        const BATCH: usize = 5;
        let store = Arc::new(FeedStore::new(props()));

        let writers: Vec<_> = (0..2)
            .map(|w| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for b in 0..40 {
                        let batch = (0..BATCH)
                            .map(|i| {
                                FeedEntry::new(
                                    format!("{w}:{b}:{i}"),
                                    "l".to_string(),
                                    "s".to_string(),
                                    Utc::now(),
                                )
                            })
                            .collect();
                        store.append_entries(batch).await;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut snapshots = Vec::new();
                    for _ in 0..200 {
                        snapshots.push(store.snapshot().await);
                        tokio::task::yield_now().await;
                    }
                    snapshots
                })
            })
            .collect();

        for writer in writers {
            writer.await.unwrap();
        }
        for reader in readers {
            for snapshot in reader.await.unwrap() {
                let len = snapshot.entries.len();
                assert!(len <= FEED_CAPACITY);
                assert_eq!(len % BATCH, 0, "partial batch in snapshot");

                let parsed: Vec<(usize, usize, usize)> = snapshot
                    .entries
                    .iter()
                    .map(|e| {
                        let mut parts = e.title.split(':').map(|p| p.parse::<usize>().unwrap());
                        (
                            parts.next().unwrap(),
                            parts.next().unwrap(),
                            parts.next().unwrap(),
                        )
                    })
                    .collect();

                for chunk in parsed.chunks(BATCH) {
                    let (w, b, _) = chunk[0];
                    let items: Vec<usize> = chunk.iter().map(|&(_, _, i)| i).collect();
                    assert!(chunk.iter().all(|&(cw, cb, _)| cw == w && cb == b));
                    assert_eq!(items, (0..BATCH).collect::<Vec<_>>());
                }

                for w in 0..2 {
                    let batches: Vec<usize> = parsed
                        .iter()
                        .filter(|&&(cw, _, _)| cw == w)
                        .map(|&(_, b, _)| b)
                        .collect();
                    assert!(batches.windows(2).all(|pair| pair[0] <= pair[1]));
                }
            }
        }

        assert_eq!(store.len().await, FEED_CAPACITY);
    }

    #[test]
    fn feed_ids_are_urn_uuids() {
        let a = generate_feed_id();
        let b = generate_feed_id();
        assert!(a.starts_with("urn:uuid:"));
        assert_eq!(a.len(), "urn:uuid:".len() + 36);
        assert_ne!(a, b);
    }
}
