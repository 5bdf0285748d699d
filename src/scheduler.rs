//! Background poller that turns due-date threshold crossings into feed
//! entries.
//!
//! Every tick covers the half-open window `(previous poll, this poll]`. A
//! threshold fires when `due_date - offset` lands inside that window, so
//! each threshold of a task fires exactly once while the daemon is running.
//! Crossings that happen while the daemon is down are never replayed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::atom::xml_safe;
use crate::custom_date::is_within_window;
use crate::feed::{FeedEntry, FeedStore};
use crate::gitlab::{Issue, IssueSource};
use crate::persist;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(30);

const HIGH_PRIORITY_MARKER: &str = "🚩";
const LOW_PRIORITY_MARKER: &str = "🔔";

/// What to do when several thresholds of one task fall inside a single poll
/// window, e.g. after the GitLab instance was unreachable for a week.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdPolicy {
    /// Only the threshold with the most time remaining fires.
    #[default]
    FirstMatch,
    /// Every crossed threshold fires, longest-remaining first.
    AllMatches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    ThreeWeeks,
    OneWeek,
    OneDay,
    Due,
}

impl Threshold {
    /// Ordered by descending remaining time.
    pub const ALL: [Threshold; 4] = [
        Threshold::ThreeWeeks,
        Threshold::OneWeek,
        Threshold::OneDay,
        Threshold::Due,
    ];

    pub fn offset(self) -> chrono::Duration {
        match self {
            Threshold::ThreeWeeks => chrono::Duration::weeks(3),
            Threshold::OneWeek => chrono::Duration::weeks(1),
            Threshold::OneDay => chrono::Duration::days(1),
            Threshold::Due => chrono::Duration::zero(),
        }
    }

    pub fn is_high_priority(self) -> bool {
        matches!(self, Threshold::OneDay | Threshold::Due)
    }

    pub fn summary(self) -> &'static str {
        match self {
            Threshold::ThreeWeeks => "Task is due in 3 weeks",
            Threshold::OneWeek => "Task is due in 1 week",
            Threshold::OneDay => "Task is due in 1 day",
            Threshold::Due => "Task is due now!",
        }
    }
}

/// Thresholds of a task due at `due` that were crossed in `(start, end]`.
pub fn crossed_thresholds(
    due: DateTime<Utc>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    policy: ThresholdPolicy,
) -> Vec<Threshold> {
    let crossed = Threshold::ALL
        .into_iter()
        .filter(|t| is_within_window(due - t.offset(), start, end));

    match policy {
        ThresholdPolicy::FirstMatch => crossed.take(1).collect(),
        ThresholdPolicy::AllMatches => crossed.collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub title: String,
    pub due_date: DateTime<Utc>,
    pub link: String,
}

impl From<Issue> for Task {
    fn from(issue: Issue) -> Self {
        Self {
            title: issue.title,
            due_date: issue.due_date,
            link: issue.web_url,
        }
    }
}

/// Tasks keyed by GitLab issue iid.
pub type TaskList = BTreeMap<u16, Task>;

pub fn notification_entry(task: &Task, threshold: Threshold, now: DateTime<Utc>) -> FeedEntry {
    let marker = if threshold.is_high_priority() {
        HIGH_PRIORITY_MARKER
    } else {
        LOW_PRIORITY_MARKER
    };

    FeedEntry::new(
        format!("{marker}{}", xml_safe(&task.title)),
        xml_safe(&task.link).into_owned(),
        threshold.summary().to_string(),
        now,
    )
}

pub struct NotificationScheduler<S> {
    source: S,
    store: Arc<FeedStore>,
    state_path: PathBuf,
    tasks: TaskList,
    policy: ThresholdPolicy,
    poll_interval: Duration,
    startup_delay: Duration,
    previous_poll: DateTime<Utc>,
}

impl<S: IssueSource + 'static> NotificationScheduler<S> {
    pub fn new(source: S, store: Arc<FeedStore>, state_path: PathBuf) -> Self {
        Self {
            source,
            store,
            state_path,
            tasks: TaskList::new(),
            policy: ThresholdPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            startup_delay: DEFAULT_STARTUP_DELAY,
            previous_poll: Utc::now(),
        }
    }

    pub fn with_policy(mut self, policy: ThresholdPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Moves the start of the first poll window.
    pub fn starting_at(mut self, previous_poll: DateTime<Utc>) -> Self {
        self.previous_poll = previous_poll;
        self
    }

    pub fn tasks(&self) -> &TaskList {
        &self.tasks
    }

    pub fn previous_poll(&self) -> DateTime<Utc> {
        self.previous_poll
    }

    /// One poll at `now`. Returns how many entries were published.
    ///
    /// The window always advances, even when the query fails, so a window
    /// is never evaluated twice.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> usize {
        let start = std::mem::replace(&mut self.previous_poll, now);

        match self.source.fetch_issues().await {
            Ok(issues) => self.merge(issues),
            Err(e) => {
                warn!(error = %e, "failed to query issues, skipping this poll");
                return 0;
            }
        }

        let mut entries = Vec::new();
        for task in self.tasks.values() {
            for threshold in crossed_thresholds(task.due_date, start, now, self.policy) {
                info!(task = %task.title, summary = threshold.summary(), "adding feed entry");
                entries.push(notification_entry(task, threshold, now));
            }
        }

        if entries.is_empty() {
            debug!(tasks = self.tasks.len(), "no thresholds crossed");
            return 0;
        }

        let count = entries.len();
        self.store.append_entries(entries).await;
        self.save().await;
        count
    }

    fn merge(&mut self, issues: Vec<Issue>) {
        for issue in issues {
            self.tasks.insert(issue.iid, Task::from(issue));
        }
    }

    async fn save(&self) {
        let data = self.store.export().await;
        let path = self.state_path.clone();

        match tokio::task::spawn_blocking(move || persist::save(&path, &data)).await {
            Ok(Ok(())) => debug!(path = %self.state_path.display(), "feed state saved"),
            Ok(Err(e)) => error!(error = %e, "failed to save feed state, will retry next update"),
            Err(e) => error!(error = %e, "feed state save task failed"),
        }
    }

    /// Spawns the poll loop. It runs until `cancel` fires.
    pub fn run(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Events that happened before startup are not caught up on
            self.previous_poll = Utc::now();
            info!(
                interval_secs = self.poll_interval.as_secs(),
                policy = ?self.policy,
                "notification scheduler started"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("notification scheduler cancelled before first poll");
                    return;
                }
                _ = tokio::time::sleep(self.startup_delay) => {}
            }

            loop {
                let published = self.tick(Utc::now()).await;
                debug!(published, "poll finished");

                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("notification scheduler stopped");
                        break;
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        })
    }
}
