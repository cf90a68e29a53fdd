use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connectors::FetchedMessage;

pub mod subjects;

pub use subjects::SubjectCluster;

const MAX_TOP_SENDERS: usize = 20;
const MAX_TOP_DOMAINS: usize = 10;
const RANKED_SENDERS: usize = 10;
const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

pub const CATEGORIES: [&str; 7] = [
    "notifications",
    "newsletters",
    "social",
    "shopping",
    "work",
    "personal",
    "other",
];

#[derive(Debug, Error)]
#[error("{0}")]
pub struct AnalyzerError(pub String);

/// Batch analysis. Must be a pure function of its input.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, messages: &[FetchedMessage]) -> Result<BatchInsights, AnalyzerError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchInsights {
    pub sender_patterns: SenderPatterns,
    pub subject_clusters: Vec<SubjectCluster>,
    pub frequency_stats: FrequencyStats,
    pub categories: BTreeMap<String, usize>,
    pub total_messages: usize,
    pub unique_senders: usize,
    /// Subject cluster of each input message, in input order.
    #[serde(default, skip_serializing)]
    pub subject_assignments: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenderPatterns {
    pub top_senders: Vec<SenderCount>,
    pub top_domains: Vec<DomainCount>,
    pub total_unique_senders: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderCount {
    pub email: String,
    pub name: Option<String>,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainCount {
    pub domain: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrequencyStats {
    /// Messages per distinct receiving day.
    pub daily_average: f64,
    pub peak_hour: Option<u32>,
    pub peak_day: Option<String>,
    pub hourly_distribution: BTreeMap<u32, usize>,
    pub weekday_distribution: BTreeMap<String, usize>,
}

/// Per-message fields stored on an analysis artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactFields {
    pub sender_cluster: String,
    pub subject_cluster: String,
    pub category: String,
}

/// Heuristic analyzer: sender counts, token-similarity subject clusters and
/// keyword categories.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordAnalyzer;

impl Analyzer for KeywordAnalyzer {
    fn analyze(&self, messages: &[FetchedMessage]) -> Result<BatchInsights, AnalyzerError> {
        if messages.is_empty() {
            return Ok(BatchInsights::default());
        }

        let subjects = messages
            .iter()
            .map(|message| message.subject.clone())
            .collect::<Vec<_>>();
        let clustering = subjects::cluster_subjects(&subjects);

        let mut categories = CATEGORIES
            .iter()
            .map(|name| (name.to_string(), 0usize))
            .collect::<BTreeMap<_, _>>();
        for message in messages {
            *categories.entry(categorize(message).to_string()).or_default() += 1;
        }

        let sender_patterns = sender_patterns(messages);
        Ok(BatchInsights {
            unique_senders: sender_patterns.total_unique_senders,
            sender_patterns,
            subject_clusters: clustering.clusters,
            frequency_stats: frequency_stats(messages),
            categories,
            total_messages: messages.len(),
            subject_assignments: clustering.assignments,
        })
    }
}

fn sender_patterns(messages: &[FetchedMessage]) -> SenderPatterns {
    let mut counts: HashMap<String, (usize, Option<String>)> = HashMap::new();
    for message in messages {
        let address = message.sender_address.trim().to_ascii_lowercase();
        let entry = counts.entry(address).or_insert((0, None));
        entry.0 += 1;
        if entry.1.is_none() {
            entry.1 = message
                .sender_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string);
        }
    }

    let mut domains: HashMap<String, usize> = HashMap::new();
    for (address, (count, _)) in &counts {
        if let Some((_, domain)) = address.rsplit_once('@') {
            *domains.entry(domain.to_string()).or_default() += count;
        }
    }

    let total = messages.len() as f64;
    let mut top_senders = counts
        .iter()
        .map(|(email, (count, name))| SenderCount {
            email: email.clone(),
            name: name.clone(),
            count: *count,
            percentage: ((*count as f64 / total) * 10_000.0).round() / 100.0,
        })
        .collect::<Vec<_>>();
    top_senders.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.email.cmp(&b.email)));
    top_senders.truncate(MAX_TOP_SENDERS);

    let mut top_domains = domains
        .into_iter()
        .map(|(domain, count)| DomainCount { domain, count })
        .collect::<Vec<_>>();
    top_domains.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.domain.cmp(&b.domain)));
    top_domains.truncate(MAX_TOP_DOMAINS);

    SenderPatterns {
        top_senders,
        top_domains,
        total_unique_senders: counts.len(),
    }
}

fn frequency_stats(messages: &[FetchedMessage]) -> FrequencyStats {
    let mut days = BTreeSet::new();
    let mut hourly: BTreeMap<u32, usize> = BTreeMap::new();
    let mut weekdays = [0usize; 7];

    for message in messages {
        days.insert(message.received_at.date_naive());
        *hourly.entry(message.received_at.hour()).or_default() += 1;
        weekdays[message.received_at.weekday().num_days_from_monday() as usize] += 1;
    }

    let daily_average = messages.len() as f64 / days.len().max(1) as f64;
    // Ties resolve to the earliest hour / weekday.
    let peak_hour = hourly
        .iter()
        .fold(None::<(u32, usize)>, |best, (&hour, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((hour, count)),
        })
        .map(|(hour, _)| hour);
    let peak_day = weekdays
        .iter()
        .enumerate()
        .filter(|(_, &count)| count > 0)
        .fold(None::<(usize, usize)>, |best, (day, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((day, count)),
        })
        .map(|(day, _)| WEEKDAY_NAMES[day].to_string());

    FrequencyStats {
        daily_average: (daily_average * 100.0).round() / 100.0,
        peak_hour,
        peak_day,
        hourly_distribution: hourly,
        weekday_distribution: weekdays
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(day, &count)| (WEEKDAY_NAMES[day].to_string(), count))
            .collect(),
    }
}

/// One keyword rule, shared by the batch counts and the per-message field.
pub fn categorize(message: &FetchedMessage) -> &'static str {
    const NOTIFICATION: &[&str] = &["notification", "alert", "reminder", "confirm", "receipt"];
    const NEWSLETTER: &[&str] = &["newsletter", "digest", "weekly", "monthly", "unsubscribe"];
    const SOCIAL: &[&str] = &["facebook", "twitter", "linkedin", "instagram", "social"];
    const SHOPPING: &[&str] = &["order", "purchase", "shipping", "delivery", "amazon", "ebay"];
    const WORK: &[&str] = &["meeting", "calendar", "team", "project", "deadline"];
    const AUTOMATED: &[&str] = &["noreply", "no-reply", "donotreply"];

    let subject = message.subject.to_lowercase();
    let sender = message.sender_address.to_lowercase();
    let in_subject = |keywords: &[&str]| keywords.iter().any(|kw| subject.contains(kw));
    let in_sender = |keywords: &[&str]| keywords.iter().any(|kw| sender.contains(kw));

    if in_subject(NOTIFICATION) {
        "notifications"
    } else if in_subject(NEWSLETTER) || in_sender(NEWSLETTER) {
        "newsletters"
    } else if in_sender(SOCIAL) {
        "social"
    } else if in_subject(SHOPPING) || in_sender(SHOPPING) {
        "shopping"
    } else if in_subject(WORK) {
        "work"
    } else if sender.contains('@') && !in_sender(AUTOMATED) {
        "personal"
    } else {
        "other"
    }
}

/// Artifact fields for the message at `index` of the analyzed batch.
pub fn derive_artifact(
    message: &FetchedMessage,
    index: usize,
    insights: &BatchInsights,
) -> ArtifactFields {
    let address = message.sender_address.trim().to_ascii_lowercase();
    let sender_cluster = insights
        .sender_patterns
        .top_senders
        .iter()
        .take(RANKED_SENDERS)
        .position(|sender| sender.email == address)
        .map(|rank| format!("sender_top_{}", rank + 1))
        .unwrap_or_else(|| "sender_other".to_string());

    let subject_cluster = match insights.subject_assignments.get(index) {
        Some(&id) if id != subjects::UNCLUSTERED_ID => format!("subject_cluster_{id}"),
        _ => "subject_unclustered".to_string(),
    };

    ArtifactFields {
        sender_cluster,
        subject_cluster,
        category: categorize(message).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{categorize, derive_artifact, Analyzer, KeywordAnalyzer};
    use crate::connectors::FetchedMessage;

    fn message(id: &str, sender: &str, subject: &str, hour: u32, day: u32) -> FetchedMessage {
        FetchedMessage {
            provider_message_id: id.to_string(),
            sender_address: sender.to_string(),
            sender_name: None,
            subject: subject.to_string(),
            received_at: Utc
                .with_ymd_and_hms(2024, 1, day, hour, 0, 0)
                .single()
                .expect("valid timestamp"),
            thread_id: None,
            snippet: String::new(),
        }
    }

    fn batch() -> Vec<FetchedMessage> {
        vec![
            message("1", "alerts@bank.com", "Security alert for your account", 9, 1),
            message("2", "alice@example.com", "Project kickoff meeting", 9, 1),
            message("3", "alice@example.com", "Project kickoff meeting notes", 14, 2),
            message("4", "news@digest.io", "The weekly roundup", 9, 2),
            message("5", "no-reply@shop.com", "Your order has shipped", 20, 3),
        ]
    }

    #[test]
    fn batch_insights_count_senders_categories_and_frequency() {
        let insights = KeywordAnalyzer.analyze(&batch()).expect("analyze");

        assert_eq!(insights.total_messages, 5);
        assert_eq!(insights.unique_senders, 4);
        let top = &insights.sender_patterns.top_senders[0];
        assert_eq!(top.email, "alice@example.com");
        assert_eq!(top.count, 2);
        assert!((top.percentage - 40.0).abs() < f64::EPSILON);

        assert_eq!(insights.categories["notifications"], 1);
        assert_eq!(insights.categories["work"], 2);
        assert_eq!(insights.categories["newsletters"], 1);
        assert_eq!(insights.categories["shopping"], 1);
        assert_eq!(insights.categories["other"], 0);

        let frequency = &insights.frequency_stats;
        assert_eq!(frequency.peak_hour, Some(9));
        assert!((frequency.daily_average - 1.67).abs() < 1e-9);
        assert_eq!(frequency.peak_day.as_deref(), Some("Monday"));
    }

    #[test]
    fn empty_batch_yields_empty_insights() {
        let insights = KeywordAnalyzer.analyze(&[]).expect("analyze");
        assert_eq!(insights.total_messages, 0);
        assert!(insights.subject_clusters.is_empty());
    }

    #[test]
    fn artifact_fields_follow_rank_cluster_and_category() {
        let messages = batch();
        let insights = KeywordAnalyzer.analyze(&messages).expect("analyze");

        let fields = derive_artifact(&messages[1], 1, &insights);
        assert_eq!(fields.sender_cluster, "sender_top_1");
        assert_eq!(fields.subject_cluster, "subject_cluster_0");
        assert_eq!(fields.category, "work");

        let lone = derive_artifact(&messages[0], 0, &insights);
        assert_eq!(lone.subject_cluster, "subject_unclustered");
        assert_eq!(lone.category, categorize(&messages[0]));
    }

    #[test]
    fn personal_requires_a_human_sender() {
        assert_eq!(categorize(&message("a", "friend@example.com", "Dinner?", 1, 1)), "personal");
        assert_eq!(categorize(&message("b", "noreply@example.com", "Hello", 1, 1)), "other");
        assert_eq!(categorize(&message("c", "", "Hello", 1, 1)), "other");
    }
}
