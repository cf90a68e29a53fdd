use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Token-set similarity required to join a cluster.
pub const SIMILARITY_THRESHOLD: f64 = 0.5;
/// Clusters smaller than this are reported as unclustered.
pub const MIN_CLUSTER_SIZE: usize = 2;
pub const UNCLUSTERED_ID: i64 = -1;
const MAX_SAMPLE_SUBJECTS: usize = 10;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "the", "to", "with", "your", "you", "our",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectCluster {
    pub cluster_id: i64,
    pub subjects: Vec<String>,
    pub count: usize,
    pub representative: String,
}

/// Cluster list plus the cluster id of every input subject, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubjectClustering {
    pub clusters: Vec<SubjectCluster>,
    pub assignments: Vec<i64>,
}

fn reply_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*((re|fwd?|fw|aw|sv)\s*(\[\d+\])?\s*:\s*)+").expect("valid regex")
    })
}

fn bracketed() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)").expect("valid regex"))
}

/// Drops reply/forward prefixes and bracketed fragments, lowercases.
pub fn clean_subject(subject: &str) -> String {
    let without_prefix = reply_prefix().replace(subject, "");
    let without_brackets = bracketed().replace_all(&without_prefix, " ");
    without_brackets
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn tokenize(subject: &str) -> BTreeSet<String> {
    clean_subject(subject)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() > 1 && !STOP_WORDS.contains(token))
        .map(str::to_string)
        .collect()
}

pub fn jaccard(left: &BTreeSet<String>, right: &BTreeSet<String>) -> f64 {
    if left.is_empty() && right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(right).count() as f64;
    let union = left.union(right).count() as f64;
    shared / union
}

/// Greedy single pass: each subject joins the first existing cluster whose
/// seed it resembles, otherwise seeds a new one. Cluster ids follow creation
/// order among the clusters that reach [`MIN_CLUSTER_SIZE`]; the unclustered
/// bucket, when non-empty, is listed last with id -1.
pub fn cluster_subjects(subjects: &[String]) -> SubjectClustering {
    struct Draft {
        seed: BTreeSet<String>,
        members: Vec<usize>,
    }

    let mut drafts: Vec<Draft> = Vec::new();
    let mut draft_of = vec![None; subjects.len()];

    for (index, subject) in subjects.iter().enumerate() {
        let tokens = tokenize(subject);
        if tokens.is_empty() {
            continue;
        }
        match drafts
            .iter()
            .position(|draft| jaccard(&draft.seed, &tokens) >= SIMILARITY_THRESHOLD)
        {
            Some(position) => {
                drafts[position].members.push(index);
                draft_of[index] = Some(position);
            }
            None => {
                draft_of[index] = Some(drafts.len());
                drafts.push(Draft {
                    seed: tokens,
                    members: vec![index],
                });
            }
        }
    }

    let mut final_id = vec![UNCLUSTERED_ID; drafts.len()];
    let mut clusters = Vec::new();
    for (position, draft) in drafts.iter().enumerate() {
        if draft.members.len() < MIN_CLUSTER_SIZE {
            continue;
        }
        let cluster_id = clusters.len() as i64;
        final_id[position] = cluster_id;
        let member_subjects = draft
            .members
            .iter()
            .map(|&member| subjects[member].clone())
            .collect::<Vec<_>>();
        clusters.push(SubjectCluster {
            cluster_id,
            representative: representative(&member_subjects),
            count: member_subjects.len(),
            subjects: member_subjects.into_iter().take(MAX_SAMPLE_SUBJECTS).collect(),
        });
    }

    let assignments = draft_of
        .iter()
        .map(|draft| draft.map_or(UNCLUSTERED_ID, |position| final_id[position]))
        .collect::<Vec<_>>();

    let unclustered = assignments
        .iter()
        .filter(|&&id| id == UNCLUSTERED_ID)
        .count();
    if unclustered > 0 {
        clusters.push(SubjectCluster {
            cluster_id: UNCLUSTERED_ID,
            subjects: Vec::new(),
            count: unclustered,
            representative: "Unclustered emails".to_string(),
        });
    }

    SubjectClustering {
        clusters,
        assignments,
    }
}

/// Shortest non-blank subject; usually the most generic one.
fn representative(subjects: &[String]) -> String {
    subjects
        .iter()
        .map(|subject| subject.trim())
        .filter(|subject| !subject.is_empty())
        .min_by_key(|subject| subject.chars().count())
        .map(str::to_string)
        .unwrap_or_default()
}
