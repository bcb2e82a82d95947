//! JSON endpoints outside the run stream: the constitution library,
//! submissions and superego checks, the marketplace, and the admin review
//! queue.
//!
//! Every call clears the Global Error Slot first and records a
//! human-readable message there on failure.

use super::client::{encode_path_segment, ApiClient};
use crate::error::ApiError;
use crate::store::ErrorSlot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;

/// One constitution file in the library.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConstitutionInfo {
    pub relative_path: String,
    pub title: String,
}

/// Library folder tree.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ConstitutionHierarchy {
    #[serde(default)]
    pub constitutions: Vec<ConstitutionInfo>,
    #[serde(default)]
    pub subdirectories: Vec<ConstitutionFolder>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ConstitutionFolder {
    pub name: String,
    #[serde(default, rename = "relativePath")]
    pub relative_path: String,
    #[serde(default)]
    pub constitutions: Vec<ConstitutionInfo>,
    #[serde(default)]
    pub subdirectories: Vec<ConstitutionFolder>,
}

impl ConstitutionHierarchy {
    /// Depth-first list of every constitution in the tree.
    pub fn flatten(&self) -> Vec<&ConstitutionInfo> {
        fn walk<'a>(folder: &'a ConstitutionFolder, out: &mut Vec<&'a ConstitutionInfo>) {
            out.extend(folder.constitutions.iter());
            for child in &folder.subdirectories {
                walk(child, out);
            }
        }
        let mut out: Vec<&ConstitutionInfo> = self.constitutions.iter().collect();
        for folder in &self.subdirectories {
            walk(folder, &mut out);
        }
        out
    }
}

/// New constitution sent for hosting and, when public, review.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ConstitutionSubmission {
    pub text: String,
    pub is_private: bool,
    pub is_unlisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SubmissionResponse {
    pub status: String,
    pub message: String,
    #[serde(default)]
    pub email_sent: bool,
    #[serde(default)]
    pub submission_id: Option<String>,
    #[serde(default, rename = "shareableLink")]
    pub shareable_link: Option<String>,
}

/// Result of a dry-run superego check.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SuperegoCheck {
    pub score: u8,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub passed_checks: Vec<String>,
}

/// Marketplace entry from the trending listing.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TrendingConstitution {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub analytics: Value,
}

impl TrendingConstitution {
    pub fn trend_score(&self) -> Option<f64> {
        self.analytics.get("trend_score").and_then(Value::as_f64)
    }
}

/// Review decision an admin can record.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        })
    }
}

/// Submission waiting in (or decided by) the admin review queue.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReviewSubmission {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub superego_result: Option<SuperegoCheck>,
    pub status: ReviewStatus,
    #[serde(default)]
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub reviewer_comments: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ReviewDecision<'a> {
    status: ReviewStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    reviewer_comments: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    text: &'a str,
}

/// REST facade that reports failures through the Global Error Slot.
#[derive(Clone)]
pub struct RestClient {
    api: ApiClient,
    errors: ErrorSlot,
}

impl RestClient {
    pub fn new(api: ApiClient, errors: ErrorSlot) -> Self {
        Self { api, errors }
    }

    pub async fn list_constitutions(&self) -> Result<ConstitutionHierarchy, ApiError> {
        self.reported("load constitutions", self.api.get_json("/api/constitutions"))
            .await
    }

    pub async fn constitution_content(&self, relative_path: &str) -> Result<String, ApiError> {
        let path = format!(
            "/api/constitutions/{}/content",
            encode_relative_path(relative_path)
        );
        self.reported("load constitution", self.api.get_text(&path))
            .await
    }

    pub async fn submit_constitution(
        &self,
        submission: &ConstitutionSubmission,
    ) -> Result<SubmissionResponse, ApiError> {
        self.reported(
            "submit constitution",
            self.api.post_json("/api/constitutions", submission),
        )
        .await
    }

    pub async fn check_constitution(&self, text: &str) -> Result<SuperegoCheck, ApiError> {
        self.reported(
            "check constitution",
            self.api
                .post_json("/api/constitutions/check", &CheckRequest { text }),
        )
        .await
    }

    pub async fn trending(&self, limit: u32) -> Result<Vec<TrendingConstitution>, ApiError> {
        let path = format!("/api/analytics/trending?limit={}", limit.clamp(1, 50));
        self.reported("load marketplace", self.api.get_json(&path))
            .await
    }

    pub async fn pending_reviews(&self) -> Result<Vec<ReviewSubmission>, ApiError> {
        self.reported("load reviews", self.api.get_json("/api/admin/reviews"))
            .await
    }

    pub async fn decide_review(
        &self,
        submission_id: &str,
        status: ReviewStatus,
        comments: Option<&str>,
    ) -> Result<ReviewSubmission, ApiError> {
        let path = format!("/api/admin/reviews/{}", encode_path_segment(submission_id));
        let body = ReviewDecision {
            status,
            reviewer_comments: comments,
        };
        self.reported("update review", self.api.post_json(&path, &body))
            .await
    }

    async fn reported<T, F>(&self, action: &str, call: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        self.errors.clear();
        let result = call.await;
        if let Err(err) = &result {
            self.errors.set(format!("Failed to {action}: {err}"));
        }
        result
    }
}

/// Encode each `/`-separated segment, keeping the separators.
fn encode_relative_path(path: &str) -> String {
    path.trim_matches('/')
        .split('/')
        .map(encode_path_segment)
        .collect::<Vec<_>>()
        .join("/")
}
