//! Ticket input and analysis output shapes shared by the engine and transport.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{SessionId, ToolCallId};
use crate::state::{Slot, State};

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketCategory {
    BugReport,
    FeatureRequest,
    PerformanceIssue,
    UiUxIssue,
    AccountIssue,
    Other,
}

impl TicketCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketCategory::BugReport => "BUG_REPORT",
            TicketCategory::FeatureRequest => "FEATURE_REQUEST",
            TicketCategory::PerformanceIssue => "PERFORMANCE_ISSUE",
            TicketCategory::UiUxIssue => "UI_UX_ISSUE",
            TicketCategory::AccountIssue => "ACCOUNT_ISSUE",
            TicketCategory::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            TicketCategory::BugReport,
            TicketCategory::FeatureRequest,
            TicketCategory::PerformanceIssue,
            TicketCategory::UiUxIssue,
            TicketCategory::AccountIssue,
            TicketCategory::Other,
        ]
        .into_iter()
        .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Derive a category from free-form classifier output.
    ///
    /// An explicit label (`BUG_REPORT`, ...) wins. Otherwise keywords are
    /// matched word by word, in priority order bug > feature > performance >
    /// UI > account.
    pub fn from_classification(text: &str) -> Self {
        let upper = text.to_uppercase();
        for label in ["BUG_REPORT", "FEATURE_REQUEST", "PERFORMANCE_ISSUE", "UI_UX_ISSUE", "ACCOUNT_ISSUE"] {
            if upper.contains(label) {
                if let Some(category) = Self::parse(label) {
                    return category;
                }
            }
        }

        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        let has = |keys: &[&str]| words.iter().any(|w| keys.contains(&w.as_str()));

        if has(&["bug", "bugs", "crash", "crashes", "crashed", "error", "broken"]) {
            TicketCategory::BugReport
        } else if has(&["feature", "suggestion", "request", "enhancement"]) {
            TicketCategory::FeatureRequest
        } else if has(&["performance", "slow", "lag", "latency", "freeze"]) {
            TicketCategory::PerformanceIssue
        } else if has(&["ui", "ux", "interface", "layout", "display"]) {
            TicketCategory::UiUxIssue
        } else if has(&["account", "password", "login", "signin"]) {
            TicketCategory::AccountIssue
        } else {
            TicketCategory::Other
        }
    }
}

impl fmt::Display for TicketCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a ticket id of the form `TICKET-1A2B3C4D`.
pub fn generate_ticket_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("TICKET-{}", raw[..8].to_uppercase())
}

/// A user feedback ticket as submitted by a client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackTicket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_request: String,
    #[serde(default)]
    pub problem_description: String,
    #[serde(default)]
    pub screenshots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<TicketCategory>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl FeedbackTicket {
    /// Assign a generated id if the ticket has none, returning the id.
    pub fn ensure_ticket_id(&mut self) -> String {
        match &self.ticket_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let id = generate_ticket_id();
                self.ticket_id = Some(id.clone());
                id
            }
        }
    }

    /// Key used by the classification cache.
    pub fn cache_key(&self) -> String {
        format!("{}{}", self.user_request, self.problem_description)
    }

    /// Text handed to the pipeline as its `input` slot.
    pub fn analysis_input(&self) -> String {
        let or_na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
        format!(
            "Please analyze the following user feedback ticket:\n\n\
             User ID: {}\n\
             User request: {}\n\
             Problem description: {}\n\
             Phone model: {}\n\
             App version: {}\n\
             Feedback time: {}\n\
             Screenshot count: {}\n",
            or_na(&self.user_id),
            self.user_request,
            self.problem_description,
            or_na(&self.phone_model),
            or_na(&self.app_version),
            self.feedback_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "N/A".to_string()),
            self.screenshots.len(),
        )
    }

    /// Text indexed for similarity search once the ticket is stored.
    pub fn document_text(&self) -> String {
        let mut text = format!(
            "User request: {}\nProblem description: {}",
            self.user_request, self.problem_description
        );
        if let Some(model) = &self.phone_model {
            text.push_str(&format!("\nPhone model: {model}"));
        }
        if let Some(version) = &self.app_version {
            text.push_str(&format!("\nApp version: {version}"));
        }
        if let Some(category) = &self.category {
            text.push_str(&format!("\nCategory: {category}"));
        }
        text
    }

    /// Metadata attached to the indexed document.
    pub fn index_metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut meta = serde_json::Map::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(v) = value {
                meta.insert(key.to_string(), serde_json::Value::String(v));
            }
        };
        put("ticketId", self.ticket_id.clone());
        put("userId", self.user_id.clone());
        put("userRequest", Some(self.user_request.clone()));
        put("problemDescription", Some(self.problem_description.clone()));
        put("feedbackTime", self.feedback_time.map(|t| t.to_rfc3339()));
        put("phoneModel", self.phone_model.clone());
        put("appVersion", self.app_version.clone());
        put("category", self.category.map(|c| c.as_str().to_string()));
        meta
    }
}

/// A prior ticket returned by similarity search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarTicket {
    pub ticket_id: String,
    pub excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_description: Option<String>,
    pub similarity: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Completed,
    AwaitingApproval,
    Failed,
    Cached,
}

/// A tool call waiting on a human decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub invocation_id: ToolCallId,
    pub stage: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub success: bool,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<TicketCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause_analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact_assessment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_proposal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_report: Option<String>,
    #[serde(default)]
    pub similar_tickets: Vec<SimilarTicket>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncated_stages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_approvals: Vec<PendingApproval>,
}

impl AnalysisResult {
    fn empty(success: bool, status: AnalysisStatus) -> Self {
        Self {
            success,
            status,
            from_cache: false,
            ticket_id: None,
            session_id: None,
            error_message: None,
            category: None,
            root_cause_analysis: None,
            impact_assessment: None,
            solution_proposal: None,
            final_report: None,
            similar_tickets: Vec::new(),
            truncated_stages: Vec::new(),
            warnings: Vec::new(),
            pending_approvals: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let mut result = Self::empty(false, AnalysisStatus::Failed);
        result.error_message = Some(message.into());
        result
    }

    pub fn cached(category: TicketCategory) -> Self {
        let mut result = Self::empty(true, AnalysisStatus::Cached);
        result.from_cache = true;
        result.category = Some(category);
        result
    }

    /// Project the analysis slots of a session state into a result.
    pub fn from_state(state: &State, success: bool, status: AnalysisStatus) -> Self {
        let mut result = Self::empty(success, status);
        let text = |slot| state.get(slot).map(|v| v.render());
        result.category = text(Slot::ClassificationResult)
            .map(|c| TicketCategory::from_classification(&c));
        result.root_cause_analysis = text(Slot::RootCauseAnalysis);
        result.impact_assessment = text(Slot::ImpactAssessment);
        result.solution_proposal = text(Slot::SolutionProposal);
        result.final_report = text(Slot::FinalReport);
        result.similar_tickets = state
            .get(Slot::SimilarTickets)
            .and_then(|v| v.as_json())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        result
    }
}
