//! # Grade Contracts
//!
//! The grade event as it travels between the academic service and the
//! notification worker, plus the routing rules for the grades exchange.
//!
//! Wire format (JSON, UTF-8, non-ASCII left unescaped):
//!
//! ```json
//! { "studentName": "Ivan Petrenko", "subject": "Mathematics", "grade": 5,
//!   "timestamp": "2024-05-01T10:00:00Z" }
//! ```

mod settings;

pub use settings::{BusSettings, DEFAULT_AMQP_URL};

use amqp_bus::DomainEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default topic exchange carrying grade events
pub const GRADES_EXCHANGE: &str = "grades_exchange";

/// Default first segment of every grade routing key
pub const GRADES_DOMAIN: &str = "grades";

/// Errors for grade submissions that cannot be published
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("{0} is required")]
    MissingField(&'static str),
}

/// A grade as submitted by a client, before it is stamped
///
/// Any `timestamp` in the request body is ignored; the producer stamps the
/// event when it is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSubmission {
    pub student_name: String,
    pub subject: String,
    pub grade: i32,
}

impl GradeSubmission {
    pub fn new(student_name: impl Into<String>, subject: impl Into<String>, grade: i32) -> Self {
        Self {
            student_name: student_name.into(),
            subject: subject.into(),
            grade,
        }
    }

    /// Reject submissions with a blank student name or subject
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.student_name.trim().is_empty() {
            return Err(ContractError::MissingField("studentName"));
        }
        if self.subject.trim().is_empty() {
            return Err(ContractError::MissingField("subject"));
        }
        Ok(())
    }
}

impl DomainEvent for GradeSubmission {
    type Stamped = GradeEvent;

    fn stamp(self, at: DateTime<Utc>) -> GradeEvent {
        GradeEvent {
            student_name: self.student_name,
            subject: self.subject,
            grade: self.grade,
            timestamp: at,
        }
    }
}

/// A stamped grade event, exactly as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeEvent {
    pub student_name: String,
    pub subject: String,
    pub grade: i32,
    pub timestamp: DateTime<Utc>,
}

impl GradeEvent {
    /// Routing key for this event under `domain`
    pub fn routing_key(&self, domain: &str) -> String {
        routing_key(domain, &self.subject)
    }
}

/// `"<domain>.new." + lowercase(trim(subject))`
///
/// Pure and total: the subject is not otherwise sanitized, so a subject
/// containing `.` yields a key with more words than the worker binding
/// matches.
///
/// ```
/// assert_eq!(grade_contracts::routing_key("grades", " Biology "), "grades.new.biology");
/// ```
pub fn routing_key(domain: &str, subject: &str) -> String {
    format!("{}.new.{}", domain, subject.trim().to_lowercase())
}

/// Wildcard binding matching every subject under `domain`
pub fn binding_key(domain: &str) -> String {
    format!("{domain}.new.*")
}
