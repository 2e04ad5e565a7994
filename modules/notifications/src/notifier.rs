//! Grade notification handler
//!
//! Delivery is at-least-once, so the same grade event can arrive again after
//! a requeue or a reconnect. The notifier remembers the events it already
//! notified about and skips repeats.

use amqp_bus::{DeliveryContext, EventHandler};
use async_trait::async_trait;
use grade_contracts::GradeEvent;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// How many processed events are remembered for duplicate suppression
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Sends (logs) an email notification for each new grade
#[derive(Debug)]
pub struct GradeNotifier {
    capacity: usize,
    processed: Mutex<Processed>,
}

#[derive(Debug, Default)]
struct Processed {
    seen: HashSet<GradeEvent>,
    order: VecDeque<GradeEvent>,
    sent: u64,
}

impl GradeNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DEDUP_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            processed: Mutex::new(Processed::default()),
        }
    }

    /// Number of notifications sent so far
    pub fn sent_count(&self) -> u64 {
        self.processed().sent
    }

    fn processed(&self) -> MutexGuard<'_, Processed> {
        self.processed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `event` as notified; `false` if it already was
    fn remember(&self, event: &GradeEvent) -> bool {
        let mut processed = self.processed();
        if !processed.seen.insert(event.clone()) {
            return false;
        }
        processed.order.push_back(event.clone());
        if processed.order.len() > self.capacity {
            if let Some(oldest) = processed.order.pop_front() {
                processed.seen.remove(&oldest);
            }
        }
        processed.sent += 1;
        true
    }

    fn already_notified(&self, event: &GradeEvent) -> bool {
        self.processed().seen.contains(event)
    }
}

impl Default for GradeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// One-line summary of a grade event
pub fn describe(event: &GradeEvent) -> String {
    format!(
        "Student '{}' received '{}' in subject '{}'",
        event.student_name, event.grade, event.subject
    )
}

#[async_trait]
impl EventHandler<GradeEvent> for GradeNotifier {
    async fn handle(&self, event: GradeEvent, ctx: &DeliveryContext) -> anyhow::Result<()> {
        tracing::info!(
            routing_key = %ctx.routing_key,
            delivery_tag = ctx.delivery_tag,
            redelivered = ctx.redelivered,
            "Grade event received"
        );

        if self.already_notified(&event) {
            tracing::info!(
                student_name = %event.student_name,
                subject = %event.subject,
                "Duplicate grade event; notification already sent"
            );
            return Ok(());
        }

        tracing::info!(processed = %describe(&event), "Grade event processed");
        tracing::info!(
            student_name = %event.student_name,
            channel = "email",
            "[NOTIFY] Email notification sent"
        );
        self.remember(&event);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_bus::TraceContext;
    use chrono::Utc;

    fn event(name: &str, grade: i32) -> GradeEvent {
        GradeEvent {
            student_name: name.to_string(),
            subject: "Mathematics".to_string(),
            grade,
            timestamp: Utc::now(),
        }
    }

    fn ctx(redelivered: bool) -> DeliveryContext {
        DeliveryContext {
            delivery_tag: 1,
            exchange: "grades_exchange".to_string(),
            routing_key: "grades.new.mathematics".to_string(),
            redelivered,
            trace: TraceContext::new_root(),
            parent: None,
        }
    }

    #[test]
    fn test_describe() {
        let e = event("Ivan Petrenko", 5);
        assert_eq!(
            describe(&e),
            "Student 'Ivan Petrenko' received '5' in subject 'Mathematics'"
        );
    }

    #[tokio::test]
    async fn test_notifies_each_event_once() {
        let notifier = GradeNotifier::new();
        let e = event("Ivan", 5);

        notifier.handle(e.clone(), &ctx(false)).await.unwrap();
        notifier.handle(e.clone(), &ctx(true)).await.unwrap();
        assert_eq!(notifier.sent_count(), 1);

        notifier.handle(event("Olena", 4), &ctx(false)).await.unwrap();
        assert_eq!(notifier.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_oldest_events_are_forgotten_past_capacity() {
        let notifier = GradeNotifier::with_capacity(2);
        let first = event("A", 1);

        notifier.handle(first.clone(), &ctx(false)).await.unwrap();
        notifier.handle(event("B", 2), &ctx(false)).await.unwrap();
        notifier.handle(event("C", 3), &ctx(false)).await.unwrap();
        assert!(!notifier.already_notified(&first));

        notifier.handle(first, &ctx(true)).await.unwrap();
        assert_eq!(notifier.sent_count(), 4);
    }
}
