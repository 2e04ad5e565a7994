use amqp_bus::topic_matches;
use chrono::{TimeZone, Utc};
use grade_contracts::{binding_key, routing_key, GradeEvent, GRADES_DOMAIN};
use proptest::prelude::*;

proptest! {
    #[test]
    fn routing_key_is_prefix_plus_normalized_subject(subject in "\\PC{0,24}") {
        let key = routing_key(GRADES_DOMAIN, &subject);
        prop_assert_eq!(key.clone(), format!("grades.new.{}", subject.trim().to_lowercase()));
        prop_assert_eq!(key, routing_key(GRADES_DOMAIN, &subject));
    }

    #[test]
    fn whitespace_and_case_do_not_change_the_key(
        subject in "[A-Za-z]{1,16}",
        left in "[ \t]{0,3}",
        right in "[ \t]{0,3}",
    ) {
        let padded = format!("{left}{}{right}", subject.to_uppercase());
        prop_assert_eq!(
            routing_key(GRADES_DOMAIN, &padded),
            routing_key(GRADES_DOMAIN, &subject.to_lowercase())
        );
    }

    #[test]
    fn single_word_subjects_match_the_worker_binding(subject in "[A-Za-z0-9_-]{1,20}") {
        let key = routing_key(GRADES_DOMAIN, &subject);
        prop_assert!(topic_matches(&binding_key(GRADES_DOMAIN), &key));
    }

    #[test]
    fn grade_event_round_trips(
        name in "\\PC{0,32}",
        subject in "\\PC{0,32}",
        grade in any::<i32>(),
        secs in 0i64..4_000_000_000,
    ) {
        let event = GradeEvent {
            student_name: name,
            subject,
            grade,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        };
        let body = serde_json::to_vec(&event).unwrap();
        let decoded: GradeEvent = serde_json::from_slice(&body).unwrap();
        prop_assert_eq!(decoded, event);
    }
}

#[test]
fn dotted_subject_is_not_matched_by_the_binding() {
    let key = routing_key(GRADES_DOMAIN, "Math.Advanced");
    assert_eq!(key, "grades.new.math.advanced");
    assert!(!topic_matches(&binding_key(GRADES_DOMAIN), &key));
}
