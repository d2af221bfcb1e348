//! Freshly-timed reminder messages for users whose reminder time moved.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use tracing::warn;

use crate::messages::CheckInReminderMessage;
use crate::types::{MessageId, UserId, UserSettingsCacheEntry};

use super::{ReconcileOutcome, parse_clock_time};

/// Parses a fixed UTC offset: `UTC`, `Z`, `+08:00`, `-0530` or `+08`.
pub fn parse_utc_offset(timezone: &str) -> Option<FixedOffset> {
    let tz = timezone.trim();
    if tz.eq_ignore_ascii_case("utc") || tz.eq_ignore_ascii_case("z") || tz == "GMT" {
        return Some(Utc.fix());
    }

    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Seconds from `now` until `remind_at` on `date` in `timezone`, or 0 if
/// that moment has passed or cannot be determined.
fn delay_until(date: NaiveDate, remind_at: &str, timezone: &str, now: DateTime<Utc>) -> u64 {
    let offset = parse_utc_offset(timezone).unwrap_or_else(|| {
        warn!(timezone, "unrecognized timezone; using UTC");
        Utc.fix()
    });
    let Some(time) = parse_clock_time(remind_at) else {
        warn!(remind_at, "unparseable remind_at; republishing without delay");
        return 0;
    };
    let Some(target) = date.and_time(time).and_local_timezone(offset).single() else {
        return 0;
    };
    let delay = target.with_timezone(&Utc) - now;
    u64::try_from(delay.num_seconds()).unwrap_or(0)
}

/// Builds the messages that reschedule `outcome.republish`.
///
/// Users are grouped by `(remind_at, timezone)` so every message carries a
/// single delay. Each message gets a `message_id` derived from the parent
/// message and its group, so redelivering the parent republishes under the
/// same IDs; `scheduled_at = now` and the live settings become its snapshots.
pub fn republish_messages(
    message: &CheckInReminderMessage,
    outcome: &ReconcileOutcome,
    live: &HashMap<UserId, UserSettingsCacheEntry>,
    now: DateTime<Utc>,
) -> Vec<CheckInReminderMessage> {
    let mut groups: BTreeMap<(&str, &str), Vec<(UserId, &UserSettingsCacheEntry)>> =
        BTreeMap::new();
    for user in &outcome.republish {
        match live.get(user) {
            Some(entry) => groups
                .entry((entry.remind_at.as_str(), entry.timezone.as_str()))
                .or_default()
                .push((*user, entry)),
            None => warn!(user = %user, "republish without live settings; dropping"),
        }
    }

    groups
        .into_iter()
        .map(|((remind_at, timezone), members)| CheckInReminderMessage {
            message_id: {
                let users: Vec<String> = members.iter().map(|(user, _)| user.to_string()).collect();
                let users = users.join(",");
                MessageId::derived(&message.message_id, &[remind_at, timezone, users.as_str()])
            },
            batch_id: message.batch_id.clone(),
            check_in_date: message.check_in_date,
            scheduled_at: now.to_rfc3339(),
            user_ids: members.iter().map(|(user, _)| *user).collect(),
            user_settings: members
                .iter()
                .map(|(user, entry)| (*user, entry.to_snapshot()))
                .collect(),
            delay_seconds: delay_until(message.check_in_date, remind_at, timezone, now),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{settings_entry, test_date};
    use crate::types::BatchId;
    use chrono::TimeZone;

    fn batch() -> CheckInReminderMessage {
        CheckInReminderMessage {
            message_id: MessageId::new("m-1"),
            batch_id: BatchId::new("b-1"),
            check_in_date: test_date(),
            scheduled_at: "2026-10-19T11:00:00Z".to_string(),
            user_ids: vec![UserId(1), UserId(2), UserId(3)],
            user_settings: BTreeMap::new(),
            delay_seconds: 0,
        }
    }

    #[test]
    fn offsets() {
        assert_eq!(parse_utc_offset("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_utc_offset("+08:00").unwrap().local_minus_utc(), 8 * 3600);
        assert_eq!(
            parse_utc_offset("-0530").unwrap().local_minus_utc(),
            -(5 * 3600 + 30 * 60)
        );
        assert_eq!(parse_utc_offset("+09").unwrap().local_minus_utc(), 9 * 3600);
        assert!(parse_utc_offset("Asia/Shanghai").is_none());
        assert!(parse_utc_offset("+08:75").is_none());
        assert!(parse_utc_offset("").is_none());
    }

    #[test]
    fn groups_by_time_and_zone() {
        // 12:00 UTC is 20:00 at +08:00.
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let live = HashMap::from([
            (UserId(1), settings_entry("21:00:00", 0)),
            (UserId(2), settings_entry("21:00:00", 0)),
            (UserId(3), settings_entry("21:30:00", 0)),
        ]);
        let outcome = ReconcileOutcome {
            republish: vec![UserId(1), UserId(2), UserId(3)],
            ..ReconcileOutcome::default()
        };

        let messages = republish_messages(&batch(), &outcome, &live, now);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].user_ids, vec![UserId(1), UserId(2)]);
        assert_eq!(messages[0].delay_seconds, 3600);
        assert_eq!(messages[1].user_ids, vec![UserId(3)]);
        assert_eq!(messages[1].delay_seconds, 5400);
        assert_ne!(messages[0].message_id, messages[1].message_id);
        for message in &messages {
            assert_ne!(message.message_id, MessageId::new("m-1"));
            assert_eq!(message.batch_id, BatchId::new("b-1"));
            assert_eq!(
                DateTime::parse_from_rfc3339(&message.scheduled_at).unwrap(),
                now
            );
        }
        assert_eq!(messages[1].user_settings[&UserId(3)].remind_at, "21:30:00");
    }

    #[test]
    fn redelivered_batch_republishes_under_the_same_ids() {
        let live = HashMap::from([
            (UserId(1), settings_entry("21:00:00", 0)),
            (UserId(3), settings_entry("21:30:00", 0)),
        ]);
        let outcome = ReconcileOutcome {
            republish: vec![UserId(1), UserId(3)],
            ..ReconcileOutcome::default()
        };
        let first_try = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let redelivery = Utc.with_ymd_and_hms(2026, 10, 19, 12, 5, 0).unwrap();

        let first: Vec<_> = republish_messages(&batch(), &outcome, &live, first_try)
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        let second: Vec<_> = republish_messages(&batch(), &outcome, &live, redelivery)
            .into_iter()
            .map(|m| m.message_id)
            .collect();

        assert_eq!(first, second);

        let mut other = batch();
        other.message_id = MessageId::new("m-2");
        let unrelated = republish_messages(&other, &outcome, &live, first_try);
        assert_ne!(unrelated[0].message_id, first[0]);
    }

    #[test]
    fn past_reminders_have_no_delay() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 15, 0, 0).unwrap();
        let live = HashMap::from([(UserId(1), settings_entry("21:00:00", 0))]);
        let outcome = ReconcileOutcome {
            republish: vec![UserId(1)],
            ..ReconcileOutcome::default()
        };

        let messages = republish_messages(&batch(), &outcome, &live, now);

        assert_eq!(messages[0].delay_seconds, 0);
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        assert_eq!(delay_until(test_date(), "13:00", "Mars/Olympus", now), 3600);
    }
}
