use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

use kindred_realtime::channel::{ChangeKind, RowChange, RowFilter};
use kindred_realtime::{OnlineSet, PresenceEvent, PresenceMeta, TypingSignal, TypingState};

// --- Presence convergence ---

fn arb_user() -> impl Strategy<Value = String> {
    (0u8..8).prop_map(|n| format!("u-{n}"))
}

fn arb_diff() -> impl Strategy<Value = PresenceEvent> {
    prop_oneof![
        arb_user().prop_map(|u| PresenceEvent::Join {
            meta: PresenceMeta::online(u)
        }),
        arb_user().prop_map(|u| PresenceEvent::Leave {
            meta: PresenceMeta::online(u)
        }),
    ]
}

proptest! {
    #[test]
    fn sync_is_authoritative(
        history in prop::collection::vec(arb_diff(), 0..40),
        payload in prop::collection::btree_set(arb_user(), 0..8),
    ) {
        let mut set = OnlineSet::new();
        for event in &history {
            set.apply(event);
        }
        set.apply(&PresenceEvent::Sync {
            members: payload.iter().map(|u| PresenceMeta::online(u.clone())).collect(),
        });

        let online: BTreeSet<String> = set.online_users().into_iter().collect();
        prop_assert_eq!(online, payload);
    }

    #[test]
    fn leave_after_join_removes(
        user in arb_user(),
        history in prop::collection::vec(arb_diff(), 0..20),
    ) {
        let mut set = OnlineSet::new();
        for event in &history {
            set.apply(event);
        }
        set.apply(&PresenceEvent::Join { meta: PresenceMeta::online(user.clone()) });
        set.apply(&PresenceEvent::Leave { meta: PresenceMeta::online(user.clone()) });
        prop_assert!(!set.is_online(&user));
    }
}

// --- Typing debounce ---

proptest! {
    #[test]
    fn burst_yields_single_start_and_stop(gaps in prop::collection::vec(0u64..1000, 0..50)) {
        let idle = Duration::from_millis(1000);
        let mut state = TypingState::new(idle);
        let mut now = Instant::now();
        let mut signals = Vec::new();

        signals.extend(state.on_keystroke(now));
        for gap in gaps {
            now += Duration::from_millis(gap);
            // A timer firing mid-burst never stops typing
            signals.extend(state.on_timer(now));
            signals.extend(state.on_keystroke(now));
        }
        signals.extend(state.on_timer(now + idle));

        prop_assert_eq!(signals, vec![TypingSignal::Start, TypingSignal::Stop]);
        prop_assert!(!state.is_typing());
    }

    #[test]
    fn gap_beyond_idle_starts_new_episode(episodes in 1usize..6) {
        let idle = Duration::from_millis(1000);
        let mut state = TypingState::new(idle);
        let mut now = Instant::now();
        let mut starts = 0;

        for _ in 0..episodes {
            if state.on_keystroke(now) == Some(TypingSignal::Start) {
                starts += 1;
            }
            now += idle + Duration::from_millis(1);
            state.on_timer(now);
        }
        prop_assert_eq!(starts, episodes);
    }
}

// --- Row filters ---

proptest! {
    #[test]
    fn row_filter_matches_only_its_column_value(target in "[a-f]{1,4}", other in "[a-f]{1,4}") {
        let filter = RowFilter::table("messages").eq("conversation_id", target.clone());
        let change = RowChange {
            table: "messages".into(),
            kind: ChangeKind::Insert,
            record: serde_json::json!({ "conversation_id": other.clone() }),
            old_record: None,
        };
        prop_assert_eq!(filter.matches(&change), target == other);
    }
}
