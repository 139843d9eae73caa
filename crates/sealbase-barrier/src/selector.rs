//! Deterministic active-key selection.
//!
//! Every "current key" lookup in the system goes through [`select_active`].
//! It is a pure function of the candidate rows: among eligible candidates it
//! picks the one with the latest creation time, breaking timestamp ties by
//! id. Two service instances racing the same query therefore converge on the
//! same winner without any distributed lock or shared cache.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::BarrierError;

/// A row that can compete to be the active key of its scope.
pub trait KeyCandidate {
    fn candidate_id(&self) -> Uuid;
    fn candidate_created_at(&self) -> DateTime<Utc>;
    /// Whether this row is still eligible to be active (not yet rotated
    /// out, or still flagged active, depending on the record type).
    fn is_eligible(&self) -> bool;
}

/// Pick the active key among `candidates`: eligible, maximum `created_at`,
/// ties broken by maximum id. Fails with `NoActiveKey` when no eligible
/// candidate exists, which is fatal for that scope.
pub fn select_active<'a, C: KeyCandidate>(
    candidates: &'a [C],
    scope: &str,
) -> Result<&'a C, BarrierError> {
    candidates
        .iter()
        .filter(|c| c.is_eligible())
        .max_by(|a, b| {
            (a.candidate_created_at(), a.candidate_id())
                .cmp(&(b.candidate_created_at(), b.candidate_id()))
        })
        .ok_or_else(|| BarrierError::NoActiveKey {
            scope: scope.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Row {
        id: Uuid,
        created_at: DateTime<Utc>,
        eligible: bool,
    }

    impl KeyCandidate for Row {
        fn candidate_id(&self) -> Uuid {
            self.id
        }
        fn candidate_created_at(&self) -> DateTime<Utc> {
            self.created_at
        }
        fn is_eligible(&self) -> bool {
            self.eligible
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn row(secs: i64, eligible: bool) -> Row {
        Row {
            id: Uuid::new_v4(),
            created_at: at(secs),
            eligible,
        }
    }

    #[test]
    fn picks_latest_eligible() {
        let rows = vec![row(10, true), row(30, true), row(20, true)];
        let winner = select_active(&rows, "test").unwrap();
        assert_eq!(winner.candidate_created_at(), at(30));
    }

    #[test]
    fn ignores_ineligible_rows() {
        let rows = vec![row(10, true), row(99, false)];
        let winner = select_active(&rows, "test").unwrap();
        assert_eq!(winner.candidate_created_at(), at(10));
    }

    #[test]
    fn breaks_timestamp_tie_by_id() {
        let id_a = Uuid::from_u128(1);
        let id_b = Uuid::from_u128(2);
        let rows = vec![
            Row {
                id: id_a,
                created_at: at(50),
                eligible: true,
            },
            Row {
                id: id_b,
                created_at: at(50),
                eligible: true,
            },
        ];
        assert_eq!(select_active(&rows, "test").unwrap().candidate_id(), id_b);

        // Same winner regardless of row order.
        let reversed: Vec<Row> = rows.into_iter().rev().collect();
        assert_eq!(
            select_active(&reversed, "test").unwrap().candidate_id(),
            id_b
        );
    }

    #[test]
    fn deterministic_across_permutations() {
        let rows: Vec<Row> = (0..8).map(|i| row(i % 3, true)).collect();
        let winner = select_active(&rows, "test").unwrap().candidate_id();
        let mut shuffled: Vec<Row> = rows.into_iter().rev().collect();
        shuffled.rotate_left(3);
        assert_eq!(
            select_active(&shuffled, "test").unwrap().candidate_id(),
            winner
        );
    }

    #[test]
    fn empty_set_is_no_active_key() {
        let rows: Vec<Row> = Vec::new();
        match select_active(&rows, "content") {
            Err(BarrierError::NoActiveKey { scope }) => assert_eq!(scope, "content"),
            other => panic!("expected NoActiveKey, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn all_ineligible_is_no_active_key() {
        let rows = vec![row(1, false), row(2, false)];
        assert!(matches!(
            select_active(&rows, "x"),
            Err(BarrierError::NoActiveKey { .. })
        ));
    }
}
