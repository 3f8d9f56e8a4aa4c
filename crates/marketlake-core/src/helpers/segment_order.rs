//! Segment ordering helpers.
//!
//! Segments are read in a deterministic order: by `ts_min`, then `ts_max`,
//! and finally `segment_id`, whose commit-version prefix makes the tie
//! breaker follow write order.

use std::cmp::Ordering;

use crate::transaction_log::SegmentMeta;

pub(crate) fn cmp_segment_meta_by_time(a: &SegmentMeta, b: &SegmentMeta) -> Ordering {
    a.ts_min
        .cmp(&b.ts_min)
        .then_with(|| a.ts_max.cmp(&b.ts_max))
        .then_with(|| a.segment_id.cmp(&b.segment_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction_log::SegmentId;
    use chrono::DateTime;

    fn seg(id: &str, ts_min: i64, ts_max: i64) -> SegmentMeta {
        SegmentMeta {
            segment_id: SegmentId(id.to_string()),
            path: format!("data/{id}.parquet"),
            ts_min: DateTime::from_timestamp(ts_min, 0).expect("ts").naive_utc(),
            ts_max: DateTime::from_timestamp(ts_max, 0).expect("ts").naive_utc(),
            row_count: 1,
            entities: None,
        }
    }

    #[test]
    fn ordering_is_deterministic_with_tie_breakers() {
        let mut v = vec![
            seg("c", 10, 20),
            seg("b", 10, 20),
            seg("a", 10, 30),
            seg("d", 5, 7),
        ];

        v.sort_unstable_by(cmp_segment_meta_by_time);

        let ids: Vec<String> = v.into_iter().map(|s| s.segment_id.0).collect();
        assert_eq!(ids, vec!["d", "b", "c", "a"]);
    }
}
