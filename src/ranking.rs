use std::cmp::Ordering;

use crate::models::DeliberationResult;
use crate::policy::RankingMode;

/// Highest average first, missing averages last, student id as the final
/// key so the order never depends on how rows arrived.
fn compare(a: &DeliberationResult, b: &DeliberationResult) -> Ordering {
    let by_average = match (a.average, b.average) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_average.then_with(|| a.student_id.cmp(&b.student_id))
}

pub fn assign_ranks(mut results: Vec<DeliberationResult>, mode: RankingMode) -> Vec<DeliberationResult> {
    results.sort_by(compare);

    let mut rank = 0;
    let mut previous: Option<Option<f64>> = None;
    for (position, result) in results.iter_mut().enumerate() {
        rank = match mode {
            RankingMode::Sequential => position as i32 + 1,
            RankingMode::SharedTies => {
                if previous == Some(result.average) {
                    rank
                } else {
                    rank + 1
                }
            }
        };
        previous = Some(result.average);
        result.rank = Some(rank);
    }

    results
}
