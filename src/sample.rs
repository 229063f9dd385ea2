//! Generated demo tables for running the dashboard without data files.
//!
//! The generators produce [`Table`]s in the same shape as the real exports,
//! so they go through exactly the same parsing as loaded files.

use crate::detection::{DETECTION_COLUMNS, DETECTION_TYPES, Judgement};
use crate::loader::Table;
use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const SAMPLE_LOG_ROWS: usize = 30;
pub const SAMPLE_RECORDS: usize = 50;

const SAMPLE_LCL: f64 = 2.0;
const SAMPLE_UCL: f64 = 8.0;

fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// A 30-row execution log starting on 2021-01-01, cycling through the
/// detection categories
pub fn execution_table(seed: Option<u64>) -> Table {
    let mut rng = rng_for(seed);
    let start = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap_or(NaiveDate::MIN);

    let rows = (0..SAMPLE_LOG_ROWS)
        .map(|i| {
            let date = start + Duration::days(i as i64);
            vec![
                (i + 1).to_string(),
                date.format("%Y-%m-%d").to_string(),
                DETECTION_TYPES[i % DETECTION_TYPES.len()].key.to_string(),
                rng.gen_range(100..200).to_string(),
                format!("メモ{}", i + 1),
            ]
        })
        .collect();

    Table::new(
        "sample execution log",
        ["ID", "更新日", "異常検知種", "Value", "Memo"]
            .iter()
            .map(|c| c.to_string())
            .collect(),
        rows,
    )
}

/// 50 detection results over three products and three tests
///
/// Scores are uniform in `[0, 10)`, judged against fixed limits of 2 and 8.
pub fn detection_table(seed: Option<u64>) -> Table {
    let mut rng = rng_for(seed);

    let rows = (0..SAMPLE_RECORDS)
        .map(|i| {
            let score = (rng.gen_range(0.0..10.0_f64) * 100.0).round() / 100.0;
            let judge = Judgement::from_limits(score, Some(SAMPLE_LCL), Some(SAMPLE_UCL));
            vec![
                (i + 1).to_string(),
                DETECTION_TYPES[i % DETECTION_TYPES.len()].key.to_string(),
                format!("製品{}", i % 3 + 1),
                format!("test{}", (i / 4) % 3 + 1),
                score.to_string(),
                judge.label().to_string(),
                SAMPLE_LCL.to_string(),
                SAMPLE_UCL.to_string(),
                "data/files/data_19.zip".to_string(),
                format!(r"data\graphs\sample\record_{}.png", i + 1),
            ]
        })
        .collect();

    Table::new(
        "sample detections",
        DETECTION_COLUMNS.iter().map(|c| c.to_string()).collect(),
        rows,
    )
}
