//! Formatted terminal output.
//!
//! Formatting lives here so the pipeline code stays free of layout details and
//! output changes stay in one place.

use std::collections::BTreeMap;
use std::path::Path;

use crate::dataset::{BuiltDataset, WindowStats};
use crate::domain::{DateRange, FactorRecord};
use crate::report::EvaluationReport;
use crate::train::{TrainPlan, TrainingReport};

/// Summary printed after `infer`.
pub fn format_inference_summary(range: DateRange, records: &[FactorRecord], output: &Path) -> String {
    let mut out = String::new();
    out.push_str("=== chart-cnn - up factor inference ===\n");
    out.push_str(&format!("Range: {range}\n"));
    out.push_str(&format!("Output: {}\n", output.display()));

    let mut per_symbol: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
    for r in records {
        let entry = per_symbol.entry(r.code.as_str()).or_default();
        entry.0 += 1;
        entry.1 += r.up_factor;
    }
    out.push_str(&format!(
        "Rows: {} | symbols: {}\n",
        records.len(),
        per_symbol.len()
    ));
    if per_symbol.is_empty() {
        out.push_str("(no valid windows in range)\n");
        return out;
    }

    out.push('\n');
    out.push_str(&format!("{:<16} {:>8} {:>10}\n", "code", "rows", "mean_up"));
    out.push_str(&format!("{:-<16} {:-<8} {:-<10}\n", "", "", ""));
    for (code, (n, sum)) in per_symbol {
        out.push_str(&format!(
            "{:<16} {:>8} {:>10.4}\n",
            truncate(code, 16),
            n,
            sum / n as f64
        ));
    }
    out
}

/// Summary printed after `evaluate`.
pub fn format_evaluation(range: DateRange, report: &EvaluationReport) -> String {
    let mut out = String::new();
    out.push_str("=== chart-cnn - evaluation ===\n");
    out.push_str(&format!("Range: {range}\n"));
    out.push_str(&format!(
        "Samples: {} | symbols: {}\n",
        report.samples, report.symbols
    ));
    out.push_str(&format!(
        "| Test Loss: {:.4} | Accuracy: {:.4} |\n",
        report.loss, report.accuracy
    ));
    out
}

/// Epoch table printed after `train`.
pub fn format_training(plan: &TrainPlan, report: &TrainingReport, checkpoint: &Path) -> String {
    let mut out = String::new();
    out.push_str("=== chart-cnn - training ===\n");
    out.push_str(&format!("Train: {} ({} samples)\n", plan.train, report.train_samples));
    match plan.validation {
        Some(range) => out.push_str(&format!(
            "Validation: {range} ({} samples)\n",
            report.validation_samples
        )),
        None => out.push_str("Validation: none\n"),
    }
    out.push_str(&format!(
        "Adam: lr={} weight_decay={} batch={}\n\n",
        plan.learning_rate, plan.weight_decay, plan.batch_size
    ));

    out.push_str(&format!(
        "{:>5} {:>10} {:>10} {:>10} {:>10}\n",
        "epoch", "loss", "acc", "val_loss", "val_acc"
    ));
    out.push_str(&format!("{:-<5} {:-<10} {:-<10} {:-<10} {:-<10}\n", "", "", "", "", ""));
    for e in &report.epochs {
        let mark = if report.best_epoch == Some(e.epoch) { " *" } else { "" };
        out.push_str(&format!(
            "{:>5} {:>10.4} {:>10.4} {:>10.4} {:>10.4}{mark}\n",
            e.epoch, e.train_loss, e.train_accuracy, e.val_loss, e.val_accuracy
        ));
    }

    out.push('\n');
    out.push_str(&format!("Checkpoint: {}\n", checkpoint.display()));
    out
}

/// Per-symbol image counts and window rejection tallies.
pub fn format_dataset_summary(range: DateRange, built: &BuiltDataset) -> String {
    let mut out = String::new();
    out.push_str("=== chart-cnn - dataset summary ===\n");
    out.push_str(&format!("Range: {range}\n"));
    out.push_str(&format!(
        "Symbols: {} ({} with images) | images: {}\n\n",
        built.sets.len(),
        built.non_empty().count(),
        built.image_count()
    ));

    out.push_str(&format!(
        "{:<16} {:>7} {:>10} {:>10}\n",
        "code", "images", "first", "last"
    ));
    out.push_str(&format!("{:-<16} {:-<7} {:-<10} {:-<10}\n", "", "", "", ""));
    for set in &built.sets {
        let first = set.dates().next().map(|d| d.to_string()).unwrap_or_default();
        let last = set.dates().last().map(|d| d.to_string()).unwrap_or_default();
        out.push_str(
            format!(
                "{:<16} {:>7} {:>10} {:>10}\n",
                truncate(&set.code, 16),
                set.len(),
                first,
                last
            )
            .trim_end(),
        );
        out.push('\n');
    }

    out.push('\n');
    out.push_str(&format_window_stats(&built.stats));
    out
}

fn format_window_stats(stats: &WindowStats) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Windows: candidates={} kept={} short_history={} missing_label={}\n",
        stats.candidates, stats.kept, stats.short_history, stats.missing_label
    ));
    if stats.rejected.is_empty() {
        out.push_str("Rejected: none\n");
    } else {
        out.push_str("Rejected:\n");
        for (reason, n) in &stats.rejected {
            out.push_str(&format!("  {reason:<22} {n}\n"));
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::domain::SymbolImageSet;

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn inference_summary_averages_per_symbol() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let rows = vec![
            FactorRecord { code: "BBB".into(), date, up_factor: 0.2 },
            FactorRecord { code: "AAA".into(), date, up_factor: 0.5 },
            FactorRecord { code: "BBB".into(), date: date.succ_opt().unwrap(), up_factor: 0.4 },
        ];
        let text = format_inference_summary(range(), &rows, Path::new("f.csv"));
        assert!(text.contains("Rows: 3 | symbols: 2"));
        let aaa = text.lines().position(|l| l.starts_with("AAA")).unwrap();
        let bbb = text.lines().position(|l| l.starts_with("BBB")).unwrap();
        assert!(aaa < bbb);
        assert!(text.lines().nth(bbb).unwrap().ends_with("0.3000"));
    }

    #[test]
    fn empty_inference_summary_says_so() {
        let text = format_inference_summary(range(), &[], Path::new("f.csv"));
        assert!(text.contains("no valid windows"));
    }

    #[test]
    fn dataset_summary_lists_empty_symbols_and_reasons() {
        let mut stats = WindowStats::default();
        stats.rejected.insert("calendar_gap", 2);
        let built = BuiltDataset {
            sets: vec![SymbolImageSet::empty("ZZZ")],
            stats,
        };
        let text = format_dataset_summary(range(), &built);
        assert!(text.contains("Symbols: 1 (0 with images) | images: 0"));
        assert!(text.lines().any(|l| l.starts_with("ZZZ") && l.ends_with('0')));
        assert!(text.contains("calendar_gap"));
    }

    #[test]
    fn training_table_marks_best_epoch() {
        use crate::train::EpochStats;

        let plan = TrainPlan {
            train: range(),
            validation: None,
            epochs: 2,
            batch_size: 32,
            learning_rate: 1e-3,
            weight_decay: 0.0,
            seed: 1,
        };
        let epoch = |epoch, val_loss| EpochStats {
            epoch,
            train_loss: 0.7,
            train_accuracy: 0.5,
            val_loss,
            val_accuracy: 0.5,
        };
        let report = TrainingReport {
            train_samples: 64,
            validation_samples: 16,
            epochs: vec![epoch(0, 0.69), epoch(1, 0.71)],
            best_epoch: Some(0),
        };
        let text = format_training(&plan, &report, Path::new("m.json"));
        assert!(text.contains("Validation: none"));
        let rows: Vec<&str> = text.lines().filter(|l| l.trim_start().starts_with(|c: char| c.is_ascii_digit())).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].ends_with(" *"));
        assert!(!rows[1].ends_with('*'));
        assert!(text.ends_with("Checkpoint: m.json\n"));
    }

    #[test]
    fn evaluation_line_format() {
        let report = EvaluationReport {
            samples: 10,
            symbols: 2,
            loss: 0.69314,
            accuracy: 0.5,
        };
        let text = format_evaluation(range(), &report);
        assert!(text.contains("| Test Loss: 0.6931 | Accuracy: 0.5000 |"));
    }

    #[test]
    fn truncate_marks_cut_names() {
        assert_eq!(truncate("ABCDEFGHIJ", 5), "ABCD.");
        assert_eq!(truncate("ABC", 5), "ABC");
    }
}
