//! Graphviz rendering of the batch job graph (`--debug`).

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::domain::{BatchRun, Stage};
use crate::error::AppError;

pub const GRAPH_FILE: &str = "job_graph.dot";

const SUBJECT_STAGES: [Stage; 6] = [
    Stage::Conform,
    Stage::Localization,
    Stage::Segmentation,
    Stage::Qc,
    Stage::Statistics,
    Stage::Finalize,
];

/// DOT text: one cluster per subject with its stage chain, all feeding the
/// collector. The miss branch skips straight to statistics.
pub fn render_job_graph(batch: &BatchRun) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", escape(&batch.name));
    out.push_str("  rankdir=LR;\n  node [shape=box, fontsize=10];\n");
    out.push_str("  collect [label=\"collect outputs\\nob_stats_table.csv\", shape=folder];\n");

    for (i, subject) in batch.subjects.iter().enumerate() {
        let _ = writeln!(out, "  subgraph cluster_{i} {{");
        let _ = writeln!(out, "    label=\"{}\";", escape(&subject.id));
        for stage in SUBJECT_STAGES {
            let _ = writeln!(out, "    s{i}_{stage} [label=\"{stage}\"];");
        }
        let chain: Vec<String> = SUBJECT_STAGES.iter().map(|s| format!("s{i}_{s}")).collect();
        let _ = writeln!(out, "    {};", chain.join(" -> "));
        let _ = writeln!(
            out,
            "    s{i}_{} -> s{i}_{} [style=dashed, label=\"miss\"];",
            Stage::Localization,
            Stage::Statistics
        );
        out.push_str("  }\n");
        let _ = writeln!(out, "  s{i}_{} -> collect;", Stage::Finalize);
    }

    for skipped in &batch.skipped {
        let _ = writeln!(
            out,
            "  \"skip_{0}\" [label=\"{0}\\nskipped: {1}\", style=dotted];",
            escape(&skipped.id),
            escape(&skipped.reason)
        );
    }
    out.push_str("}\n");
    out
}

pub fn write_job_graph(batch: &BatchRun, path: &Path) -> Result<(), AppError> {
    fs::write(path, render_job_graph(batch))
        .map_err(|e| AppError::runtime(format!("Failed to write job graph '{}': {e}", path.display())))
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
