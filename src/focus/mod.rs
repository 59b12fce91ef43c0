//! Impact ranking: which tests cost the submission the most points.
//!
//! For every executed test, the deficit it contributes to the final score is
//!
//! ```text
//! diff_score = (100 - score) x (test_weight / 100) x ancestor_multiplier
//! ```
//!
//! where `ancestor_multiplier` is the product of `normalized_weight / 100`
//! for every ancestor from the category root down to the test's parent, and
//! `test_weight` is the test's equal share among its leaf siblings. Entries
//! are ranked per category, largest deficit first; ties keep declaration
//! order.

use serde::{Deserialize, Serialize};

use crate::models::{ResultChild, ResultNode, ResultTree, TestLeaf};

/// One ranked entry: a test result and the points it cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusEntry {
    pub test: TestLeaf,
    pub diff_score: f64,
}

/// Per-category impact ranking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Focus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub base: Vec<FocusEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bonus: Vec<FocusEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub penalty: Vec<FocusEntry>,
}

impl Focus {
    /// Whether no category produced any entries.
    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.bonus.is_empty() && self.penalty.is_empty()
    }
}

/// Computes the ranking for every category present in the result tree.
pub fn compute(tree: &ResultTree) -> Focus {
    Focus {
        base: tree.base.as_ref().map(rank_category).unwrap_or_default(),
        bonus: tree.bonus.as_ref().map(rank_category).unwrap_or_default(),
        penalty: tree.penalty.as_ref().map(rank_category).unwrap_or_default(),
    }
}

fn rank_category(category: &ResultNode) -> Vec<FocusEntry> {
    let mut entries = Vec::new();
    collect(category, 1.0, &mut entries);
    // Stable sort keeps declaration order for equal deficits.
    entries.sort_by(|a, b| {
        b.diff_score
            .partial_cmp(&a.diff_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    entries
}

fn collect(node: &ResultNode, multiplier: f64, out: &mut Vec<FocusEntry>) {
    let leaf_count = node
        .children
        .iter()
        .filter(|c| matches!(c, ResultChild::Test(_)))
        .count();

    for child in &node.children {
        match child {
            ResultChild::Test(leaf) => {
                let share = 1.0 / leaf_count as f64;
                out.push(FocusEntry {
                    test: leaf.clone(),
                    diff_score: (100.0 - leaf.score) * share * multiplier,
                });
            }
            ResultChild::Subject(sub) => {
                collect(sub, multiplier * sub.weight / 100.0, out);
            }
        }
    }
}
