//! Criteria tree: the typed rubric and its builder.

pub mod builder;
pub mod tree;

pub use builder::build_tree;
pub use tree::{CategoryNode, CriteriaTree, NodeBody, Subject, TestSpec};
