use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Shape;

/// A split feature defined by two anchor points.
/// The feature value is the intensity difference between pixels
/// at positions determined by these anchors relative to the current shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitFeature {
    /// Index of the first anchor landmark in the shape.
    pub anchor1_idx: u16,
    /// Offset from anchor1, in the mean-shape frame.
    pub offset1_x: f32,
    pub offset1_y: f32,
    /// Index of the second anchor landmark in the shape.
    pub anchor2_idx: u16,
    /// Offset from anchor2, in the mean-shape frame.
    pub offset2_x: f32,
    pub offset2_y: f32,
}

/// A node in the regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    /// Internal split node.
    Split {
        feature: SplitFeature,
        threshold: f32,
        left: u32,
        right: u32,
    },
    /// Leaf node containing a normalized shape delta.
    Leaf { delta: Shape },
}

/// A single regression tree.
///
/// The tree predicts a shape delta by:
/// 1. Starting at the root node
/// 2. At each split, computing a pixel intensity difference feature
/// 3. Going left if feature > threshold, right otherwise
/// 4. Returning the shape delta at the reached leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub nodes: Vec<TreeNode>,
}

impl RegressionTree {
    /// Create a new regression tree with the given nodes.
    /// Node 0 is the root.
    pub fn new(nodes: Vec<TreeNode>) -> Self {
        Self { nodes }
    }

    /// Traverse the tree and return a reference to the leaf delta.
    ///
    /// `get_feature` computes the pixel intensity difference for a split.
    pub fn predict<F>(&self, get_feature: F) -> &Shape
    where
        F: Fn(&SplitFeature) -> f32,
    {
        let mut node_idx = 0usize;

        loop {
            match &self.nodes[node_idx] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = get_feature(feature);
                    node_idx = if value > *threshold {
                        *left as usize
                    } else {
                        *right as usize
                    };
                }
                TreeNode::Leaf { delta } => {
                    return delta;
                }
            }
        }
    }

    /// Get the number of nodes in the tree.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Check that traversal terminates and every node fits a model with
    /// `num_landmarks` points.
    ///
    /// Children must point strictly forward, which rules out cycles.
    pub fn validate(&self, num_landmarks: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::InvalidModel("regression tree has no nodes".into()));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    for child in [*left as usize, *right as usize] {
                        if child <= idx || child >= self.nodes.len() {
                            return Err(Error::InvalidModel(format!(
                                "node {} has invalid child {}",
                                idx, child
                            )));
                        }
                    }
                    let anchors = [feature.anchor1_idx, feature.anchor2_idx];
                    if anchors.iter().any(|&a| a as usize >= num_landmarks) {
                        return Err(Error::InvalidModel(format!(
                            "node {} anchors {:?} exceed {} landmarks",
                            idx, anchors, num_landmarks
                        )));
                    }
                }
                TreeNode::Leaf { delta } => {
                    if delta.num_landmarks() != num_landmarks {
                        return Err(Error::InvalidModel(format!(
                            "leaf {} has {} points, expected {}",
                            idx,
                            delta.num_landmarks(),
                            num_landmarks
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// An ensemble of regression trees forming one cascade stage.
/// Each tree votes on adjustments, and the results are summed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub trees: Vec<RegressionTree>,
    pub num_landmarks: usize,
}

impl TreeEnsemble {
    pub fn new(trees: Vec<RegressionTree>, num_landmarks: usize) -> Self {
        Self {
            trees,
            num_landmarks,
        }
    }

    /// Predict the shape delta by summing predictions from all trees.
    pub fn predict<F>(&self, get_feature: F) -> Shape
    where
        F: Fn(&SplitFeature) -> f32,
    {
        let mut delta = Shape::zeros(self.num_landmarks);

        for tree in &self.trees {
            let tree_delta = tree.predict(&get_feature);
            delta.add_delta(tree_delta);
        }

        delta
    }

    pub fn validate(&self) -> Result<()> {
        self.trees
            .iter()
            .try_for_each(|tree| tree.validate(self.num_landmarks))
    }
}
