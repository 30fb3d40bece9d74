//! Compilation experts
//!
//! An expert is a named transformation pipeline. Test experts share a fixed
//! suffix: bufferize, then the lowering-only expert (all vector lowering stages
//! followed by the final LLVM lowering).

use serde::{Deserialize, Serialize};

use crate::transforms::{Transform, TransformationList};

/// Number of vector lowering stages, applied as stages `0..VECTOR_LOWERING_STAGES`
pub const VECTOR_LOWERING_STAGES: u8 = 7;

/// Lowering only: every vector lowering stage for `fn_name`, then LLVM
///
/// Vector lowering acts on every vector op of the function, so the stages
/// carry no op anchor.
pub fn lowering_only_expert(fn_name: &str) -> TransformationList {
    let mut transforms: TransformationList = (0..VECTOR_LOWERING_STAGES)
        .map(|stage| Transform::LowerVectors {
            fn_name: fn_name.to_string(),
            stage,
        })
        .collect();
    transforms.push(Transform::LowerToLlvm);
    transforms
}

/// The suffix every test expert ends with
pub fn bufferize_and_lower(fn_name: &str) -> TransformationList {
    TransformationList::new(vec![Transform::Bufferize]) + lowering_only_expert(fn_name)
}

/// A named transformation pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expert {
    pub name: String,
    pub transforms: TransformationList,
}

impl Expert {
    pub fn new(name: impl Into<String>, transforms: TransformationList) -> Self {
        Expert {
            name: name.into(),
            transforms,
        }
    }

    /// Tiling transforms followed by the bufferize/lower suffix for `fn_name`
    pub fn test_expert(
        name: impl Into<String>,
        tiling_transforms: Vec<Transform>,
        fn_name: &str,
    ) -> Self {
        let transforms = TransformationList::new(tiling_transforms) + bufferize_and_lower(fn_name);
        Expert::new(name, transforms)
    }

    /// Everything before the first bufferization step
    pub fn tiling_transforms(&self) -> &[Transform] {
        let all = self.transforms.as_slice();
        let end = all
            .iter()
            .position(|t| matches!(t, Transform::Bufferize))
            .unwrap_or(all.len());
        &all[..end]
    }

    /// Whether the pipeline ends with exactly the bufferize/lower suffix for `fn_name`
    pub fn ends_with_lowering_suffix(&self, fn_name: &str) -> bool {
        let suffix = bufferize_and_lower(fn_name);
        self.transforms.as_slice().ends_with(suffix.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::{Tile, Vectorize};

    #[test]
    fn test_lowering_only_expert_stages() {
        let lowering = lowering_only_expert("matvec");
        assert_eq!(lowering.len(), VECTOR_LOWERING_STAGES as usize + 1);
        assert_eq!(lowering.as_slice().last(), Some(&Transform::LowerToLlvm));
        for (stage, transform) in lowering.as_slice()[..VECTOR_LOWERING_STAGES as usize]
            .iter()
            .enumerate()
        {
            assert_eq!(
                transform,
                &Transform::LowerVectors {
                    fn_name: "matvec".to_string(),
                    stage: stage as u8,
                }
            );
        }
    }

    #[test]
    fn test_expert_suffix() {
        let expert = Expert::test_expert(
            "tile_1",
            vec![
                Tile::new("matvec", "linalg.generic").tile_sizes([8, 24]).into(),
                Vectorize::new("matvec", "linalg.generic").into(),
            ],
            "matvec",
        );
        assert_eq!(expert.tiling_transforms().len(), 2);
        assert!(expert.ends_with_lowering_suffix("matvec"));
        assert!(!expert.ends_with_lowering_suffix("other"));

        let empty = Expert::test_expert("no_tiling", vec![], "matvec");
        assert!(empty.tiling_transforms().is_empty());
        assert!(empty.ends_with_lowering_suffix("matvec"));
    }
}
