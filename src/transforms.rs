//! Transformation descriptors
//!
//! Every step of a codegen pipeline is one [`Transform`]: a tagged variant with
//! its own typed parameter record. Tensor-level steps (tile, fuse, generalize,
//! vectorize) are anchored on a function and an op name; bufferization and the
//! lowering stages act on the whole module.
//!
//! Parameters are transcribed, not validated, here. The compiler decides what a
//! combination means (see [`crate::compiler`]).
//!
//! ```
//! use codegen_experts::transforms::{Tile, Transform, Vectorize};
//!
//! let steps: Vec<Transform> = vec![
//!     Tile::new("matvec", "linalg.generic")
//!         .tile_sizes([8, 24])
//!         .pad(true)
//!         .pack_paddings([1, 1, 1])
//!         .into(),
//!     Vectorize::new("matvec", "linalg.generic").into(),
//! ];
//! assert_eq!(steps.len(), 2);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

/// Function and op a transform applies to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anchor {
    pub fn_name: String,
    pub op_name: String,
}

impl Anchor {
    pub fn new(fn_name: impl Into<String>, op_name: impl Into<String>) -> Self {
        Anchor {
            fn_name: fn_name.into(),
            op_name: op_name.into(),
        }
    }
}

// ============================================================================
// Parameter Records
// ============================================================================

/// Tile the anchored op, optionally peeling, padding and scalarizing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub anchor: Anchor,
    /// One size per op iterator; 0 (or a missing entry) leaves that iterator untiled
    #[serde(default)]
    pub tile_sizes: Vec<usize>,
    /// Order of the generated tile loops, as a permutation of the op iterators
    #[serde(default)]
    pub tile_interchange: Vec<usize>,
    /// Positions of generated loops to split into full tiles and a remainder
    #[serde(default)]
    pub peel: Vec<usize>,
    #[serde(default)]
    pub pad: bool,
    /// Per operand (inputs, then result): 1 forces a packed copy
    #[serde(default)]
    pub pack_paddings: Vec<usize>,
    /// Per operand: number of enclosing loops to hoist the packing above
    #[serde(default)]
    pub hoist_paddings: Vec<usize>,
    /// Tile every iterator that still has a dynamic extent by 1
    #[serde(default)]
    pub scalarize_dyn_dims: bool,
}

impl Tile {
    pub fn new(fn_name: &str, op_name: &str) -> Self {
        Tile {
            anchor: Anchor::new(fn_name, op_name),
            tile_sizes: Vec::new(),
            tile_interchange: Vec::new(),
            peel: Vec::new(),
            pad: false,
            pack_paddings: Vec::new(),
            hoist_paddings: Vec::new(),
            scalarize_dyn_dims: false,
        }
    }

    pub fn tile_sizes(mut self, sizes: impl IntoIterator<Item = usize>) -> Self {
        self.tile_sizes = sizes.into_iter().collect();
        self
    }

    pub fn tile_interchange(mut self, perm: impl IntoIterator<Item = usize>) -> Self {
        self.tile_interchange = perm.into_iter().collect();
        self
    }

    pub fn peel(mut self, loops: impl IntoIterator<Item = usize>) -> Self {
        self.peel = loops.into_iter().collect();
        self
    }

    pub fn pad(mut self, pad: bool) -> Self {
        self.pad = pad;
        self
    }

    pub fn pack_paddings(mut self, flags: impl IntoIterator<Item = usize>) -> Self {
        self.pack_paddings = flags.into_iter().collect();
        self
    }

    pub fn hoist_paddings(mut self, depths: impl IntoIterator<Item = usize>) -> Self {
        self.hoist_paddings = depths.into_iter().collect();
        self
    }

    pub fn scalarize_dyn_dims(mut self, scalarize: bool) -> Self {
        self.scalarize_dyn_dims = scalarize;
        self
    }
}

/// Tile the anchored op and fuse its fill producer into the parallel tile loops
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fuse {
    pub anchor: Anchor,
    #[serde(default)]
    pub tile_sizes: Vec<usize>,
    #[serde(default)]
    pub tile_interchange: Vec<usize>,
}

impl Fuse {
    pub fn new(fn_name: &str, op_name: &str) -> Self {
        Fuse {
            anchor: Anchor::new(fn_name, op_name),
            tile_sizes: Vec::new(),
            tile_interchange: Vec::new(),
        }
    }

    pub fn tile_sizes(mut self, sizes: impl IntoIterator<Item = usize>) -> Self {
        self.tile_sizes = sizes.into_iter().collect();
        self
    }

    pub fn tile_interchange(mut self, perm: impl IntoIterator<Item = usize>) -> Self {
        self.tile_interchange = perm.into_iter().collect();
        self
    }
}

/// Rewrite the anchored op as a generic op with permuted iterators
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generalize {
    pub anchor: Anchor,
    #[serde(default)]
    pub iterator_interchange: Vec<usize>,
}

impl Generalize {
    pub fn new(fn_name: &str, op_name: &str) -> Self {
        Generalize {
            anchor: Anchor::new(fn_name, op_name),
            iterator_interchange: Vec::new(),
        }
    }

    pub fn iterator_interchange(mut self, perm: impl IntoIterator<Item = usize>) -> Self {
        self.iterator_interchange = perm.into_iter().collect();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vectorize {
    pub anchor: Anchor,
}

impl Vectorize {
    pub fn new(fn_name: &str, op_name: &str) -> Self {
        Vectorize {
            anchor: Anchor::new(fn_name, op_name),
        }
    }
}

// ============================================================================
// Transform
// ============================================================================

/// One step of a codegen pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    Tile(Tile),
    Fuse(Fuse),
    Generalize(Generalize),
    Vectorize(Vectorize),
    /// Tensor values become in-place buffers
    Bufferize,
    /// One stage of vector-op lowering, scoped to a function
    LowerVectors { fn_name: String, stage: u8 },
    /// Final lowering of the whole module
    LowerToLlvm,
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Tile(_) => "Tile",
            Transform::Fuse(_) => "Fuse",
            Transform::Generalize(_) => "Generalize",
            Transform::Vectorize(_) => "Vectorize",
            Transform::Bufferize => "Bufferize",
            Transform::LowerVectors { .. } => "LowerVectors",
            Transform::LowerToLlvm => "LowerToLLVM",
        }
    }

    pub fn anchor(&self) -> Option<&Anchor> {
        match self {
            Transform::Tile(t) => Some(&t.anchor),
            Transform::Fuse(t) => Some(&t.anchor),
            Transform::Generalize(t) => Some(&t.anchor),
            Transform::Vectorize(t) => Some(&t.anchor),
            _ => None,
        }
    }

    /// Steps that rewrite value-semantic tensor ops
    pub fn is_tensor_transform(&self) -> bool {
        self.anchor().is_some()
    }
}

impl From<Tile> for Transform {
    fn from(t: Tile) -> Self {
        Transform::Tile(t)
    }
}

impl From<Fuse> for Transform {
    fn from(t: Fuse) -> Self {
        Transform::Fuse(t)
    }
}

impl From<Generalize> for Transform {
    fn from(t: Generalize) -> Self {
        Transform::Generalize(t)
    }
}

impl From<Vectorize> for Transform {
    fn from(t: Vectorize) -> Self {
        Transform::Vectorize(t)
    }
}

fn list(values: &[usize]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut args: Vec<String> = Vec::new();
        if let Some(anchor) = self.anchor() {
            args.push(anchor.fn_name.clone());
            args.push(anchor.op_name.clone());
        }
        match self {
            Transform::Tile(t) => {
                if !t.tile_sizes.is_empty() {
                    args.push(format!("tile_sizes={}", list(&t.tile_sizes)));
                }
                if !t.tile_interchange.is_empty() {
                    args.push(format!("tile_interchange={}", list(&t.tile_interchange)));
                }
                if !t.peel.is_empty() {
                    args.push(format!("peel={}", list(&t.peel)));
                }
                if t.pad {
                    args.push("pad=true".to_string());
                }
                if !t.pack_paddings.is_empty() {
                    args.push(format!("pack_paddings={}", list(&t.pack_paddings)));
                }
                if !t.hoist_paddings.is_empty() {
                    args.push(format!("hoist_paddings={}", list(&t.hoist_paddings)));
                }
                if t.scalarize_dyn_dims {
                    args.push("scalarize_dyn_dims=true".to_string());
                }
            }
            Transform::Fuse(t) => {
                if !t.tile_sizes.is_empty() {
                    args.push(format!("tile_sizes={}", list(&t.tile_sizes)));
                }
                if !t.tile_interchange.is_empty() {
                    args.push(format!("tile_interchange={}", list(&t.tile_interchange)));
                }
            }
            Transform::Generalize(t) => {
                if !t.iterator_interchange.is_empty() {
                    args.push(format!(
                        "iterator_interchange={}",
                        list(&t.iterator_interchange)
                    ));
                }
            }
            Transform::LowerVectors { fn_name, stage } => {
                args.push(fn_name.clone());
                args.push(format!("stage={}", stage));
            }
            _ => {}
        }
        write!(f, "{}({})", self.name(), args.join(", "))
    }
}

// ============================================================================
// Transformation List
// ============================================================================

/// Ordered pipeline of transforms
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformationList {
    transforms: Vec<Transform>,
}

impl TransformationList {
    pub fn new(transforms: Vec<Transform>) -> Self {
        TransformationList { transforms }
    }

    pub fn push(&mut self, transform: impl Into<Transform>) {
        self.transforms.push(transform.into());
    }

    pub fn extend(&mut self, other: TransformationList) {
        self.transforms.extend(other.transforms);
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Transform> {
        self.transforms.iter()
    }

    pub fn as_slice(&self) -> &[Transform] {
        &self.transforms
    }
}

impl From<Vec<Transform>> for TransformationList {
    fn from(transforms: Vec<Transform>) -> Self {
        TransformationList::new(transforms)
    }
}

impl FromIterator<Transform> for TransformationList {
    fn from_iter<I: IntoIterator<Item = Transform>>(iter: I) -> Self {
        TransformationList::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a TransformationList {
    type Item = &'a Transform;
    type IntoIter = std::slice::Iter<'a, Transform>;

    fn into_iter(self) -> Self::IntoIter {
        self.transforms.iter()
    }
}

impl Add for TransformationList {
    type Output = TransformationList;

    fn add(mut self, rhs: TransformationList) -> TransformationList {
        self.extend(rhs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_lists_only_given_parameters() {
        let t: Transform = Tile::new("matvec", "linalg.generic")
            .tile_sizes([8])
            .peel([0])
            .into();
        assert_eq!(
            t.to_string(),
            "Tile(matvec, linalg.generic, tile_sizes=[8], peel=[0])"
        );
        assert_eq!(Transform::Bufferize.to_string(), "Bufferize()");
    }

    #[test]
    fn test_lists_concatenate_in_order() {
        let a: TransformationList = vec![Transform::Bufferize].into();
        let b: TransformationList = vec![Transform::LowerToLlvm].into();
        let joined = a + b;
        assert_eq!(joined.as_slice(), &[Transform::Bufferize, Transform::LowerToLlvm]);
    }

    #[test]
    fn test_json_shape() {
        let t: Transform = Vectorize::new("matvec", "linalg.fill").into();
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"kind\":\"vectorize\""));
        let back: Transform = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);

        let tile: Transform = serde_json::from_str(
            r#"{"kind":"tile","anchor":{"fn_name":"f","op_name":"linalg.generic"},"tile_sizes":[4]}"#,
        )
        .unwrap();
        match tile {
            Transform::Tile(t) => {
                assert_eq!(t.tile_sizes, vec![4]);
                assert!(!t.pad);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
