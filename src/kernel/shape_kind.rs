//! Dynamic-shape classification of a node
//!
//! A node may be static or any combination of dynamic shape, dynamic type and
//! dynamic value. The combination decides which pre-launch stages run:
//!
//! | kind contains   | inference               | resize |
//! |-----------------|-------------------------|--------|
//! | DYNAMIC_TYPE    | infer shape and type    | yes    |
//! | DYNAMIC_SHAPE   | infer shape             | yes    |
//! | DYNAMIC_VALUE   | none                    | yes    |
//! | (static)        | none                    | no     |
//!
//! Rows are checked top to bottom; the first match wins.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::Serialize;

/// Bitset of dynamic properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ShapeKind(u8);

/// Which inference entry point to call before resize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InferStage {
    None,
    InferShape,
    InferShapeAndType,
}

/// Pre-launch stages for one firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    pub infer: InferStage,
    pub resize: bool,
}

const STAGE_TABLE: [(ShapeKind, StagePlan); 3] = [
    (
        ShapeKind::DYNAMIC_TYPE,
        StagePlan {
            infer: InferStage::InferShapeAndType,
            resize: true,
        },
    ),
    (
        ShapeKind::DYNAMIC_SHAPE,
        StagePlan {
            infer: InferStage::InferShape,
            resize: true,
        },
    ),
    (
        ShapeKind::DYNAMIC_VALUE,
        StagePlan {
            infer: InferStage::None,
            resize: true,
        },
    ),
];

const STATIC_PLAN: StagePlan = StagePlan {
    infer: InferStage::None,
    resize: false,
};

impl ShapeKind {
    pub const STATIC: ShapeKind = ShapeKind(0);
    pub const DYNAMIC_SHAPE: ShapeKind = ShapeKind(1);
    pub const DYNAMIC_TYPE: ShapeKind = ShapeKind(1 << 1);
    pub const DYNAMIC_VALUE: ShapeKind = ShapeKind(1 << 2);

    pub fn contains(&self, other: ShapeKind) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_static(&self) -> bool {
        self.0 == 0
    }

    /// Any dynamic property set
    pub fn has_dynamic(&self) -> bool {
        !self.is_static()
    }

    pub fn is_dynamic_shape(&self) -> bool {
        self.contains(ShapeKind::DYNAMIC_SHAPE)
    }

    pub fn is_dynamic_type(&self) -> bool {
        self.contains(ShapeKind::DYNAMIC_TYPE)
    }

    pub fn is_dynamic_value(&self) -> bool {
        self.contains(ShapeKind::DYNAMIC_VALUE)
    }

    /// Sizes may change between runs, so the static memory plan cannot cover
    /// this node
    pub fn sizes_may_change(&self) -> bool {
        self.is_dynamic_shape() || self.is_dynamic_type()
    }

    pub fn stage_plan(&self) -> StagePlan {
        STAGE_TABLE
            .iter()
            .find(|(kind, _)| self.contains(*kind))
            .map(|(_, plan)| *plan)
            .unwrap_or(STATIC_PLAN)
    }
}

impl BitOr for ShapeKind {
    type Output = ShapeKind;

    fn bitor(self, rhs: ShapeKind) -> ShapeKind {
        ShapeKind(self.0 | rhs.0)
    }
}

impl BitOrAssign for ShapeKind {
    fn bitor_assign(&mut self, rhs: ShapeKind) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_static() {
            return f.write_str("Static");
        }
        let mut parts = Vec::new();
        if self.is_dynamic_shape() {
            parts.push("DynamicShape");
        }
        if self.is_dynamic_type() {
            parts.push("DynamicType");
        }
        if self.is_dynamic_value() {
            parts.push("DynamicValue");
        }
        f.write_str(&parts.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_runs_no_stages() {
        let plan = ShapeKind::STATIC.stage_plan();
        assert_eq!(plan.infer, InferStage::None);
        assert!(!plan.resize);
        assert!(!ShapeKind::STATIC.has_dynamic());
    }

    #[test]
    fn test_value_only_resizes() {
        let plan = ShapeKind::DYNAMIC_VALUE.stage_plan();
        assert_eq!(plan.infer, InferStage::None);
        assert!(plan.resize);
        assert!(!ShapeKind::DYNAMIC_VALUE.sizes_may_change());
    }

    #[test]
    fn test_type_takes_priority() {
        let kind = ShapeKind::DYNAMIC_SHAPE | ShapeKind::DYNAMIC_TYPE;
        assert_eq!(kind.stage_plan().infer, InferStage::InferShapeAndType);

        let mut kind = ShapeKind::DYNAMIC_VALUE;
        kind |= ShapeKind::DYNAMIC_SHAPE;
        assert_eq!(kind.stage_plan().infer, InferStage::InferShape);
        assert_eq!(kind.to_string(), "DynamicShape|DynamicValue");
    }

    #[test]
    fn test_contains_ignores_empty() {
        assert!(!ShapeKind::DYNAMIC_SHAPE.contains(ShapeKind::STATIC));
        assert!(ShapeKind::DYNAMIC_SHAPE.is_dynamic_shape());
    }
}
