//! KMS properties
//!
//! Property ids come from the same id space as every other object, so a
//! client can never confuse a property with a plane or CRTC.

use crate::error::PropertyError;
use crate::model::{IdAllocator, ObjectId, ObjectType};
use crate::Result;
use std::collections::{BTreeMap, HashMap};

pub const DRM_MODE_PROP_RANGE: u32 = 1 << 1;
pub const DRM_MODE_PROP_IMMUTABLE: u32 = 1 << 2;
pub const DRM_MODE_PROP_ENUM: u32 = 1 << 3;
pub const DRM_MODE_PROP_BLOB: u32 = 1 << 4;
pub const DRM_MODE_PROP_OBJECT: u32 = 1 << 6;
pub const DRM_MODE_PROP_SIGNED_RANGE: u32 = 2 << 6;

pub const DRM_PLANE_TYPE_OVERLAY: u64 = 0;
pub const DRM_PLANE_TYPE_PRIMARY: u64 = 1;
pub const DRM_PLANE_TYPE_CURSOR: u64 = 2;

pub const DRM_MODE_DPMS_ON: u64 = 0;
pub const DRM_MODE_DPMS_OFF: u64 = 3;

const PLANE_TYPES: &[(u64, &str)] = &[
    (DRM_PLANE_TYPE_OVERLAY, "Overlay"),
    (DRM_PLANE_TYPE_PRIMARY, "Primary"),
    (DRM_PLANE_TYPE_CURSOR, "Cursor"),
];

const DPMS_STATES: &[(u64, &str)] = &[
    (DRM_MODE_DPMS_ON, "On"),
    (1, "Standby"),
    (2, "Suspend"),
    (DRM_MODE_DPMS_OFF, "Off"),
];

/// Every property the shim exposes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Prop {
    Type,
    FbId,
    CrtcId,
    SrcX,
    SrcY,
    SrcW,
    SrcH,
    CrtcX,
    CrtcY,
    CrtcW,
    CrtcH,
    Zpos,
    Active,
    ModeId,
    GammaLut,
    Dpms,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropKind {
    Range { min: u64, max: u64 },
    SignedRange { min: i64, max: i64 },
    Enum(&'static [(u64, &'static str)]),
    Object(ObjectType),
    Blob,
}

impl PropKind {
    /// `DRM_MODE_PROP_*` flags for this kind
    pub fn drm_flags(&self) -> u32 {
        match self {
            PropKind::Range { .. } => DRM_MODE_PROP_RANGE,
            PropKind::SignedRange { .. } => DRM_MODE_PROP_SIGNED_RANGE,
            PropKind::Enum(_) => DRM_MODE_PROP_ENUM,
            PropKind::Object(_) => DRM_MODE_PROP_OBJECT,
            PropKind::Blob => DRM_MODE_PROP_BLOB,
        }
    }
}

impl Prop {
    pub const ALL: [Prop; 16] = [
        Prop::Type,
        Prop::FbId,
        Prop::CrtcId,
        Prop::SrcX,
        Prop::SrcY,
        Prop::SrcW,
        Prop::SrcH,
        Prop::CrtcX,
        Prop::CrtcY,
        Prop::CrtcW,
        Prop::CrtcH,
        Prop::Zpos,
        Prop::Active,
        Prop::ModeId,
        Prop::GammaLut,
        Prop::Dpms,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Prop::Type => "type",
            Prop::FbId => "FB_ID",
            Prop::CrtcId => "CRTC_ID",
            Prop::SrcX => "SRC_X",
            Prop::SrcY => "SRC_Y",
            Prop::SrcW => "SRC_W",
            Prop::SrcH => "SRC_H",
            Prop::CrtcX => "CRTC_X",
            Prop::CrtcY => "CRTC_Y",
            Prop::CrtcW => "CRTC_W",
            Prop::CrtcH => "CRTC_H",
            Prop::Zpos => "zpos",
            Prop::Active => "ACTIVE",
            Prop::ModeId => "MODE_ID",
            Prop::GammaLut => "GAMMA_LUT",
            Prop::Dpms => "DPMS",
        }
    }

    pub fn kind(self, zpos_max: u64) -> PropKind {
        match self {
            Prop::Type => PropKind::Enum(PLANE_TYPES),
            Prop::FbId => PropKind::Object(ObjectType::Framebuffer),
            Prop::CrtcId => PropKind::Object(ObjectType::Crtc),
            Prop::SrcX | Prop::SrcY | Prop::SrcW | Prop::SrcH => PropKind::Range {
                min: 0,
                max: u64::from(u32::MAX),
            },
            Prop::CrtcX | Prop::CrtcY => PropKind::SignedRange {
                min: i64::from(i32::MIN),
                max: i64::from(i32::MAX),
            },
            Prop::CrtcW | Prop::CrtcH => PropKind::Range {
                min: 0,
                max: i32::MAX as u64,
            },
            Prop::Zpos => PropKind::Range {
                min: 0,
                max: zpos_max,
            },
            Prop::Active => PropKind::Range { min: 0, max: 1 },
            Prop::ModeId | Prop::GammaLut => PropKind::Blob,
            Prop::Dpms => PropKind::Enum(DPMS_STATES),
        }
    }

    pub fn is_immutable(self) -> bool {
        matches!(self, Prop::Type)
    }

    /// Properties attached to objects of this type, in the order they are listed
    pub fn for_type(ty: ObjectType) -> &'static [Prop] {
        match ty {
            ObjectType::Plane => &[
                Prop::Type,
                Prop::FbId,
                Prop::CrtcId,
                Prop::SrcX,
                Prop::SrcY,
                Prop::SrcW,
                Prop::SrcH,
                Prop::CrtcX,
                Prop::CrtcY,
                Prop::CrtcW,
                Prop::CrtcH,
                Prop::Zpos,
            ],
            ObjectType::Crtc => &[Prop::Active, Prop::ModeId, Prop::GammaLut],
            ObjectType::Connector => &[Prop::CrtcId, Prop::Dpms],
            _ => &[],
        }
    }

    pub fn applies_to(self, ty: ObjectType) -> bool {
        Prop::for_type(ty).contains(&self)
    }
}

/// Public description of a property
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: ObjectId,
    pub name: &'static str,
    pub kind: PropKind,
    pub immutable: bool,
}

impl PropertyInfo {
    pub fn drm_flags(&self) -> u32 {
        let mut flags = self.kind.drm_flags();
        if self.immutable {
            flags |= DRM_MODE_PROP_IMMUTABLE;
        }
        flags
    }
}

/// A property value as read back from an object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyValue {
    pub id: ObjectId,
    pub name: &'static str,
    pub value: u64,
}

pub(crate) struct PropertyRegistry {
    ids: BTreeMap<Prop, ObjectId>,
    by_id: HashMap<ObjectId, Prop>,
    zpos_max: u64,
}

impl PropertyRegistry {
    pub(crate) fn new(ids: &mut IdAllocator, zpos_max: u64) -> Result<Self> {
        let mut registry = Self {
            ids: BTreeMap::new(),
            by_id: HashMap::new(),
            zpos_max,
        };
        for prop in Prop::ALL {
            let id = ids.alloc()?;
            registry.ids.insert(prop, id);
            registry.by_id.insert(id, prop);
        }
        Ok(registry)
    }

    pub(crate) fn id(&self, prop: Prop) -> ObjectId {
        // Every Prop is registered in new()
        self.ids[&prop]
    }

    pub(crate) fn lookup(&self, raw: u32) -> Option<Prop> {
        ObjectId::from_raw(raw).and_then(|id| self.by_id.get(&id).copied())
    }

    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub(crate) fn info(&self, prop: Prop) -> PropertyInfo {
        PropertyInfo {
            id: self.id(prop),
            name: prop.name(),
            kind: prop.kind(self.zpos_max),
            immutable: prop.is_immutable(),
        }
    }

    pub(crate) fn value(&self, prop: Prop, value: u64) -> PropertyValue {
        PropertyValue {
            id: self.id(prop),
            name: prop.name(),
            value,
        }
    }

    /// Check a raw value against the property's kind. Object and blob
    /// references are resolved by the caller.
    pub(crate) fn check_scalar(&self, prop: Prop, value: u64) -> std::result::Result<(), PropertyError> {
        let out_of_range = PropertyError::OutOfRange {
            property: prop.name(),
            value,
        };
        match prop.kind(self.zpos_max) {
            PropKind::Range { min, max } if value < min || value > max => Err(out_of_range),
            PropKind::SignedRange { min, max } => {
                let signed = value as i64;
                if signed < min || signed > max {
                    Err(out_of_range)
                } else {
                    Ok(())
                }
            }
            PropKind::Enum(values) if !values.iter().any(|(v, _)| *v == value) => Err(out_of_range),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PropertyRegistry {
        let mut ids = IdAllocator::new();
        PropertyRegistry::new(&mut ids, 4).unwrap()
    }

    #[test]
    fn test_ids_are_distinct_and_resolvable() {
        let reg = registry();
        let mut seen = std::collections::HashSet::new();
        for prop in Prop::ALL {
            let id = reg.id(prop);
            assert!(seen.insert(id));
            assert_eq!(reg.lookup(id.raw()), Some(prop));
        }
        assert_eq!(reg.lookup(0), None);
        assert_eq!(reg.lookup(9999), None);
    }

    #[test]
    fn test_range_checks() {
        let reg = registry();
        assert!(reg.check_scalar(Prop::Zpos, 4).is_ok());
        assert_eq!(
            reg.check_scalar(Prop::Zpos, 5),
            Err(PropertyError::OutOfRange {
                property: "zpos",
                value: 5
            })
        );
        assert!(reg.check_scalar(Prop::Active, 2).is_err());
        assert!(reg.check_scalar(Prop::CrtcX, (-20i64) as u64).is_ok());
        assert!(reg.check_scalar(Prop::CrtcX, (i64::from(i32::MIN) - 1) as u64).is_err());
        assert!(reg.check_scalar(Prop::Dpms, 3).is_ok());
        assert!(reg.check_scalar(Prop::Dpms, 4).is_err());
    }

    #[test]
    fn test_attachment() {
        assert!(Prop::Zpos.applies_to(ObjectType::Plane));
        assert!(!Prop::Zpos.applies_to(ObjectType::Crtc));
        assert!(Prop::CrtcId.applies_to(ObjectType::Connector));
        assert!(Prop::for_type(ObjectType::Framebuffer).is_empty());
        let info = registry().info(Prop::Type);
        assert_ne!(info.drm_flags() & DRM_MODE_PROP_IMMUTABLE, 0);
    }
}
