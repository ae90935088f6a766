//! Hardware anchor records and their web-facing snapshots.

use xrbridge_events::{AnchorId, AnchorKind, AnchorSnapshot, Transform};

/// Kind-specific attributes of a hardware anchor.
#[derive(Debug, Clone, PartialEq)]
pub enum AnchorAttributes {
    Plane {
        /// Extent (width, length) in meters.
        extent: [f32; 2],
        /// Center of the plane in anchor space.
        center: [f32; 3],
    },
    Image {
        /// Name of the detected reference image.
        image_name: String,
    },
    Face,
    Object {
        object_name: String,
    },
    /// User-created or untyped anchor.
    None,
}

/// A hardware-tracked anchor as delivered by the sensor layer.
///
/// Owned by the sensor; the registry derives immutable [`AnchorSnapshot`]s
/// from it.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorRecord {
    pub id: AnchorId,
    pub transform: Transform,
    pub attributes: AnchorAttributes,
}

impl AnchorRecord {
    pub fn plane(id: AnchorId, transform: Transform, extent: [f32; 2], center: [f32; 3]) -> Self {
        Self {
            id,
            transform,
            attributes: AnchorAttributes::Plane { extent, center },
        }
    }

    pub fn image(id: AnchorId, transform: Transform, image_name: impl Into<String>) -> Self {
        Self {
            id,
            transform,
            attributes: AnchorAttributes::Image {
                image_name: image_name.into(),
            },
        }
    }

    pub fn face(id: AnchorId, transform: Transform) -> Self {
        Self {
            id,
            transform,
            attributes: AnchorAttributes::Face,
        }
    }

    pub fn user(id: AnchorId, transform: Transform) -> Self {
        Self {
            id,
            transform,
            attributes: AnchorAttributes::None,
        }
    }

    /// The anchor kind derived from its attributes.
    pub fn kind(&self) -> AnchorKind {
        match &self.attributes {
            AnchorAttributes::Plane { .. } => AnchorKind::Plane,
            AnchorAttributes::Image { .. } => AnchorKind::Image,
            AnchorAttributes::Face => AnchorKind::Face,
            AnchorAttributes::Object { .. } => AnchorKind::Object,
            AnchorAttributes::None => AnchorKind::Other,
        }
    }

    /// Reference-image name, image anchors only.
    pub fn image_name(&self) -> Option<&str> {
        match &self.attributes {
            AnchorAttributes::Image { image_name } => Some(image_name),
            _ => None,
        }
    }

    /// Build the web-facing snapshot dictionary for this anchor.
    pub fn snapshot(&self, user_anchor_id: Option<String>) -> AnchorSnapshot {
        let (extent, center, image_name) = match &self.attributes {
            AnchorAttributes::Plane { extent, center } => (Some(*extent), Some(*center), None),
            AnchorAttributes::Image { image_name } => (None, None, Some(image_name.clone())),
            _ => (None, None, None),
        };
        AnchorSnapshot {
            id: self.id,
            kind: self.kind(),
            transform: self.transform,
            extent,
            center,
            image_name,
            user_anchor_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrbridge_events::IDENTITY_TRANSFORM;

    #[test]
    fn test_kind_follows_attributes() {
        let id = AnchorId::new();
        assert_eq!(
            AnchorRecord::plane(id, IDENTITY_TRANSFORM, [1.0, 2.0], [0.0; 3]).kind(),
            AnchorKind::Plane
        );
        assert_eq!(
            AnchorRecord::image(id, IDENTITY_TRANSFORM, "m").kind(),
            AnchorKind::Image
        );
        assert_eq!(AnchorRecord::user(id, IDENTITY_TRANSFORM).kind(), AnchorKind::Other);
    }

    #[test]
    fn test_snapshot_carries_plane_attributes() {
        let record = AnchorRecord::plane(AnchorId::new(), IDENTITY_TRANSFORM, [1.5, 0.5], [0.0, 0.1, 0.0]);
        let snapshot = record.snapshot(None);
        assert_eq!(snapshot.extent, Some([1.5, 0.5]));
        assert_eq!(snapshot.center, Some([0.0, 0.1, 0.0]));
        assert_eq!(snapshot.image_name, None);
    }
}
