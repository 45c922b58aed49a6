use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::TypeError;
use crate::image::ImageId;

/// The metadata record stored at `images/{id}/json`.
///
/// Only `parent` is interpreted by the sync engine; the descriptive fields
/// are carried for display, and anything unrecognised lands in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ImageId>,

    #[serde(
        default,
        deserialize_with = "parent_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent: Option<ImageId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    #[serde(rename = "Size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageMetadata {
    /// Decode a metadata record from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, TypeError> {
        serde_json::from_slice(data).map_err(|e| TypeError::Metadata(e.to_string()))
    }
}

/// Docker writes `"parent": ""` for root layers; treat it as absent.
fn parent_id<'de, D>(deserializer: D) -> Result<Option<ImageId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(id) => ImageId::new(id).map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_docker_record() {
        let json = br#"{
            "id": "bbb",
            "parent": "aaa",
            "created": "2014-10-01T20:46:08.914288461Z",
            "container": "c1",
            "docker_version": "1.2.0",
            "architecture": "amd64",
            "os": "linux",
            "Size": 2433303,
            "config": {"Cmd": ["/bin/sh"]}
        }"#;
        let meta = ImageMetadata::from_json(json).unwrap();
        assert_eq!(meta.id.as_ref().unwrap().as_str(), "bbb");
        assert_eq!(meta.parent.as_ref().unwrap().as_str(), "aaa");
        assert_eq!(meta.size, Some(2433303));
        assert!(meta.extra.contains_key("config"));
    }

    #[test]
    fn empty_parent_is_root() {
        let meta = ImageMetadata::from_json(br#"{"id": "aaa", "parent": ""}"#).unwrap();
        assert_eq!(meta.parent, None);
        let meta = ImageMetadata::from_json(br#"{"id": "aaa"}"#).unwrap();
        assert_eq!(meta.parent, None);
    }

    #[test]
    fn malformed_record_is_an_error() {
        assert!(matches!(
            ImageMetadata::from_json(b"not json"),
            Err(TypeError::Metadata(_))
        ));
        assert!(ImageMetadata::from_json(br#"{"parent": "../x"}"#).is_err());
    }

    #[test]
    fn unknown_fields_are_kept() {
        let meta = ImageMetadata::from_json(br#"{"id": "a", "config": {"Env": []}}"#).unwrap();
        assert_eq!(meta.extra.get("config"), Some(&serde_json::json!({"Env": []})));
    }
}
