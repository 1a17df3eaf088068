//! Core data models used throughout chatshard.
//!
//! These types represent the records, message elements, and resource
//! references that flow through the export pass. A [`Record`] is consumed
//! exactly once and dropped as soon as it has been written to its shard.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Kind of conversation being exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    #[default]
    Group,
    Friend,
}

impl std::str::FromStr for ChatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "group" => Ok(ChatType::Group),
            "friend" | "private" => Ok(ChatType::Friend),
            other => Err(format!(
                "unknown chat type '{}': expected group or friend",
                other
            )),
        }
    }
}

/// Identity of the exported conversation, copied into the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub chat_type: ChatType,
    pub chat_id: String,
    pub name: Option<String>,
}

/// One message as delivered by the record source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Opaque identifier, unique within the chat. Missing or blank ids are
    /// exported but cannot be indexed.
    #[serde(default)]
    pub id: Option<String>,
    /// Unix seconds. Not guaranteed to be increasing.
    pub timestamp: i64,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default, deserialize_with = "lenient_elements")]
    pub elements: Vec<Element>,
    /// Pre-rendered fragment supplied by the caller. When present it is used
    /// verbatim instead of the renderer output.
    #[serde(default)]
    pub rendered_body: Option<String>,
}

impl Record {
    /// The identifier if it can be used for bucketing.
    pub fn usable_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Searchable text derived from the elements.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for element in &self.elements {
            match element {
                Element::Text { text } => out.push_str(text),
                other => {
                    if let Some(piece) = other.searchable_label() {
                        if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                            out.push(' ');
                        }
                        out.push_str(piece);
                    }
                }
            }
        }
        out
    }

    /// Resources referenced by this record that should be copied into the
    /// bundle.
    pub fn resource_refs(&self) -> Vec<ResourceRef> {
        self.elements
            .iter()
            .filter_map(Element::resource_ref)
            .collect()
    }
}

/// A single message element. The set is closed; anything the source sends
/// that does not parse as one of the known kinds becomes [`Element::Unknown`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Element {
    Text {
        text: String,
    },
    Image {
        file_name: String,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        summary: Option<String>,
    },
    Audio {
        file_name: String,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        duration_secs: Option<u32>,
    },
    Video {
        file_name: String,
        #[serde(default)]
        source: Option<String>,
    },
    File {
        file_name: String,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        size: Option<u64>,
    },
    Face {
        id: String,
        #[serde(default)]
        name: Option<String>,
    },
    MarketFace {
        name: String,
        #[serde(default)]
        url: Option<String>,
    },
    Reply {
        target_id: String,
        #[serde(default)]
        preview: Option<String>,
    },
    Json {
        payload: String,
        #[serde(default)]
        title: Option<String>,
    },
    Forward {
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        count: u32,
    },
    System {
        text: String,
    },
    Location {
        lat: f64,
        lon: f64,
        #[serde(default)]
        title: Option<String>,
    },
    Unknown {
        raw: String,
    },
}

impl Element {
    fn searchable_label(&self) -> Option<&str> {
        match self {
            Element::Text { text } | Element::System { text } => Some(text.as_str()),
            Element::Image { summary, .. } => summary.as_deref(),
            Element::File { file_name, .. } => Some(file_name.as_str()),
            Element::Face { name, .. } => name.as_deref(),
            Element::MarketFace { name, .. } => Some(name.as_str()),
            Element::Json { title, .. } => title.as_deref(),
            Element::Forward { summary, .. } => summary.as_deref(),
            Element::Location { title, .. } => title.as_deref(),
            Element::Unknown { raw } => Some(raw.as_str()),
            Element::Audio { .. } | Element::Video { .. } | Element::Reply { .. } => None,
        }
    }

    fn resource_ref(&self) -> Option<ResourceRef> {
        let (kind, file_name, source) = match self {
            Element::Image {
                file_name, source, ..
            } => (ResourceKind::Image, file_name, source),
            Element::Audio {
                file_name, source, ..
            } => (ResourceKind::Audio, file_name, source),
            Element::Video { file_name, source } => (ResourceKind::Video, file_name, source),
            Element::File {
                file_name, source, ..
            } => (ResourceKind::File, file_name, source),
            _ => return None,
        };
        let file_name = sanitize_file_name(file_name)?;
        Some(ResourceRef {
            kind,
            file_name,
            source_location: source.clone().unwrap_or_default(),
        })
    }
}

fn lenient_elements<'de, D>(deserializer: D) -> Result<Vec<Element>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .map(|value| {
            serde_json::from_value::<Element>(value.clone()).unwrap_or_else(|_| {
                let raw = value
                    .get("text")
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                Element::Unknown { raw }
            })
        })
        .collect())
}

/// Category of a copied resource; decides the bundle sub-directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Image,
    Audio,
    Video,
    File,
}

impl ResourceKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ResourceKind::Image => "images",
            ResourceKind::Audio => "audios",
            ResourceKind::Video => "videos",
            ResourceKind::File => "files",
        }
    }
}

/// A resource discovered in a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    /// Already reduced to a single path component.
    pub file_name: String,
    /// Where the resource store should look; may be empty.
    pub source_location: String,
}

impl ResourceRef {
    /// Bundle-relative destination, e.g. `resources/images/a.jpg`.
    pub fn bundle_path(&self) -> String {
        format!("resources/{}/{}", self.kind.dir_name(), self.file_name)
    }
}

/// Reduce a file name from the source to a single safe path component.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let normalized = name.replace('\\', "/");
    let last = Path::new(&normalized).file_name()?.to_str()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: &str) -> Record {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_known_elements() {
        let r = record(
            r#"{"id":"1","timestamp":10,"sender_id":"u1","sender_name":"Ann",
                "elements":[{"type":"text","text":"hi "},
                            {"type":"image","file_name":"a.jpg","source":"/tmp/a.jpg"},
                            {"type":"reply","target_id":"0"}]}"#,
        );
        assert_eq!(r.elements.len(), 3);
        assert!(matches!(r.elements[1], Element::Image { .. }));
        assert_eq!(r.usable_id(), Some("1"));
    }

    #[test]
    fn unknown_elements_fall_back_to_raw_text() {
        let r = record(
            r#"{"timestamp":1,"elements":[{"type":"dice","text":"6"},{"type":"rps","value":2}]}"#,
        );
        assert_eq!(
            r.elements[0],
            Element::Unknown {
                raw: "6".to_string()
            }
        );
        match &r.elements[1] {
            Element::Unknown { raw } => assert!(raw.contains("rps")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn blank_ids_are_not_usable() {
        assert_eq!(record(r#"{"timestamp":1}"#).usable_id(), None);
        assert_eq!(record(r#"{"id":"  ","timestamp":1}"#).usable_id(), None);
    }

    #[test]
    fn plain_text_concatenates_text_and_labels() {
        let r = record(
            r#"{"timestamp":1,"elements":[{"type":"text","text":"hello"},
                {"type":"text","text":"world"},
                {"type":"face","id":"14","name":"smile"},
                {"type":"file","file_name":"report.pdf"}]}"#,
        );
        assert_eq!(r.plain_text(), "helloworld smile report.pdf");
    }

    #[test]
    fn resource_refs_are_sanitized() {
        let r = record(
            r#"{"timestamp":1,"elements":[
                {"type":"video","file_name":"../../etc/v.mp4"},
                {"type":"audio","file_name":"C:\\voice\\x.amr","source":"/s/x.amr"},
                {"type":"image","file_name":".."}]}"#,
        );
        let refs = r.resource_refs();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].file_name, "v.mp4");
        assert_eq!(refs[0].bundle_path(), "resources/videos/v.mp4");
        assert_eq!(refs[1].file_name, "x.amr");
        assert_eq!(refs[1].source_location, "/s/x.amr");
    }

    #[test]
    fn chat_type_parses() {
        assert_eq!("group".parse::<ChatType>().unwrap(), ChatType::Group);
        assert_eq!("private".parse::<ChatType>().unwrap(), ChatType::Friend);
        assert!("channel".parse::<ChatType>().is_err());
    }
}
