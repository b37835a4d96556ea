use crate::shared::serde_ext::parse_number_or_string;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const LATEST_PUBLISHED: &str = "LATEST_PUBLISHED";

/// A flow or prompt version selector: an explicit number or the moving
/// `LATEST_PUBLISHED` pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DefinitionVersion {
    Number(u32),
    #[default]
    LatestPublished,
}

impl DefinitionVersion {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case(LATEST_PUBLISHED) {
            return Ok(Self::LatestPublished);
        }
        trimmed
            .parse::<u32>()
            .map(Self::Number)
            .map_err(|_| format!("expected a version number or `{LATEST_PUBLISHED}`"))
    }
}

impl std::fmt::Display for DefinitionVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::LatestPublished => f.write_str(LATEST_PUBLISHED),
        }
    }
}

impl From<u32> for DefinitionVersion {
    fn from(value: u32) -> Self {
        Self::Number(value)
    }
}

impl Serialize for DefinitionVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Number(number) => serializer.serialize_u32(*number),
            Self::LatestPublished => serializer.serialize_str(LATEST_PUBLISHED),
        }
    }
}

impl<'de> Deserialize<'de> for DefinitionVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        parse_number_or_string(deserializer, "definition version", Self::parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_accept_numbers_numeric_strings_and_latest_published() {
        let parsed: Vec<DefinitionVersion> =
            serde_json::from_str(r#"[3, "4", "LATEST_PUBLISHED"]"#).expect("parse versions");
        assert_eq!(
            parsed,
            vec![
                DefinitionVersion::Number(3),
                DefinitionVersion::Number(4),
                DefinitionVersion::LatestPublished
            ]
        );
        assert!(serde_json::from_str::<DefinitionVersion>(r#""newest""#).is_err());
        assert_eq!(
            serde_json::to_string(&DefinitionVersion::LatestPublished).expect("encode"),
            r#""LATEST_PUBLISHED""#
        );
    }
}
