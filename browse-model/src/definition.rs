use serde::{Deserialize, Serialize};

use crate::{BrowsableEntity, FieldKey, MetadataValue};

/// How a browse index stores its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// One row per unique value; many items map to it.
    Distinct,
    /// One row per item, ordered by the first value.
    Item,
}

/// Sort normalisation applied to values before they become sort keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDataType {
    #[default]
    Text,
    Title,
    Date,
}

impl SortDataType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "text" => Some(SortDataType::Text),
            "title" => Some(SortDataType::Title),
            "date" => Some(SortDataType::Date),
            _ => None,
        }
    }

    /// Build the sort key for `value`.
    pub fn make_sort_string(&self, value: &str, language: Option<&str>) -> String {
        match self {
            SortDataType::Text => normalize_text(value),
            SortDataType::Title => {
                let text = normalize_text(value);
                let english = language.map_or(true, |l| l.is_empty() || l.starts_with("en"));
                if english { strip_article(&text).to_string() } else { text }
            }
            SortDataType::Date => normalize_date(value).unwrap_or_else(|| normalize_text(value)),
        }
    }
}

fn normalize_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn strip_article(text: &str) -> &str {
    for article in ["the ", "an ", "a "] {
        if let Some(rest) = text.strip_prefix(article) {
            if !rest.is_empty() {
                return rest;
            }
        }
    }
    text
}

/// Leading `YYYY[-MM[-DD]]`, year padded to four digits.
fn normalize_date(value: &str) -> Option<String> {
    let head: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    let mut parts = head.split('-').filter(|p| !p.is_empty());
    let year: u32 = parts.next()?.parse().ok()?;
    let mut out = format!("{year:04}");
    for part in parts.take(2) {
        let n: u32 = part.parse().ok()?;
        out.push_str(&format!("-{n:02}"));
    }
    Some(out)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("malformed index definition `{0}`")]
    Malformed(String),
    #[error("unknown index type `{0}`")]
    UnknownKind(String),
    #[error("invalid metadata field `{0}`")]
    InvalidField(String),
    #[error("unknown sort data type `{0}`")]
    UnknownDataType(String),
    #[error("unknown index option `{0}`")]
    UnknownOption(String),
}

/// Which metadata populates a browse index, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseIndexDefinition {
    pub name: String,
    pub kind: IndexKind,
    pub fields: Vec<FieldKey>,
    #[serde(default)]
    pub data_type: SortDataType,
    #[serde(default)]
    pub include_withdrawn: bool,
    #[serde(default)]
    pub include_unarchived: bool,
}

impl BrowseIndexDefinition {
    pub fn distinct(name: impl Into<String>, fields: &[&str], data_type: SortDataType) -> Result<Self, DefinitionError> {
        Self::build(name.into(), IndexKind::Distinct, fields, data_type)
    }

    pub fn item(name: impl Into<String>, fields: &[&str], data_type: SortDataType) -> Result<Self, DefinitionError> {
        Self::build(name.into(), IndexKind::Item, fields, data_type)
    }

    fn build(name: String, kind: IndexKind, fields: &[&str], data_type: SortDataType) -> Result<Self, DefinitionError> {
        let fields = fields
            .iter()
            .map(|f| FieldKey::parse(f).ok_or_else(|| DefinitionError::InvalidField(f.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        if name.trim().is_empty() || fields.is_empty() {
            return Err(DefinitionError::Malformed(name));
        }
        Ok(Self { name, kind, fields, data_type, include_withdrawn: false, include_unarchived: false })
    }

    /// Parse the property form
    /// `name:metadata:dc.contributor.*,dc.creator:text[:withdrawn,unarchived]`
    /// (distinct index) or `name:item:dc.title:title` (item index).
    pub fn parse(line: &str) -> Result<Self, DefinitionError> {
        let parts: Vec<&str> = line.split(':').map(str::trim).collect();
        if parts.len() < 3 || parts.len() > 5 {
            return Err(DefinitionError::Malformed(line.to_string()));
        }
        let kind = match parts[1] {
            "metadata" | "distinct" => IndexKind::Distinct,
            "item" => IndexKind::Item,
            other => return Err(DefinitionError::UnknownKind(other.to_string())),
        };
        let data_type = match parts.get(3) {
            Some(t) => SortDataType::parse(t).ok_or_else(|| DefinitionError::UnknownDataType(t.to_string()))?,
            None => SortDataType::Text,
        };
        let fields: Vec<&str> = parts[2].split(',').map(str::trim).filter(|f| !f.is_empty()).collect();
        let mut def = Self::build(parts[0].to_string(), kind, &fields, data_type)?;
        if let Some(opts) = parts.get(4) {
            for opt in opts.split(',').map(str::trim).filter(|o| !o.is_empty()) {
                match opt {
                    "withdrawn" => def.include_withdrawn = true,
                    "unarchived" => def.include_unarchived = true,
                    other => return Err(DefinitionError::UnknownOption(other.to_string())),
                }
            }
        }
        Ok(def)
    }

    pub fn is_distinct(&self) -> bool {
        self.kind == IndexKind::Distinct
    }

    /// Whether an entity's archival state admits it into this index.
    pub fn admits(&self, entity: &dyn BrowsableEntity) -> bool {
        if entity.is_withdrawn() {
            return self.include_withdrawn;
        }
        entity.is_archived() || self.include_unarchived
    }

    /// Non-empty values for every configured field, in field order.
    pub fn values_of(&self, entity: &dyn BrowsableEntity) -> Vec<MetadataValue> {
        self.fields
            .iter()
            .flat_map(|f| entity.metadata(f))
            .filter(|v| !v.value.trim().is_empty())
            .collect()
    }
}

/// A named ordering for item lists, built from the first value of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOption {
    pub name: String,
    pub field: FieldKey,
    #[serde(default)]
    pub data_type: SortDataType,
}

impl SortOption {
    pub fn new(name: impl Into<String>, field: &str, data_type: SortDataType) -> Result<Self, DefinitionError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DefinitionError::Malformed(name));
        }
        let field = FieldKey::parse(field).ok_or_else(|| DefinitionError::InvalidField(field.to_string()))?;
        Ok(Self { name, field, data_type })
    }

    /// Parse the property form `dateissued:dc.date.issued:date`; the data type defaults to text.
    pub fn parse(line: &str) -> Result<Self, DefinitionError> {
        let parts: Vec<&str> = line.split(':').map(str::trim).collect();
        let data_type = match parts.as_slice() {
            [_, _] => SortDataType::Text,
            [_, _, t] => SortDataType::parse(t).ok_or_else(|| DefinitionError::UnknownDataType(t.to_string()))?,
            _ => return Err(DefinitionError::Malformed(line.to_string())),
        };
        Self::new(parts[0], parts[1], data_type)
    }

    /// Sort key of the entity's first non-blank value, if it has one.
    pub fn sort_key_of(&self, entity: &dyn BrowsableEntity) -> Option<String> {
        entity
            .metadata(&self.field)
            .into_iter()
            .find(|v| !v.value.trim().is_empty())
            .map(|v| self.data_type.make_sort_string(&v.value, v.language.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CatalogItem;

    #[test]
    fn sort_options_use_the_first_value() {
        let opt = SortOption::parse("dateissued:dc.date.issued:date").unwrap();
        assert_eq!(opt.data_type, SortDataType::Date);
        let item = CatalogItem::item(1)
            .with_value("dc.date.issued", " ")
            .with_value("dc.date.issued", "2004-5")
            .with_value("dc.date.issued", "1999");
        assert_eq!(opt.sort_key_of(&item).as_deref(), Some("2004-05"));
        assert_eq!(opt.sort_key_of(&CatalogItem::item(2)), None);

        assert_eq!(SortOption::parse("title:dc.title").unwrap().data_type, SortDataType::Text);
        assert!(matches!(SortOption::parse("title"), Err(DefinitionError::Malformed(_))));
        assert!(matches!(SortOption::parse(":dc.title:title"), Err(DefinitionError::Malformed(_))));
        assert!(matches!(SortOption::parse("t:dc:title"), Err(DefinitionError::InvalidField(_))));
        assert!(matches!(SortOption::parse("t:dc.title:number"), Err(DefinitionError::UnknownDataType(_))));
    }

    #[test]
    fn parses_distinct_and_item_lines() {
        let d = BrowseIndexDefinition::parse("author:metadata:dc.contributor.*,dc.creator:text").unwrap();
        assert_eq!(d.kind, IndexKind::Distinct);
        assert_eq!(d.fields.len(), 2);
        assert_eq!(d.fields[0].qualifier.as_deref(), Some("*"));
        assert!(!d.include_withdrawn);

        let t = BrowseIndexDefinition::parse("title:item:dc.title:title:withdrawn").unwrap();
        assert_eq!(t.kind, IndexKind::Item);
        assert_eq!(t.data_type, SortDataType::Title);
        assert!(t.include_withdrawn);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(BrowseIndexDefinition::parse("author"), Err(DefinitionError::Malformed(_))));
        assert!(matches!(BrowseIndexDefinition::parse("a:table:dc.title"), Err(DefinitionError::UnknownKind(_))));
        assert!(matches!(BrowseIndexDefinition::parse("a:item:dc:text"), Err(DefinitionError::InvalidField(_))));
        assert!(matches!(BrowseIndexDefinition::parse("a:item:dc.title:number"), Err(DefinitionError::UnknownDataType(_))));
        assert!(matches!(BrowseIndexDefinition::parse("a:item:dc.title:text:hidden"), Err(DefinitionError::UnknownOption(_))));
    }

    #[test]
    fn sort_strings() {
        assert_eq!(SortDataType::Text.make_sort_string("  Doe,   Jane ", None), "doe, jane");
        assert_eq!(SortDataType::Title.make_sort_string("The Rust Book", None), "rust book");
        assert_eq!(SortDataType::Title.make_sort_string("The Rust Book", Some("de")), "the rust book");
        assert_eq!(SortDataType::Title.make_sort_string("A", Some("en_US")), "a");
        assert_eq!(SortDataType::Date.make_sort_string("2004-7-1T00:00:00Z", None), "2004-07-01");
        assert_eq!(SortDataType::Date.make_sort_string("987", None), "0987");
        assert_eq!(SortDataType::Date.make_sort_string("circa 1900", None), "circa 1900");
    }

    #[test]
    fn admission_follows_archival_flags() {
        let def = BrowseIndexDefinition::distinct("subject", &["dc.subject"], SortDataType::Text).unwrap();
        let mut item = CatalogItem::item(1);
        assert!(def.admits(&item));
        item.withdrawn = true;
        assert!(!def.admits(&item));
        item.withdrawn = false;
        item.archived = false;
        assert!(!def.admits(&item));

        let mut lenient = def.clone();
        lenient.include_unarchived = true;
        assert!(lenient.admits(&item));
    }
}
