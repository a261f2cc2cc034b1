//! Synchronizable entity kinds and their static field-ownership tables

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RowError;

/// Which side's writes are authoritative for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// Authored at the point of testing; the local install is system of record
    Local,
    /// Maintained by the cloud (credentials, account role); pushes never touch it
    Cloud,
    /// Mutable from either side, resolved last-writer-wins on `modified`
    Shared,
}

/// Storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Integer,
    Real,
    Text,
    Bool,
    Blob,
    Timestamp,
}

/// One column of a synchronizable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub ownership: Ownership,
}

const fn local(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        ownership: Ownership::Local,
    }
}

const fn cloud(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        ownership: Ownership::Cloud,
    }
}

const fn shared(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        ownership: Ownership::Shared,
    }
}

use FieldType::{Blob, Bool, Integer, Real, Text, Timestamp};

const USER_FIELDS: &[FieldSpec] = &[
    cloud("pwhash", Blob),
    cloud("salt", Blob),
    cloud("role", Text),
    local("name", Text),
    local("phone", Text),
    local("phonetwo", Text),
    local("email", Text),
    local("companyemail", Text),
    local("fax", Text),
    local("addressone", Text),
    local("addresstwo", Text),
    local("area", Text),
    local("mailpw", Text),
    local("orientation", Text),
    local("billing", Bool),
    local("coupon", Bool),
    local("created", Timestamp),
];

const ASSAY_RESULT_FIELDS: &[FieldSpec] = &[
    local("customer", Integer),
    local("itemcode", Text),
    local("formcode", Integer),
    local("collector", Text),
    local("incharge", Text),
    local("color", Integer),
    local("sampleweight", Real),
    local("samplereturn", Real),
    local("fwa", Integer),
    local("fwb", Integer),
    local("lwa", Integer),
    local("lwb", Integer),
    local("silverpct", Integer),
    local("resulta", Real),
    local("resultb", Real),
    local("preresult", Real),
    local("loss", Real),
    local("finalresult", Real),
    shared("ready", Bool),
    local("created", Timestamp),
    local("returndate", Timestamp),
];

const SPOIL_RECORD_FIELDS: &[FieldSpec] = &[
    local("customer", Integer),
    local("itemcode", Text),
    local("formcode", Integer),
    local("collector", Text),
    local("incharge", Text),
    local("color", Integer),
    local("sampleweight", Real),
    local("samplereturn", Real),
    local("fwa", Integer),
    local("fwb", Integer),
    local("lwa", Integer),
    local("lwb", Integer),
    local("silverpct", Integer),
    local("resulta", Real),
    local("resultb", Real),
    local("preresult", Real),
    local("loss", Real),
    local("finalresult", Real),
    local("created", Timestamp),
    local("returndate", Timestamp),
];

const LOSS_FIELDS: &[FieldSpec] = &[
    local("low", Real),
    local("high", Real),
    local("pct", Real),
    local("created", Timestamp),
];

/// The closed set of entity types that take part in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    AssayResult,
    SpoilRecord,
    Loss,
}

impl EntityKind {
    /// Every kind, in the order change sets list them.
    pub const ALL: [Self; 4] = [Self::User, Self::AssayResult, Self::SpoilRecord, Self::Loss];

    /// Backing table name.
    pub const fn table(self) -> &'static str {
        match self {
            Self::User => "users",
            Self::AssayResult => "assay_results",
            Self::SpoilRecord => "spoil_records",
            Self::Loss => "losses",
        }
    }

    /// Key of this kind's array in pull responses and grouped pushes.
    pub const fn collection(self) -> &'static str {
        // Collections are named after their tables.
        self.table()
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::AssayResult => "assay_result",
            Self::SpoilRecord => "spoil_record",
            Self::Loss => "loss",
        }
    }

    /// Field table, excluding the `id` key and the `modified` watermark.
    pub const fn fields(self) -> &'static [FieldSpec] {
        match self {
            Self::User => USER_FIELDS,
            Self::AssayResult => ASSAY_RESULT_FIELDS,
            Self::SpoilRecord => SPOIL_RECORD_FIELDS,
            Self::Loss => LOSS_FIELDS,
        }
    }

    pub fn field(self, name: &str) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|field| field.name == name)
    }

    /// Resolve a kind from its label, collection name or `CamelCase` name.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "user" | "users" => Some(Self::User),
            "assayresult" | "assayresults" => Some(Self::AssayResult),
            "spoilrecord" | "spoilrecords" => Some(Self::SpoilRecord),
            "loss" | "losses" => Some(Self::Loss),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EntityKind {
    type Err = RowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| RowError::UnknownEntityType(s.trim().to_string()))
    }
}
