//! Persisted record kinds
//!
//! Every stored record carries a `_type` tag. Loading goes through the
//! `Record` trait so a document of the wrong kind is rejected, and
//! `AnyRecord` restores whichever kind a document turns out to be.

use crate::error::{MantisError, Result};
use crate::mantis::MantisRecord;
use crate::model::Model;
use serde_json::Value;

/// Field holding the type tag
pub const TYPE_FIELD: &str = "_type";

/// A record that can be restored from and serialized to a document
pub trait Record: Sized {
    /// Type tag stored under `_type`
    const TYPE_TAG: &'static str;

    /// Rebuild the record from a document already checked for its tag
    fn restore(document: &Value) -> Result<Self>;

    /// Full document, without the type tag
    fn to_document(&self) -> Value;

    /// Restore after checking the type tag
    fn from_document(document: &Value) -> Result<Self> {
        match type_tag(document) {
            Some(tag) if tag == Self::TYPE_TAG => Self::restore(document),
            Some(tag) => Err(MantisError::InvalidDocument(format!(
                "expected a {} record, found {}",
                Self::TYPE_TAG,
                tag
            ))),
            None => Err(MantisError::InvalidDocument(format!(
                "document has no {} tag",
                TYPE_FIELD
            ))),
        }
    }

    /// Tagged document ready to be stored
    fn to_tagged_document(&self) -> Value {
        let mut document = self.to_document();
        if let Some(object) = document.as_object_mut() {
            object.insert(TYPE_FIELD.to_string(), Value::String(Self::TYPE_TAG.to_string()));
        }
        document
    }
}

fn type_tag(document: &Value) -> Option<&str> {
    document.get(TYPE_FIELD).and_then(Value::as_str)
}

/// Any known record kind
#[derive(Debug, Clone)]
pub enum AnyRecord {
    Model(Model),
    Mantis(MantisRecord),
}

impl AnyRecord {
    pub fn restore(document: &Value) -> Result<Self> {
        match type_tag(document) {
            Some(tag) if tag == Model::TYPE_TAG => Ok(Self::Model(Model::restore(document)?)),
            Some(tag) if tag == MantisRecord::TYPE_TAG => {
                Ok(Self::Mantis(MantisRecord::restore(document)?))
            }
            Some(other) => Err(MantisError::InvalidDocument(format!(
                "unknown record type {}",
                other
            ))),
            None => Err(MantisError::InvalidDocument(format!(
                "document has no {} tag",
                TYPE_FIELD
            ))),
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            AnyRecord::Model(_) => Model::TYPE_TAG,
            AnyRecord::Mantis(_) => MantisRecord::TYPE_TAG,
        }
    }

    pub fn to_tagged_document(&self) -> Value {
        match self {
            AnyRecord::Model(model) => model.to_tagged_document(),
            AnyRecord::Mantis(record) => record.to_tagged_document(),
        }
    }
}
