//! The mutable value threaded through a transaction's runners.

use std::collections::BTreeSet;

use bigdecimal::BigDecimal;

use super::{set, OperationError};

/// Current bytes of one key, with lazily parsed numeric and set views.
///
/// One value, and only one, is used per key within a given transaction.
pub struct Value {
    raw: Vec<u8>,
    float: Option<BigDecimal>,
    set: Option<BTreeSet<Vec<u8>>>,
}

impl Value {
    pub fn new(raw: Vec<u8>) -> Self {
        Value {
            raw,
            float: None,
            set: None,
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    fn reset(&mut self) {
        self.float = None;
        self.set = None;
    }

    /// Replace the raw bytes, invalidating parsed views.
    pub(super) fn replace(&mut self, raw: Vec<u8>) {
        self.raw = raw;
        self.reset();
    }

    /// Append to the raw bytes, invalidating parsed views.
    pub(super) fn append(&mut self, data: &[u8]) {
        self.raw.extend_from_slice(data);
        self.reset();
    }

    /// Current value as an arbitrary-precision decimal. An empty value
    /// reads as zero.
    pub(super) fn float(&mut self) -> Result<BigDecimal, OperationError> {
        if let Some(f) = &self.float {
            return Ok(f.clone());
        }

        let parsed = if self.raw.is_empty() {
            BigDecimal::from(0)
        } else {
            std::str::from_utf8(&self.raw)
                .ok()
                .and_then(|text| text.trim().parse().ok())
                .ok_or(OperationError::NotNumeric)?
        };

        self.float = Some(parsed.clone());
        Ok(parsed)
    }

    /// Store a decimal result, re-marshaling the raw bytes as decimal text.
    pub(super) fn store_float(&mut self, value: BigDecimal) {
        let normalized = value.normalized();
        self.raw = normalized.to_string().into_bytes();
        self.set = None;
        self.float = Some(normalized);
    }

    /// Current value as a set of elements. An empty value reads as the
    /// empty set.
    pub(super) fn set_members(&mut self) -> Result<&mut BTreeSet<Vec<u8>>, OperationError> {
        if self.set.is_none() {
            self.set = Some(set::decode(&self.raw)?);
        }
        Ok(self.set.as_mut().expect("set view just populated"))
    }

    /// Re-marshal the raw bytes from the set view.
    pub(super) fn sync_set_raw(&mut self) {
        if let Some(members) = &self.set {
            self.raw = set::encode(members);
            self.float = None;
        }
    }
}
