//! Set runners and the set wire encoding.
//!
//! A set is marshaled as a sequence of elements, each prefixed by its
//! length as a little-endian u64. Elements are written in sorted order so
//! that every replica converges on identical bytes (and therefore an
//! identical version) regardless of commit interleaving.

use std::collections::BTreeSet;

use super::{OperationError, Value};

/// Insert the operand into the current set.
pub(super) fn sadd(input: &[u8], current: &mut Value) -> Result<(), OperationError> {
    let members = current.set_members()?;
    members.insert(input.to_vec());
    current.sync_set_raw();
    Ok(())
}

/// Remove the operand from the current set.
pub(super) fn srem(input: &[u8], current: &mut Value) -> Result<(), OperationError> {
    let members = current.set_members()?;
    members.remove(input);
    current.sync_set_raw();
    Ok(())
}

/// Marshal a set into its canonical byte form.
pub(crate) fn encode(members: &BTreeSet<Vec<u8>>) -> Vec<u8> {
    let total: usize = members.iter().map(|m| 8 + m.len()).sum();
    let mut out = Vec::with_capacity(total);
    for member in members {
        out.extend_from_slice(&(member.len() as u64).to_le_bytes());
        out.extend_from_slice(member);
    }
    out
}

/// Parse a marshaled set. The empty input is the empty set.
pub(crate) fn decode(raw: &[u8]) -> Result<BTreeSet<Vec<u8>>, OperationError> {
    let mut members = BTreeSet::new();
    let mut rest = raw;

    while !rest.is_empty() {
        if rest.len() < 8 {
            return Err(OperationError::NotValidSet);
        }
        let (len_bytes, tail) = rest.split_at(8);
        let len = u64::from_le_bytes(len_bytes.try_into().expect("split_at yields 8 bytes")) as usize;
        if tail.len() < len {
            return Err(OperationError::NotValidSet);
        }

        members.insert(tail[..len].to_vec());
        rest = &tail[len..];
    }

    Ok(members)
}
