//! Operation runners: per-opcode mutators over stored values.
//!
//! A runner transforms the current raw bytes of one key using the
//! operation's operand. Numeric and set interpretations are parsed lazily
//! and cached on the [`Value`] for the duration of one transaction.

mod float;
mod raw;
mod set;
mod value;

pub use value::Value;

use pnyx_model::{Opcode, Operation};

/// Errors returned when an operand does not match the stored datatype.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("non-numeric value")]
    NotNumeric,

    #[error("non-valid set")]
    NotValidSet,
}

/// Parse a marshaled set value into its elements.
pub fn decode_set(raw: &[u8]) -> Result<std::collections::BTreeSet<Vec<u8>>, OperationError> {
    set::decode(raw)
}

/// Apply one operation to the current value.
pub fn execute(op: &Operation, current: &mut Value) -> Result<(), OperationError> {
    match op.op {
        Opcode::Set => raw::set(&op.data, current),
        Opcode::Concat => raw::append(&op.data, current),
        Opcode::Add => float::add(&op.data, current),
        Opcode::Mul => float::mul(&op.data, current),
        Opcode::Sadd => set::sadd(&op.data, current),
        Opcode::Srem => set::srem(&op.data, current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(op: Opcode, data: &[u8], current: &[u8]) -> Result<Vec<u8>, OperationError> {
        let operation = Operation {
            key: "k".into(),
            op,
            data: data.to_vec(),
        };
        let mut value = Value::new(current.to_vec());
        execute(&operation, &mut value)?;
        Ok(value.into_raw())
    }

    #[test]
    fn set_replaces() {
        assert_eq!(run(Opcode::Set, b"42", b"old").unwrap(), b"42");
        assert_eq!(run(Opcode::Set, b"", b"old").unwrap(), b"");
    }

    #[test]
    fn concat_appends() {
        assert_eq!(run(Opcode::Concat, b"world", b"hello ").unwrap(), b"hello world");
        assert_eq!(run(Opcode::Concat, b"x", b"").unwrap(), b"x");
    }

    #[test]
    fn add_decimal_text() {
        assert_eq!(run(Opcode::Add, b"12", b"42").unwrap(), b"54");
        assert_eq!(run(Opcode::Add, b"0.5", b"1.25").unwrap(), b"1.75");
        // Missing value behaves as zero.
        assert_eq!(run(Opcode::Add, b"7", b"").unwrap(), b"7");
        assert_eq!(run(Opcode::Add, b"1", b"not a number"), Err(OperationError::NotNumeric));
    }

    #[test]
    fn mul_decimal_text() {
        assert_eq!(run(Opcode::Mul, b"6", b"7").unwrap(), b"42");
        assert_eq!(run(Opcode::Mul, b"0", b"123").unwrap(), b"0");
        assert_eq!(run(Opcode::Mul, b"2", b"oops"), Err(OperationError::NotNumeric));
    }

    #[test]
    fn sequential_arithmetic() {
        // SET "42" then ADD "12" must observe "54".
        let mut value = Value::new(Vec::new());
        execute(
            &Operation { key: "myVar".into(), op: Opcode::Set, data: b"42".to_vec() },
            &mut value,
        )
        .unwrap();
        execute(
            &Operation { key: "myVar".into(), op: Opcode::Add, data: b"12".to_vec() },
            &mut value,
        )
        .unwrap();
        assert_eq!(value.into_raw(), b"54");
    }

    #[test]
    fn set_membership() {
        let raw = run(Opcode::Sadd, b"alice", b"").unwrap();
        let raw = run(Opcode::Sadd, b"bob", &raw).unwrap();
        let raw2 = run(Opcode::Sadd, b"alice", &raw).unwrap();
        assert_eq!(raw, raw2, "set insertion is idempotent");

        let raw = run(Opcode::Srem, b"alice", &raw).unwrap();
        let members = set::decode(&raw).unwrap();
        assert!(members.contains(&b"bob".to_vec()));
        assert!(!members.contains(&b"alice".to_vec()));
    }

    #[test]
    fn set_encoding_is_order_independent() {
        let ab = run(Opcode::Sadd, b"b", &run(Opcode::Sadd, b"a", b"").unwrap()).unwrap();
        let ba = run(Opcode::Sadd, b"a", &run(Opcode::Sadd, b"b", b"").unwrap()).unwrap();
        assert_eq!(ab, ba, "insertion order must not change the stored bytes");
    }

    #[test]
    fn corrupt_set_rejected() {
        assert_eq!(
            run(Opcode::Sadd, b"x", b"\x05\x00\x00"),
            Err(OperationError::NotValidSet)
        );
    }
}
