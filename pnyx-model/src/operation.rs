//! Database operations and the parallelism matrix.
//!
//! Two operations on the same key from different queries may only commit in
//! parallel when the matrix allows their combination. Operations on
//! different keys never conflict.

use std::fmt;

/// Opcode of a single database operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub enum Opcode {
    Set,
    Concat,
    Add,
    Mul,
    Sadd,
    Srem,
}

impl Opcode {
    pub const ALL: [Opcode; 6] = [
        Opcode::Set,
        Opcode::Concat,
        Opcode::Add,
        Opcode::Mul,
        Opcode::Sadd,
        Opcode::Srem,
    ];
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Set => "SET",
            Opcode::Concat => "CONCAT",
            Opcode::Add => "ADD",
            Opcode::Mul => "MUL",
            Opcode::Sadd => "SADD",
            Opcode::Srem => "SREM",
        };
        f.write_str(name)
    }
}

/// A single mutation: apply `op` with operand `data` to the value at `key`.
#[derive(
    Debug, Clone, PartialEq, Eq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub struct Operation {
    pub key: String,
    pub op: Opcode,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Parallelism rule flags. A zero rule means the combination is never
/// parallelizable.
pub mod parallel {
    pub const DEFAULT: u8 = 0x01;
    pub const DISALLOW_DIFFERENT: u8 = 0x02;
    pub const DISALLOW_EQUAL: u8 = 0x04;
}

/// Static parallelism matrix indexed by (first, second) opcode.
pub const fn parallel_rule(first: Opcode, second: Opcode) -> u8 {
    use Opcode::*;
    match (first, second) {
        (Set, Set) => parallel::DISALLOW_DIFFERENT,
        (Add, Add) => parallel::DEFAULT,
        (Mul, Mul) => parallel::DEFAULT,
        (Sadd, Sadd) => parallel::DEFAULT,
        (Sadd, Srem) => parallel::DISALLOW_EQUAL,
        (Srem, Srem) => parallel::DEFAULT,
        (Srem, Sadd) => parallel::DISALLOW_EQUAL,
        _ => 0,
    }
}

/// Returned when two operations cannot be executed in parallel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("non-parallel operations {first} / {second} on key {key:?}")]
pub struct ConflictError {
    pub first: Opcode,
    pub second: Opcode,
    pub key: String,
}

impl Operation {
    /// Returns an error if two operations cannot be executed in parallel.
    pub fn check_conflict(&self, other: &Operation) -> Result<(), ConflictError> {
        if self.key != other.key {
            return Ok(());
        }

        let conflict = || ConflictError {
            first: self.op,
            second: other.op,
            key: self.key.clone(),
        };

        let rule = parallel_rule(self.op, other.op);
        if rule == 0 {
            return Err(conflict());
        }

        if rule & parallel::DEFAULT != 0 {
            return Ok(()); // bypass operand checks
        }

        let equal = self.data == other.data;
        if equal && rule & parallel::DISALLOW_EQUAL != 0 {
            return Err(conflict());
        }
        if !equal && rule & parallel::DISALLOW_DIFFERENT != 0 {
            return Err(conflict());
        }

        Ok(())
    }
}
