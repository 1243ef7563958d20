//! Byte-level runners.

use super::{OperationError, Value};

/// Replace the current value with the operand.
pub(super) fn set(input: &[u8], current: &mut Value) -> Result<(), OperationError> {
    current.replace(input.to_vec());
    Ok(())
}

/// Append the operand to the current value.
pub(super) fn append(input: &[u8], current: &mut Value) -> Result<(), OperationError> {
    current.append(input);
    Ok(())
}
