//! Numeric runners over arbitrary-precision decimal text.

use super::{OperationError, Value};
use bigdecimal::BigDecimal;

fn parse_operand(input: &[u8]) -> Result<BigDecimal, OperationError> {
    std::str::from_utf8(input)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or(OperationError::NotNumeric)
}

/// Add the operand to the current value.
pub(super) fn add(input: &[u8], current: &mut Value) -> Result<(), OperationError> {
    let operand = parse_operand(input)?;
    let value = current.float()?;
    current.store_float(value + operand);
    Ok(())
}

/// Multiply the current value by the operand.
pub(super) fn mul(input: &[u8], current: &mut Value) -> Result<(), OperationError> {
    let operand = parse_operand(input)?;
    let value = current.float()?;
    current.store_float(value * operand);
    Ok(())
}
