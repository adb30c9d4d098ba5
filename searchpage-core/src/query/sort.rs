use serde_json::{json, Map, Value};

use crate::api::errors::ValidationError;
use crate::api::types::{FieldType, SortSpec, SortValue};

/// Compiles a sort spec into the backend's `sort` array, preserving order.
pub fn compile_sort(spec: &SortSpec) -> Value {
  let fields = spec
    .fields
    .iter()
    .map(|sort| {
      let mut opts = Map::new();
      opts.insert("order".into(), json!(sort.order.as_str()));
      if let Some(ty) = sort.unmapped_type {
        opts.insert("unmapped_type".into(), json!(ty.as_str()));
      }
      json!({ sort.field.as_str(): opts })
    })
    .collect();
  Value::Array(fields)
}

/// Checks a search-after cursor against the active sort.
///
/// An empty cursor is the first page and always passes. Otherwise the cursor
/// must have one value per sort field, and each value must fit the field's
/// declared type when one is declared. `null` stands for a missing value and
/// fits every type.
pub fn validate_cursor(spec: &SortSpec, values: &[SortValue]) -> Result<(), ValidationError> {
  if spec.is_empty() {
    return Err(ValidationError::SearchAfterWithoutSort);
  }
  if values.is_empty() {
    return Ok(());
  }
  if values.len() != spec.len() {
    return Err(ValidationError::CursorArity {
      expected: spec.len(),
      actual: values.len(),
    });
  }
  for (position, (field, value)) in spec.fields.iter().zip(values.iter()).enumerate() {
    let Some(ty) = field.unmapped_type else {
      continue;
    };
    if !accepts(ty, value) {
      return Err(ValidationError::CursorType {
        position,
        field: field.field.clone(),
        expected: ty.as_str().to_string(),
      });
    }
  }
  Ok(())
}

fn accepts(ty: FieldType, value: &SortValue) -> bool {
  match (ty, value) {
    (_, SortValue::Null) => true,
    (FieldType::Long, SortValue::I64(_) | SortValue::U64(_)) => true,
    (FieldType::Double, SortValue::I64(_) | SortValue::U64(_) | SortValue::F64(_)) => true,
    // Dates sort as epoch millis but may be echoed back formatted.
    (FieldType::Date, SortValue::I64(_) | SortValue::U64(_) | SortValue::Str(_)) => true,
    (FieldType::Keyword, SortValue::Str(_)) => true,
    (FieldType::Boolean, SortValue::Bool(_) | SortValue::I64(0 | 1)) => true,
    _ => false,
  }
}
