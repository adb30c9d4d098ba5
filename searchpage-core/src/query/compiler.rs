use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::api::errors::ValidationError;
use crate::api::types::{Expression, Operand};

/// A query in the backend's native JSON DSL.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BackendQuery(Value);

impl BackendQuery {
  pub fn match_all() -> Self {
    BackendQuery(json!({ "match_all": {} }))
  }

  pub fn as_json(&self) -> &Value {
    &self.0
  }

  pub fn into_json(self) -> Value {
    self.0
  }
}

/// Compiles an expression into the backend query DSL.
///
/// One backend construct per variant. The only rewrites are the `Match`
/// multiplicity split, the `*` prefix on wildcards, and picking `gte`/`lte`
/// for ranges. Field names are not checked here; unknown fields surface when
/// the backend runs the request.
pub fn compile(expr: &Expression) -> Result<BackendQuery, ValidationError> {
  compile_node(expr).map(BackendQuery)
}

/// ANDs every expression through `must`. Never ORs.
pub fn build_multi_query(exprs: Vec<Expression>) -> Expression {
  Expression::Bool {
    must: exprs,
    should: Vec::new(),
    must_not: Vec::new(),
    minimum_should_match: None,
  }
}

/// Builds one compound from several `(field, operand)` pairs: scalar operands
/// become `must` term clauses, collection operands become `should` term clauses
/// with `minimum_should_match = 1`.
pub fn match_fields<I, F>(entries: I) -> Expression
where
  I: IntoIterator<Item = (F, Operand)>,
  F: Into<String>,
{
  let mut must = Vec::new();
  let mut should = Vec::new();
  for (field, operand) in entries {
    let field = field.into();
    match operand {
      Operand::Scalar(value) => must.push(Expression::Term { field, value }),
      Operand::Collection(values) => should.extend(values.into_iter().map(|value| {
        Expression::Term {
          field: field.clone(),
          value,
        }
      })),
    }
  }
  let minimum_should_match = if should.is_empty() { None } else { Some(1) };
  Expression::Bool {
    must,
    should,
    must_not: Vec::new(),
    minimum_should_match,
  }
}

/// Completion suggester body; duplicates are skipped backend-side.
pub fn compile_completion_suggest(field: &str, prefix: &str, size: u32) -> Value {
  json!({
    "suggest": {
      field: {
        "prefix": prefix,
        "completion": {
          "field": field,
          "size": size,
          "skip_duplicates": true,
        }
      }
    }
  })
}

fn compile_node(expr: &Expression) -> Result<Value, ValidationError> {
  match expr {
    Expression::MatchAll => Ok(json!({ "match_all": {} })),
    Expression::Term { field, value } => Ok(term(field, value)),
    Expression::Text { field, text } => Ok(json!({ "match": { field: { "query": text } } })),
    Expression::Match { field, operand } => match operand {
      Operand::Scalar(value) => Ok(json!({ "bool": { "must": [term(field, value)] } })),
      Operand::Collection(values) => {
        if values.is_empty() {
          return Err(ValidationError::EmptyOperand {
            field: field.clone(),
          });
        }
        let should: Vec<Value> = values.iter().map(|v| term(field, v)).collect();
        Ok(json!({ "bool": { "should": should, "minimum_should_match": 1 } }))
      }
    },
    Expression::Fuzzy {
      field,
      value,
      fuzziness,
      prefix_length,
      max_expansions,
    } => {
      if *fuzziness > 2 {
        return Err(ValidationError::FuzzinessOutOfRange {
          field: field.clone(),
          fuzziness: *fuzziness,
        });
      }
      Ok(json!({
        "match": {
          field: {
            "query": value,
            "fuzziness": fuzziness,
            "prefix_length": prefix_length,
            "max_expansions": max_expansions,
          }
        }
      }))
    }
    Expression::Prefix { field, value } => Ok(json!({ "prefix": { field: { "value": value } } })),
    Expression::Range {
      field,
      lower,
      upper,
      format,
    } => {
      let mut bounds = Map::new();
      if let Some(lower) = lower {
        bounds.insert("gte".into(), lower.clone());
      }
      if let Some(upper) = upper {
        bounds.insert("lte".into(), upper.clone());
      }
      if bounds.is_empty() {
        return Err(ValidationError::RangeWithoutBounds {
          field: field.clone(),
        });
      }
      if let Some(format) = format {
        bounds.insert("format".into(), Value::String(format.clone()));
      }
      Ok(json!({ "range": { field: bounds } }))
    }
    Expression::Wildcard { field, pattern } => {
      let value = format!("*{}", pattern.trim());
      Ok(json!({ "wildcard": { field: { "value": value } } }))
    }
    Expression::MultiMatch { fields, value } => {
      if fields.is_empty() {
        return Err(ValidationError::EmptyMultiMatchFields);
      }
      Ok(json!({ "multi_match": { "query": value, "fields": fields } }))
    }
    Expression::Bool {
      must,
      should,
      must_not,
      minimum_should_match,
    } => {
      if should.is_empty() {
        if let Some(minimum) = (*minimum_should_match).filter(|m| *m > 0) {
          return Err(ValidationError::MinimumShouldMatchWithoutShould { minimum });
        }
      }
      let mut body = Map::new();
      for (key, clauses) in [("must", must), ("should", should), ("must_not", must_not)] {
        if clauses.is_empty() {
          continue;
        }
        let compiled = clauses
          .iter()
          .map(compile_node)
          .collect::<Result<Vec<_>, _>>()?;
        body.insert(key.into(), Value::Array(compiled));
      }
      if let Some(minimum) = minimum_should_match {
        if !should.is_empty() {
          body.insert("minimum_should_match".into(), json!(minimum));
        }
      }
      Ok(json!({ "bool": body }))
    }
  }
}

fn term(field: &str, value: &Value) -> Value {
  json!({ "term": { field: { "value": value } } })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn collection_match_compiles_to_should() {
    let expr = Expression::matches("color", Operand::collection(["red", "blue"]));
    let compiled = compile(&expr).unwrap();
    assert_eq!(
      compiled.as_json(),
      &json!({
        "bool": {
          "should": [
            {"term": {"color": {"value": "red"}}},
            {"term": {"color": {"value": "blue"}}}
          ],
          "minimum_should_match": 1
        }
      })
    );
  }

  #[test]
  fn scalar_match_compiles_to_must_term() {
    let expr = Expression::matches("color", Operand::scalar("red"));
    let compiled = compile(&expr).unwrap();
    assert_eq!(
      compiled.as_json(),
      &json!({"bool": {"must": [{"term": {"color": {"value": "red"}}}]}})
    );
  }

  #[test]
  fn empty_collection_is_rejected() {
    let expr = Expression::matches("color", Operand::Collection(vec![]));
    assert_eq!(
      compile(&expr).unwrap_err(),
      ValidationError::EmptyOperand {
        field: "color".into()
      }
    );
  }

  #[test]
  fn range_picks_bounds() {
    let lower = compile(&Expression::range("age", Some(json!(10)), None, None)).unwrap();
    assert_eq!(lower.as_json(), &json!({"range": {"age": {"gte": 10}}}));
    let upper = compile(&Expression::range("age", None, Some(json!(20)), None)).unwrap();
    assert_eq!(upper.as_json(), &json!({"range": {"age": {"lte": 20}}}));
    let both = compile(&Expression::range(
      "born",
      Some(json!("2020-01-01")),
      Some(json!("2020-12-31")),
      Some("yyyy-MM-dd"),
    ))
    .unwrap();
    assert_eq!(
      both.as_json(),
      &json!({"range": {"born": {"gte": "2020-01-01", "lte": "2020-12-31", "format": "yyyy-MM-dd"}}})
    );
    assert!(matches!(
      compile(&Expression::range("age", None, None, None)),
      Err(ValidationError::RangeWithoutBounds { .. })
    ));
  }

  #[test]
  fn wildcard_is_trimmed_and_prefixed() {
    let compiled = compile(&Expression::wildcard("vin", "  4F2 ")).unwrap();
    assert_eq!(
      compiled.as_json(),
      &json!({"wildcard": {"vin": {"value": "*4F2"}}})
    );
  }

  #[test]
  fn multi_query_only_ands() {
    let expr = build_multi_query(vec![
      Expression::term("status", "active"),
      Expression::prefix("name", "jo"),
    ]);
    let compiled = compile(&expr).unwrap();
    let bool_body = &compiled.as_json()["bool"];
    assert_eq!(bool_body["must"].as_array().map(Vec::len), Some(2));
    assert!(bool_body.get("should").is_none());
  }

  #[test]
  fn minimum_should_match_without_should_is_rejected() {
    let expr = Expression::boolean(vec![Expression::MatchAll], vec![], Some(1));
    assert_eq!(
      compile(&expr).unwrap_err(),
      ValidationError::MinimumShouldMatchWithoutShould { minimum: 1 }
    );
    let zero = Expression::boolean(vec![Expression::MatchAll], vec![], Some(0));
    assert!(compile(&zero).is_ok());
  }

  #[test]
  fn fuzzy_carries_options_and_caps_edits() {
    let compiled = compile(&Expression::fuzzy("name", "jonh", 1, 2, 50)).unwrap();
    assert_eq!(
      compiled.as_json(),
      &json!({"match": {"name": {"query": "jonh", "fuzziness": 1, "prefix_length": 2, "max_expansions": 50}}})
    );
    assert!(compile(&Expression::fuzzy("name", "x", 3, 0, 50)).is_err());
  }

  #[test]
  fn match_fields_mixes_must_and_should() {
    let expr = match_fields([
      ("dept", Operand::scalar("sales")),
      ("city", Operand::collection(["paris", "rome"])),
    ]);
    let compiled = compile(&expr).unwrap();
    let body = &compiled.as_json()["bool"];
    assert_eq!(body["must"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["should"].as_array().map(Vec::len), Some(2));
    assert_eq!(body["minimum_should_match"], json!(1));
  }

  #[test]
  fn text_and_multi_match_use_full_text_queries() {
    let text = compile(&Expression::text("title", "rust search")).unwrap();
    assert_eq!(
      text.as_json(),
      &json!({"match": {"title": {"query": "rust search"}}})
    );
    let multi = compile(&Expression::multi_match(["title", "body"], "rust")).unwrap();
    assert_eq!(
      multi.as_json(),
      &json!({"multi_match": {"query": "rust", "fields": ["title", "body"]}})
    );
    assert_eq!(
      compile(&Expression::multi_match(Vec::<String>::new(), "rust")).unwrap_err(),
      ValidationError::EmptyMultiMatchFields
    );
  }
}
