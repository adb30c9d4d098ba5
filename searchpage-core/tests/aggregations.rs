use searchpage_core::api::{MetricValue, Operation};
use searchpage_core::{
  AggregationResult, AggregationSpec, Expression, InMemoryBackend, Operand, SearchClient,
  SearchError, SortOrder, ValidationError,
};
use serde_json::{json, Value};

fn staff() -> SearchClient<InMemoryBackend> {
  let backend = InMemoryBackend::new();
  backend
    .insert_many(
      "staff",
      Some("name"),
      vec![
        json!({"name": "ada", "dept": "eng", "salary": 120, "age": 34, "hired": "2021-01-10"}),
        json!({"name": "bob", "dept": "eng", "salary": 95, "age": 29, "hired": "2021-01-25"}),
        json!({"name": "cy", "dept": "eng", "salary": 150, "age": 61, "hired": "2021-03-02"}),
        json!({"name": "di", "dept": "ops", "salary": 70, "age": 23, "hired": "2021-03-15"}),
        json!({"name": "ed", "dept": "ops", "salary": 88, "age": 65, "hired": "2021-03-30"}),
        json!({"name": "flo", "dept": "sales", "salary": 60, "age": 31, "hired": "2021-01-02"}),
      ],
    )
    .unwrap();
  SearchClient::new(backend)
}

fn keys(result: &AggregationResult) -> Vec<Value> {
  result.buckets().iter().map(|b| b.key.clone()).collect()
}

#[test]
fn stats_over_a_filtered_set() {
  let client = staff();
  let result = client
    .aggregate(
      "staff",
      &AggregationSpec::stats("salary"),
      Some(&Expression::term("dept", "eng")),
    )
    .unwrap();
  let AggregationResult::Stats(stats) = &result else {
    panic!("expected stats, got {result:?}");
  };
  assert_eq!(stats.count, 3);
  assert_eq!(stats.min, Some(95.0));
  assert_eq!(stats.max, Some(150.0));
  assert_eq!(stats.sum, 365.0);
}

#[test]
fn percentiles_are_keyed_by_printed_percent() {
  let client = staff();
  let result = client
    .aggregate("staff", &AggregationSpec::percentiles("age"), None)
    .unwrap();
  let AggregationResult::Percentiles(percentiles) = &result else {
    panic!("expected percentiles, got {result:?}");
  };
  assert!(percentiles.values.contains_key("50.0"));
  let median = percentiles.get(50.0).unwrap();
  assert!((32.0..=33.0).contains(&median), "median was {median}");
}

#[test]
fn top_hit_per_department_is_the_best_paid() {
  let client = staff();
  let spec = AggregationSpec::terms("dept", 10)
    .with_child("best", AggregationSpec::top_hits(1, "salary", SortOrder::Desc))
    .unwrap();
  let result = client.aggregate("staff", &spec, None).unwrap();
  assert_eq!(keys(&result), vec![json!("eng"), json!("ops"), json!("sales")]);
  let winners: Vec<(Value, String)> = result
    .top_hits()
    .into_iter()
    .map(|top| {
      let name = top.hit.source.get("name").and_then(Value::as_str).unwrap().to_string();
      (top.bucket_key, name)
    })
    .collect();
  assert_eq!(
    winners,
    vec![
      (json!("eng"), "cy".to_string()),
      (json!("ops"), "ed".to_string()),
      (json!("sales"), "flo".to_string()),
    ]
  );
  assert_eq!(result.top_hits()[0].hit.id.as_deref(), Some("cy"));
}

#[test]
fn histogram_keeps_empty_buckets_inside_bounds() {
  let client = staff();
  let result = client
    .aggregate("staff", &AggregationSpec::histogram("age", 20.0, 0.0, 80.0), None)
    .unwrap();
  let summary: Vec<(f64, u64)> = result
    .buckets()
    .iter()
    .map(|b| (b.key.as_f64().unwrap(), b.doc_count))
    .collect();
  assert_eq!(
    summary,
    vec![(0.0, 0), (20.0, 4), (40.0, 0), (60.0, 2), (80.0, 0)]
  );
}

#[test]
fn nested_buckets_carry_metrics() {
  let client = staff();
  let spec = AggregationSpec::terms("dept", 2)
    .with_child("pay", AggregationSpec::stats("salary"))
    .unwrap();
  let result = client.aggregate("staff", &spec, None).unwrap();
  assert_eq!(result.buckets().len(), 2);
  let ops = &result.buckets()[1];
  assert_eq!(ops.key, json!("ops"));
  match ops.metrics.get("pay") {
    Some(MetricValue::Stats(stats)) => assert_eq!(stats.avg, Some(79.0)),
    other => panic!("unexpected metric {other:?}"),
  }
}

#[test]
fn children_on_a_metric_fail_before_any_request() {
  let err = AggregationSpec::stats("salary")
    .with_child("best", AggregationSpec::top_hits(1, "salary", SortOrder::Desc))
    .unwrap_err();
  assert!(matches!(err, ValidationError::ChildOnMetric { ref name } if name == "best"));
  let err: SearchError = err.into();
  assert!(err.to_string().contains("best"));
}

#[test]
fn histogram_over_huge_bounds_is_a_backend_error() {
  let client = staff();
  let err = client
    .aggregate(
      "staff",
      &AggregationSpec::histogram("age", 1.0, -1e19, 1e19),
      None,
    )
    .unwrap_err();
  assert!(matches!(
    err,
    SearchError::Backend { op: Operation::Aggregate, .. }
  ));
}

#[test]
fn date_histogram_buckets_by_month() {
  let client = staff();
  let spec = AggregationSpec::date_histogram("hired", "month", Some("yyyy-MM"));
  let result = client.aggregate("staff", &spec, None).unwrap();
  let labels: Vec<(Option<String>, u64)> = result
    .buckets()
    .iter()
    .map(|b| (b.key_as_string.clone(), b.doc_count))
    .collect();
  assert_eq!(
    labels,
    vec![
      (Some("2021-01".to_string()), 3),
      (Some("2021-02".to_string()), 0),
      (Some("2021-03".to_string()), 3),
    ]
  );
}

#[test]
fn top_hits_needs_a_bucket() {
  let client = staff();
  let err = client
    .aggregate(
      "staff",
      &AggregationSpec::top_hits(1, "salary", SortOrder::Desc),
      None,
    )
    .unwrap_err();
  assert!(matches!(
    err,
    SearchError::Validation(ValidationError::TopHitsWithoutBucket)
  ));
}

#[test]
fn unknown_date_interval_is_rejected() {
  let client = staff();
  let err = client
    .aggregate(
      "staff",
      &AggregationSpec::date_histogram("hired", "fortnight", None),
      None,
    )
    .unwrap_err();
  assert!(matches!(
    err,
    SearchError::Validation(ValidationError::UnknownDateInterval { .. })
  ));
}

#[test]
fn count_and_suggest() {
  let client = staff();
  let older = Expression::range("age", Some(json!(40)), None, None);
  assert_eq!(client.count("staff", &older).unwrap(), 2);
  assert_eq!(
    client
      .count("staff", &Expression::matches("dept", Operand::collection(["ops", "sales"])))
      .unwrap(),
    3
  );

  let names = client.suggest("staff", "dept", "E", 5).unwrap();
  assert_eq!(names, vec!["eng".to_string()]);
  assert!(client.suggest("staff", "dept", "x", 5).unwrap().is_empty());
}

#[test]
fn count_on_missing_index_is_a_backend_error() {
  let client = staff();
  let err = client.count("nowhere", &Expression::MatchAll).unwrap_err();
  assert!(matches!(
    err,
    SearchError::Backend { op: Operation::Count, .. }
  ));
}
