use nervusdb::{params_from_json, Db, ErrorKind, Params, Value};
use serde_json::json;
use tempfile::TempDir;

fn open() -> (TempDir, Db) {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    (dir, db)
}

fn params(pairs: &[(&str, Value)]) -> Params {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[test]
fn test_scalar_parameters() {
    let (_dir, db) = open();
    let p = params(&[("name", Value::from("Alice")), ("age", Value::Int(30)), ("nothing", Value::Null)]);
    let result = db.query_with_params("RETURN $name AS name, $age + 1 AS next, $nothing AS n", &p).unwrap();
    let row = &result.rows[0];
    assert_eq!(row["name"], Value::from("Alice"));
    assert_eq!(row["next"], Value::Int(31));
    assert_eq!(row["n"], Value::Null);
}

#[test]
fn test_parameters_in_writes_and_filters() {
    let (_dir, db) = open();
    let p = params(&[("name", Value::from("Bob")), ("age", Value::Int(42))]);
    db.execute_write_with_params("CREATE (:Person {name: $name, age: $age})", &p).unwrap();

    let filter = params(&[("min", Value::Int(40))]);
    let result = db
        .query_with_params("MATCH (n:Person) WHERE n.age >= $min RETURN n.name", &filter)
        .unwrap();
    assert_eq!(result.single("n.name"), Some(&Value::from("Bob")));

    let props = params(&[("props", Value::Map([("name".to_string(), Value::from("Bob"))].into_iter().collect()))]);
    let by_map = db.query_with_params("MATCH (n:Person $props) RETURN n.age", &props).unwrap();
    assert_eq!(by_map.single("n.age"), Some(&Value::Int(42)));
}

#[test]
fn test_list_parameter_with_unwind_and_limit() {
    let (_dir, db) = open();
    let p = params(&[
        ("items", Value::List(vec![1.into(), 2.into(), 3.into()])),
        ("n", Value::Int(2)),
    ]);
    let result = db.query_with_params("UNWIND $items AS x RETURN x LIMIT $n", &p).unwrap();
    assert_eq!(result.column("x"), vec![&Value::Int(1), &Value::Int(2)]);

    db.execute_write_with_params("UNWIND $items AS i CREATE (:Item {i: i})", &p).unwrap();
    assert_eq!(db.query("MATCH (n:Item) RETURN n").unwrap().len(), 3);
}

#[test]
fn test_missing_parameter() {
    let (_dir, db) = open();
    let err = db.query("RETURN $absent AS v").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(err.to_string().contains("absent"));
}

#[test]
fn test_entity_parameter_is_rejected() {
    let (_dir, db) = open();
    db.execute_write("CREATE (:Person {name: 'Alice'})").unwrap();
    let node = db.query("MATCH (n:Person) RETURN n").unwrap().single("n").cloned().unwrap();

    let p = params(&[("node", node)]);
    let err = db.query_with_params("RETURN $node AS v", &p).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
}

#[test]
fn test_params_from_json() {
    let (_dir, db) = open();
    let p = params_from_json(&json!({
        "name": "Carol",
        "tags": ["x", "y"],
        "meta": {"level": 3},
        "score": 2.5,
        "none": null
    }))
    .unwrap();
    let result = db
        .query_with_params(
            "RETURN $name AS name, size($tags) AS tags, $meta.level AS level, $score AS score, $none AS none",
            &p,
        )
        .unwrap();
    let row = &result.rows[0];
    assert_eq!(row["name"], Value::from("Carol"));
    assert_eq!(row["tags"], Value::Int(2));
    assert_eq!(row["level"], Value::Int(3));
    assert_eq!(row["score"], Value::Float(2.5));
    assert_eq!(row["none"], Value::Null);

    assert!(params_from_json(&json!([1, 2])).is_err());
    assert!(params_from_json(&json!({"big": u64::MAX})).is_err());
}

#[test]
fn test_parameter_does_not_reparse() {
    let (_dir, db) = open();
    // Quotes in a parameter are data, never syntax
    let p = params(&[("name", Value::from("O'Reilly') RETURN 1 //"))]);
    db.execute_write_with_params("CREATE (:Q {name: $name})", &p).unwrap();
    let result = db.query("MATCH (n:Q) RETURN n.name").unwrap();
    assert_eq!(result.single("n.name"), Some(&Value::from("O'Reilly') RETURN 1 //")));
}
