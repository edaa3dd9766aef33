//! Scalar functions and operators evaluated through full queries

use nervusdb::{Db, ErrorKind, Value};
use tempfile::TempDir;

fn open() -> (TempDir, Db) {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    (dir, db)
}

fn eval(db: &Db, expression: &str) -> Value {
    let result = db.query(&format!("RETURN {} AS v", expression)).unwrap();
    result.single("v").cloned().unwrap()
}

#[test]
fn test_arithmetic() {
    let (_dir, db) = open();
    let result = db.query("RETURN 10 + 3 AS a, 10 - 3 AS b, 10 * 3 AS c, 10 / 3 AS d, 10 % 3 AS e").unwrap();
    let row = &result.rows[0];
    assert_eq!(row["a"], Value::Int(13));
    assert_eq!(row["b"], Value::Int(7));
    assert_eq!(row["c"], Value::Int(30));
    assert_eq!(row["d"], Value::Int(3));
    assert_eq!(row["e"], Value::Int(1));

    assert_eq!(eval(&db, "10 / 4.0"), Value::Float(2.5));
    assert_eq!(eval(&db, "2 ^ 3"), Value::Float(8.0));
    assert_eq!(eval(&db, "2 ^ 3 ^ 2"), Value::Float(64.0));
    assert_eq!(eval(&db, "-2 ^ 2"), Value::Float(4.0));
    assert_eq!(eval(&db, "-7 / 2"), Value::Int(-3));
    assert_eq!(eval(&db, "1 + null"), Value::Null);
    assert_eq!(eval(&db, "'a' + 1"), Value::from("a1"));
    assert_eq!(eval(&db, "[1] + [2, 3]"), Value::List(vec![1.into(), 2.into(), 3.into()]));
}

#[test]
fn test_division_by_zero_and_overflow() {
    let (_dir, db) = open();
    assert_eq!(db.query("RETURN 1 / 0 AS v").unwrap_err().kind(), ErrorKind::Execution);
    assert_eq!(db.query("RETURN 1 % 0 AS v").unwrap_err().kind(), ErrorKind::Execution);
    assert_eq!(db.query("RETURN 9223372036854775807 + 1 AS v").unwrap_err().kind(), ErrorKind::Execution);
    assert_eq!(eval(&db, "1.0 / 0"), Value::Float(f64::INFINITY));
}

#[test]
fn test_integer_literal_bounds() {
    let (_dir, db) = open();
    assert_eq!(eval(&db, "-9223372036854775808"), Value::Int(i64::MIN));
    assert_eq!(eval(&db, "9223372036854775807"), Value::Int(i64::MAX));

    let err = db.query("RETURN 9223372036854775808 AS v").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert!(err.to_string().contains("out of range"));

    let err = db.execute_write("CREATE (:N {v: 9223372036854775808})").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert!(db.query("MATCH (n:N) RETURN n").unwrap().is_empty());

    assert_eq!(db.query("RETURN --9223372036854775808 AS v").unwrap_err().kind(), ErrorKind::Execution);
}

#[test]
fn test_string_functions() {
    let (_dir, db) = open();
    assert_eq!(eval(&db, "toString(42)"), Value::from("42"));
    assert_eq!(eval(&db, "toString(2.0)"), Value::from("2.0"));
    assert_eq!(eval(&db, "toUpper('hello')"), Value::from("HELLO"));
    assert_eq!(eval(&db, "toLower('HELLO')"), Value::from("hello"));
    assert_eq!(eval(&db, "trim('  hi  ')"), Value::from("hi"));
    assert_eq!(eval(&db, "lTrim('  hi')"), Value::from("hi"));
    assert_eq!(eval(&db, "rTrim('hi  ')"), Value::from("hi"));
    assert_eq!(eval(&db, "substring('hello', 1, 3)"), Value::from("ell"));
    assert_eq!(eval(&db, "substring('hello', 2)"), Value::from("llo"));
    assert_eq!(eval(&db, "size('hello')"), Value::Int(5));
    assert_eq!(eval(&db, "replace('hello world', 'world', 'nervus')"), Value::from("hello nervus"));
    assert_eq!(eval(&db, "left('hello', 3)"), Value::from("hel"));
    assert_eq!(eval(&db, "right('hello', 3)"), Value::from("llo"));
    assert_eq!(eval(&db, "split('a,b', ',')"), Value::List(vec!["a".into(), "b".into()]));
    assert_eq!(eval(&db, "reverse('abc')"), Value::from("cba"));
    assert_eq!(eval(&db, "toUpper(null)"), Value::Null);
}

#[test]
fn test_numeric_functions() {
    let (_dir, db) = open();
    assert_eq!(eval(&db, "abs(-5)"), Value::Int(5));
    assert_eq!(eval(&db, "abs(-2.5)"), Value::Float(2.5));
    assert_eq!(eval(&db, "toInteger(3.7)"), Value::Int(3));
    assert_eq!(eval(&db, "toInteger('12')"), Value::Int(12));
    assert_eq!(eval(&db, "toInteger('x')"), Value::Null);
    assert_eq!(eval(&db, "toFloat(3)"), Value::Float(3.0));
    assert_eq!(eval(&db, "toBoolean('true')"), Value::Bool(true));
    assert_eq!(eval(&db, "sign(-5)"), Value::Int(-1));
    assert_eq!(eval(&db, "sign(0)"), Value::Int(0));
    assert_eq!(eval(&db, "sign(5)"), Value::Int(1));
    assert_eq!(eval(&db, "sqrt(16)"), Value::Float(4.0));
    assert_eq!(eval(&db, "ceil(1.2)"), Value::Float(2.0));
    assert_eq!(eval(&db, "floor(1.8)"), Value::Float(1.0));
    assert_eq!(eval(&db, "round(2.5)"), Value::Float(3.0));
}

#[test]
fn test_list_functions() {
    let (_dir, db) = open();
    assert_eq!(eval(&db, "range(1, 5, 2)"), Value::List(vec![1.into(), 3.into(), 5.into()]));
    assert_eq!(eval(&db, "head([1, 2, 3])"), Value::Int(1));
    assert_eq!(eval(&db, "last([1, 2, 3])"), Value::Int(3));
    assert_eq!(eval(&db, "tail([1, 2, 3])"), Value::List(vec![2.into(), 3.into()]));
    assert_eq!(eval(&db, "head([])"), Value::Null);
    assert_eq!(eval(&db, "size([1, 2, 3])"), Value::Int(3));
    assert_eq!(eval(&db, "[1, 2, 3][-1]"), Value::Int(3));
    assert_eq!(eval(&db, "[1, 2, 3, 4][1..3]"), Value::List(vec![2.into(), 3.into()]));
    assert_eq!(eval(&db, "[x IN range(1, 4) WHERE x % 2 = 0 | x * 10]"), Value::List(vec![20.into(), 40.into()]));
    assert_eq!(eval(&db, "coalesce(null, 2, 3)"), Value::Int(2));
    assert_eq!(eval(&db, "2 IN [1, 2]"), Value::Bool(true));
    assert_eq!(eval(&db, "3 IN [1, null]"), Value::Null);
}

#[test]
fn test_map_literals_and_access() {
    let (_dir, db) = open();
    let map = eval(&db, "{a: 1, b: 'two'}");
    let map = map.as_map().unwrap();
    assert_eq!(map["a"], Value::Int(1));
    assert_eq!(map["b"], Value::from("two"));
    assert_eq!(eval(&db, "{a: {b: 5}}.a.b"), Value::Int(5));
    assert_eq!(eval(&db, "keys({z: 1, a: 2})"), Value::List(vec!["a".into(), "z".into()]));
}

#[test]
fn test_entity_functions() {
    let (_dir, db) = open();
    db.execute_write("CREATE (a:TO {name: 'x'})-[:REL {w: 1}]->(b:TO {name: 'y'})").unwrap();
    let result = db
        .query(
            "MATCH (a)-[r:REL]->(b) RETURN labels(a) AS l, type(r) AS t, properties(r) AS p, \
             startNode(r).name AS s, endNode(r).name AS e",
        )
        .unwrap();
    let row = &result.rows[0];
    assert_eq!(row["l"], Value::List(vec!["TO".into()]));
    assert_eq!(row["t"], Value::from("REL"));
    assert_eq!(row["p"].as_map().unwrap()["w"], Value::Int(1));
    assert_eq!(row["s"], Value::from("x"));
    assert_eq!(row["e"], Value::from("y"));

    let path = db.query("MATCH p = (a)-[:REL]->(b) RETURN size(nodes(p)) AS n, size(relationships(p)) AS r").unwrap();
    assert_eq!(path.rows[0]["n"], Value::Int(2));
    assert_eq!(path.rows[0]["r"], Value::Int(1));
}

#[test]
fn test_three_valued_logic() {
    let (_dir, db) = open();
    assert_eq!(eval(&db, "null AND false"), Value::Bool(false));
    assert_eq!(eval(&db, "null OR true"), Value::Bool(true));
    assert_eq!(eval(&db, "null AND true"), Value::Null);
    assert_eq!(eval(&db, "NOT null"), Value::Null);
    assert_eq!(eval(&db, "true XOR false"), Value::Bool(true));
    assert_eq!(eval(&db, "null = null"), Value::Null);
    assert_eq!(eval(&db, "1 = 1.0"), Value::Bool(true));
    assert_eq!(eval(&db, "1 < 'a'"), Value::Null);
    assert_eq!(eval(&db, "null IS NULL"), Value::Bool(true));
}

#[test]
fn test_unknown_function() {
    let (_dir, db) = open();
    let err = db.query("RETURN nope(1) AS v").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(err.to_string().contains("nope"));
}
