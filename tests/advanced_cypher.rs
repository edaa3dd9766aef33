//! Integration tests for clauses and pattern shapes beyond plain MATCH/RETURN

use nervusdb::{Db, ErrorKind, Value};
use tempfile::TempDir;

fn open() -> (TempDir, Db) {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    (dir, db)
}

fn ints(db: &Db, query: &str, column: &str) -> Vec<i64> {
    let result = db.query(query).unwrap();
    result.column(column).into_iter().map(|v| v.as_int().unwrap()).collect()
}

fn strings(db: &Db, query: &str, column: &str) -> Vec<String> {
    let result = db.query(query).unwrap();
    result.column(column).into_iter().map(|v| v.as_str().unwrap().to_string()).collect()
}

fn people(db: &Db) {
    db.execute_write("CREATE (:P {name: 'A', age: 20})").unwrap();
    db.execute_write("CREATE (:P {name: 'B', age: 30})").unwrap();
    db.execute_write("CREATE (:P {name: 'C', age: 40})").unwrap();
    db.execute_write("CREATE (:P {name: 'Alice', age: 50})").unwrap();
    db.execute_write("CREATE (:P {name: 'NoAge'})").unwrap();
}

#[test]
fn test_where_predicates() {
    let (_dir, db) = open();
    people(&db);

    assert_eq!(strings(&db, "MATCH (n:P) WHERE n.age = 30 RETURN n.name", "n.name"), vec!["B"]);
    assert_eq!(
        strings(&db, "MATCH (n:P) WHERE n.age > 25 AND n.age < 45 RETURN n.name ORDER BY n.name", "n.name"),
        vec!["B", "C"]
    );
    assert_eq!(
        strings(&db, "MATCH (n:P) WHERE n.name = 'A' OR n.name = 'C' RETURN n.name ORDER BY n.name", "n.name"),
        vec!["A", "C"]
    );
    assert_eq!(
        strings(&db, "MATCH (n:P) WHERE NOT n.name = 'B' AND n.age < 45 RETURN n.name ORDER BY n.name", "n.name"),
        vec!["A", "C"]
    );
    assert_eq!(
        strings(&db, "MATCH (n:P) WHERE n.name IN ['A', 'C'] RETURN n.name ORDER BY n.name", "n.name"),
        vec!["A", "C"]
    );
    assert_eq!(
        strings(&db, "MATCH (n:P) WHERE n.name STARTS WITH 'A' RETURN n.name ORDER BY n.name", "n.name"),
        vec!["A", "Alice"]
    );
    assert_eq!(strings(&db, "MATCH (n:P) WHERE n.name CONTAINS 'lic' RETURN n.name", "n.name"), vec!["Alice"]);
    assert_eq!(strings(&db, "MATCH (n:P) WHERE n.name ENDS WITH 'e' RETURN n.name ORDER BY n.name", "n.name"), vec!["Alice", "NoAge"]);
    assert_eq!(strings(&db, "MATCH (n:P) WHERE n.age IS NULL RETURN n.name", "n.name"), vec!["NoAge"]);
    assert_eq!(db.query("MATCH (n:P) WHERE n.age IS NOT NULL RETURN n").unwrap().len(), 4);
    assert_eq!(strings(&db, "MATCH (n:P) WHERE n.name =~ 'A.*e' RETURN n.name", "n.name"), vec!["Alice"]);
}

#[test]
fn test_order_skip_limit() {
    let (_dir, db) = open();
    for v in [3, 1, 2, 5, 4] {
        db.execute_write(&format!("CREATE (:N {{v: {}}})", v)).unwrap();
    }

    let asc = ints(&db, "MATCH (n:N) RETURN n.v ORDER BY n.v", "n.v");
    assert_eq!(asc, vec![1, 2, 3, 4, 5]);
    let mut desc = ints(&db, "MATCH (n:N) RETURN n.v ORDER BY n.v DESC", "n.v");
    assert_eq!(desc, vec![5, 4, 3, 2, 1]);
    desc.reverse();
    assert_eq!(desc, asc);

    assert_eq!(ints(&db, "MATCH (n:N) RETURN n.v ORDER BY n.v LIMIT 3", "n.v"), vec![1, 2, 3]);
    assert_eq!(ints(&db, "MATCH (n:N) RETURN n.v ORDER BY n.v SKIP 2 LIMIT 2", "n.v"), vec![3, 4]);
    assert!(ints(&db, "MATCH (n:N) RETURN n.v ORDER BY n.v SKIP 5", "n.v").is_empty());
    assert!(db.query("MATCH (n:N) RETURN n LIMIT -1").is_err());
}

#[test]
fn test_order_by_puts_nulls_last() {
    let (_dir, db) = open();
    db.execute_write("CREATE (:O {v: 2}), (:O), (:O {v: 1})").unwrap();
    let result = db.query("MATCH (n:O) RETURN n.v AS v ORDER BY v").unwrap();
    assert_eq!(result.column("v"), vec![&Value::Int(1), &Value::Int(2), &Value::Null]);
    let result = db.query("MATCH (n:O) RETURN n.v AS v ORDER BY v DESC").unwrap();
    assert_eq!(result.column("v"), vec![&Value::Null, &Value::Int(2), &Value::Int(1)]);
}

#[test]
fn test_distinct_and_return_star() {
    let (_dir, db) = open();
    db.execute_write("CREATE (:D {v: 1}), (:D {v: 1}), (:D {v: 2})").unwrap();
    assert_eq!(ints(&db, "MATCH (n:D) RETURN DISTINCT n.v ORDER BY n.v", "n.v"), vec![1, 2]);

    let star = db.query("MATCH (n:D {v: 2}) RETURN *").unwrap();
    assert_eq!(star.columns, vec!["n"]);
    assert!(star.rows[0]["n"].as_node().is_some());
}

#[test]
fn test_with_pipeline() {
    let (_dir, db) = open();
    for v in 1..=5 {
        db.execute_write(&format!("CREATE (:N {{v: {}}})", v)).unwrap();
    }
    assert_eq!(ints(&db, "MATCH (n:N) WITH n.v AS val WHERE val > 3 RETURN val ORDER BY val", "val"), vec![4, 5]);

    // Variables not carried through WITH are out of scope
    let err = db.query("MATCH (n:N) WITH n.v AS val RETURN n").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);

    let result = db.query("MATCH (n:N) WITH n ORDER BY n.v DESC LIMIT 2 RETURN n.v AS v").unwrap();
    assert_eq!(result.column("v"), vec![&Value::Int(5), &Value::Int(4)]);
}

#[test]
fn test_unwind() {
    let (_dir, db) = open();
    assert_eq!(ints(&db, "UNWIND [10, 20, 30] AS x RETURN x", "x"), vec![10, 20, 30]);
    assert!(db.query("UNWIND [] AS x RETURN x").unwrap().is_empty());
    assert!(db.query("UNWIND null AS x RETURN x").unwrap().is_empty());

    db.execute_write("UNWIND [1, 2, 3] AS i CREATE (:UW {idx: i})").unwrap();
    assert_eq!(ints(&db, "MATCH (n:UW) RETURN n.idx ORDER BY n.idx", "n.idx"), vec![1, 2, 3]);
}

#[test]
fn test_union() {
    let (_dir, db) = open();
    assert_eq!(db.query("RETURN 1 AS x UNION RETURN 2 AS x").unwrap().len(), 2);
    assert_eq!(db.query("RETURN 1 AS x UNION RETURN 1 AS x").unwrap().len(), 1);
    assert_eq!(db.query("RETURN 1 AS x UNION ALL RETURN 1 AS x").unwrap().len(), 2);
    assert!(db.query("RETURN 1 AS x UNION RETURN 1 AS y").is_err());
}

#[test]
fn test_optional_match() {
    let (_dir, db) = open();
    db.execute_write("CREATE (:Lonely {name: 'solo'})").unwrap();
    db.execute_write("CREATE (:Lonely {name: 'pair'})-[:R]->(:Friend)").unwrap();

    let result = db
        .query("MATCH (n:Lonely) OPTIONAL MATCH (n)-[r]->(m) RETURN n.name AS name, r, m ORDER BY name")
        .unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result.rows[0]["name"], Value::from("pair"));
    assert!(result.rows[0]["r"].as_relationship().is_some());
    assert_eq!(result.rows[1]["name"], Value::from("solo"));
    assert_eq!(result.rows[1]["r"], Value::Null);
    assert_eq!(result.rows[1]["m"], Value::Null);
}

#[test]
fn test_case_expressions() {
    let (_dir, db) = open();
    db.execute_write("CREATE (:C {v: 1}), (:C {v: 2}), (:C {v: 3})").unwrap();
    assert_eq!(
        strings(
            &db,
            "MATCH (n:C) RETURN CASE n.v WHEN 1 THEN 'one' WHEN 2 THEN 'two' ELSE 'other' END AS label ORDER BY n.v",
            "label"
        ),
        vec!["one", "two", "other"]
    );
    assert_eq!(
        strings(
            &db,
            "MATCH (n:C) RETURN CASE WHEN n.v < 2 THEN 'low' WHEN n.v > 2 THEN 'high' ELSE 'mid' END AS cat ORDER BY n.v",
            "cat"
        ),
        vec!["low", "mid", "high"]
    );
}

#[test]
fn test_merge_nodes() {
    let (_dir, db) = open();
    db.execute_write("MERGE (n:M {key: 'x'})").unwrap();
    db.execute_write("MERGE (n:M {key: 'x'})").unwrap();
    assert_eq!(ints(&db, "MATCH (n:M {key: 'x'}) RETURN count(n) AS c", "c"), vec![1]);

    db.execute_write("MERGE (n:M {key: 'y'}) ON CREATE SET n.created = true ON MATCH SET n.updated = true").unwrap();
    let first = db.query("MATCH (n:M {key: 'y'}) RETURN n.created, n.updated").unwrap();
    assert_eq!(first.rows[0]["n.created"], Value::Bool(true));
    assert_eq!(first.rows[0]["n.updated"], Value::Null);

    db.execute_write("MERGE (n:M {key: 'y'}) ON CREATE SET n.created = false ON MATCH SET n.updated = true").unwrap();
    let second = db.query("MATCH (n:M {key: 'y'}) RETURN n.created, n.updated").unwrap();
    assert_eq!(second.rows[0]["n.created"], Value::Bool(true));
    assert_eq!(second.rows[0]["n.updated"], Value::Bool(true));
}

#[test]
fn test_merge_relationship_is_not_duplicated() {
    let (_dir, db) = open();
    db.execute_write("CREATE (:MA {id: 1}), (:MB {id: 2})").unwrap();
    db.execute_write("MATCH (a:MA), (b:MB) MERGE (a)-[:LINK]->(b)").unwrap();
    db.execute_write("MATCH (a:MA), (b:MB) MERGE (a)-[:LINK]->(b)").unwrap();
    assert_eq!(ints(&db, "MATCH (:MA)-[r:LINK]->(:MB) RETURN count(r) AS c", "c"), vec![1]);

    // Repeated MERGE inside one statement sees its own earlier writes
    db.execute_write("UNWIND [1, 2, 3] AS i MERGE (:Once {key: 'k'})").unwrap();
    assert_eq!(ints(&db, "MATCH (n:Once) RETURN count(n) AS c", "c"), vec![1]);
}

#[test]
fn test_foreach() {
    let (_dir, db) = open();
    db.execute_write("FOREACH (i IN [1, 2, 3] | CREATE (:FE {idx: i}))").unwrap();
    assert_eq!(ints(&db, "MATCH (n:FE) RETURN n.idx ORDER BY n.idx", "n.idx"), vec![1, 2, 3]);

    db.execute_write("MATCH (n:FE) WITH collect(n) AS nodes FOREACH (x IN nodes | SET x.seen = true)").unwrap();
    assert_eq!(db.query("MATCH (n:FE) WHERE n.seen RETURN n").unwrap().len(), 3);
    assert!(db.execute_write("FOREACH (i IN [1] | MATCH (n) RETURN n)").is_err());
}

#[test]
fn test_directions() {
    let (_dir, db) = open();
    db.execute_write("CREATE (a:D {name: 'A'})-[:TO]->(b:D {name: 'B'})").unwrap();
    assert_eq!(strings(&db, "MATCH (a:D {name: 'A'})-[:TO]->(b) RETURN b.name", "b.name"), vec!["B"]);
    assert_eq!(strings(&db, "MATCH (b:D {name: 'B'})<-[:TO]-(a) RETURN a.name", "a.name"), vec!["A"]);
    assert_eq!(strings(&db, "MATCH (a:D {name: 'A'})-[:TO]-(b) RETURN b.name", "b.name"), vec!["B"]);
    assert!(db.query("MATCH (a:D {name: 'A'})<-[:TO]-(b) RETURN b").unwrap().is_empty());
    assert_eq!(db.query("MATCH (a:D)-[:TO]-(b:D) RETURN a, b").unwrap().len(), 2);
}

#[test]
fn test_relationship_properties_in_pattern() {
    let (_dir, db) = open();
    db.execute_write("CREATE (:RP {id: 1})-[:EDGE {weight: 0.5, label: 'test'}]->(:RP {id: 2})").unwrap();
    db.execute_write("CREATE (:RP {id: 3})-[:EDGE {weight: 2.0}]->(:RP {id: 4})").unwrap();
    let result = db.query("MATCH (a)-[r:EDGE {label: 'test'}]->(b) RETURN r, a.id AS a").unwrap();
    assert_eq!(result.len(), 1);
    let rel = result.single("r").and_then(Value::as_relationship).unwrap();
    assert_eq!(rel.get_property("weight").and_then(|v| v.as_float()), Some(0.5));
    assert_eq!(result.single("a"), Some(&Value::Int(1)));
}

#[test]
fn test_triangle_and_multi_hop() {
    let (_dir, db) = open();
    db.execute_write("CREATE (a:T {name: 'a'})-[:E]->(b:T {name: 'b'})-[:E]->(c:T {name: 'c'})-[:E]->(a)").unwrap();
    let triangles = db.query("MATCH (a:T)-[:E]->(b:T)-[:E]->(c:T)-[:E]->(a) RETURN a.name, b.name, c.name").unwrap();
    assert_eq!(triangles.len(), 3);

    db.execute_write("CREATE (:H {lv: 0})-[:STEP]->(:H {lv: 1})-[:STEP]->(:H {lv: 2})-[:STEP]->(:H {lv: 3})").unwrap();
    let hops = ints(&db, "MATCH (a:H {lv: 0})-[:STEP]->(b)-[:STEP]->(c) RETURN b.lv, c.lv", "b.lv");
    assert_eq!(hops, vec![1]);
}

#[test]
fn test_multiple_match_clauses() {
    let (_dir, db) = open();
    db.execute_write("CREATE (:MM {id: 'x'}), (:MM {id: 'y'})").unwrap();
    let result = db.query("MATCH (a:MM {id: 'x'}) MATCH (b:MM {id: 'y'}) RETURN a.id, b.id").unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.rows[0]["a.id"], Value::from("x"));
    assert_eq!(result.rows[0]["b.id"], Value::from("y"));

    // Cartesian product
    assert_eq!(db.query("MATCH (a:MM), (b:MM) RETURN a, b").unwrap().len(), 4);
}

fn chain(db: &Db) {
    db.execute_write(
        "CREATE (a:V {name: 'A'})-[:NEXT]->(b:V {name: 'B'})-[:NEXT]->(c:V {name: 'C'})-[:NEXT]->(d:V {name: 'D'})",
    )
    .unwrap();
}

#[test]
fn test_variable_length_paths() {
    let (_dir, db) = open();
    chain(&db);
    assert_eq!(strings(&db, "MATCH (a:V {name: 'A'})-[:NEXT*2]->(c) RETURN c.name", "c.name"), vec!["C"]);
    assert_eq!(
        strings(&db, "MATCH (a:V {name: 'A'})-[:NEXT*1..3]->(x) RETURN x.name ORDER BY x.name", "x.name"),
        vec!["B", "C", "D"]
    );
    assert_eq!(
        strings(&db, "MATCH (a:V {name: 'A'})-[:NEXT*..2]->(x) RETURN x.name ORDER BY x.name", "x.name"),
        vec!["B", "C"]
    );
    assert_eq!(
        strings(&db, "MATCH (a:V {name: 'A'})-[:NEXT*2..]->(x) RETURN x.name ORDER BY x.name", "x.name"),
        vec!["C", "D"]
    );
    assert_eq!(
        strings(&db, "MATCH (a:V {name: 'A'})-[:NEXT*0..1]->(x) RETURN x.name ORDER BY x.name", "x.name"),
        vec!["A", "B"]
    );

    let rels = db.query("MATCH (:V {name: 'A'})-[r:NEXT*3]->() RETURN size(r) AS hops").unwrap();
    assert_eq!(rels.single("hops"), Some(&Value::Int(3)));
}

#[test]
fn test_named_path() {
    let (_dir, db) = open();
    chain(&db);
    let result = db
        .query("MATCH p = (a:V {name: 'A'})-[:NEXT]->(b)-[:NEXT*]->(d:V {name: 'D'}) RETURN p, length(p) AS len")
        .unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.single("len"), Some(&Value::Int(3)));
    let path = result.single("p").and_then(Value::as_path).unwrap();
    assert_eq!(path.nodes.len(), 4);
    assert_eq!(path.relationships.len(), 3);
    assert_eq!(path.nodes[3].get_property("name").and_then(|v| v.as_string()), Some("D"));
}

#[test]
fn test_shortest_path() {
    let (_dir, db) = open();
    chain(&db);
    db.execute_write("MATCH (a:V {name: 'A'}), (c:V {name: 'C'}) CREATE (a)-[:NEXT]->(c)").unwrap();

    let result = db
        .query("MATCH p = shortestPath((a:V {name: 'A'})-[:NEXT*]->(d:V {name: 'D'})) RETURN length(p) AS len")
        .unwrap();
    assert_eq!(result.single("len"), Some(&Value::Int(2)));

    let none = db
        .query("MATCH p = shortestPath((d:V {name: 'D'})-[:NEXT*]->(a:V {name: 'A'})) RETURN p")
        .unwrap();
    assert!(none.is_empty());

    let err = db
        .query("MATCH p = allShortestPaths((a:V {name: 'A'})-[:NEXT*]->(d:V {name: 'D'})) RETURN p")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compatibility);
}

#[test]
fn test_exists_subquery() {
    let (_dir, db) = open();
    db.execute_write("CREATE (a:E {name: 'has-rel'})-[:R]->(b:E {name: 'target'})").unwrap();
    db.execute_write("CREATE (:E {name: 'no-rel'})").unwrap();

    assert_eq!(
        strings(&db, "MATCH (n:E) WHERE EXISTS { (n)-[:R]->() } RETURN n.name", "n.name"),
        vec!["has-rel"]
    );
    assert_eq!(
        strings(&db, "MATCH (n:E) WHERE NOT EXISTS { (n)--() } RETURN n.name", "n.name"),
        vec!["no-rel"]
    );
    assert_eq!(
        strings(
            &db,
            "MATCH (n:E) WHERE EXISTS { MATCH (n)-[:R]->(m) WHERE m.name = 'target' } RETURN n.name",
            "n.name"
        ),
        vec!["has-rel"]
    );
}

#[test]
fn test_procedure_calls() {
    let (_dir, db) = open();
    db.execute_write("CREATE (:A)-[:R]->(:B)").unwrap();

    let result = db.query("CALL db.info()").unwrap();
    assert_eq!(result.columns, vec!["version", "nodes", "relationships"]);
    assert_eq!(result.single("version"), Some(&Value::from(nervusdb::VERSION)));
    assert_eq!(ints(&db, "CALL db.info() YIELD nodes RETURN nodes", "nodes"), vec![2]);
    assert_eq!(ints(&db, "CALL db.info() YIELD relationships AS r RETURN r", "r"), vec![1]);

    let result = db.query("CALL math.add(1, 2) YIELD result RETURN result").unwrap();
    assert_eq!(result.single("result"), Some(&Value::Float(3.0)));

    // Called once per incoming row
    let result = db
        .query("UNWIND [1, 2, 3] AS x CALL math.add(x, 10) YIELD result RETURN x, result ORDER BY x")
        .unwrap();
    assert_eq!(result.column("result"), vec![&Value::Float(11.0), &Value::Float(12.0), &Value::Float(13.0)]);

    let err = db.query("CALL math.add(1) YIELD result RETURN result").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    let err = db.query("CALL math.add('a', 1) YIELD result RETURN result").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    let err = db.query("CALL db.labels() YIELD label RETURN label").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compatibility);
}
